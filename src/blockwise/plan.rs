//! Lowering indexed expressions to block functions.
//!
//! An operation like `out[i, j] = f(a[i, k], b[k, j])` is described by axis
//! labels: shared labels align axes, output-only labels broadcast, and
//! input-only labels are contraction axes over which the kernel receives
//! every block. [`BlockwisePlan`] turns the labelling into a small plan value
//! (coordinate maps plus contraction extents) interpreted by a pure block
//! function; no closures need to cross a worker boundary.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use super::block_function::{ArgDeps, ArrayName, BlockFunction, ChunkKey};

/// A symbolic axis label.
pub type Label = char;

/// One argument of an indexed expression.
#[derive(Clone, Debug)]
pub enum ArgSpec {
    /// An array argument with its per-axis labels.
    Array {
        /// The input array name.
        name: ArrayName,
        /// One label per array axis.
        labels: Vec<Label>,
    },
    /// A non-array argument passed to the kernel unchanged.
    Literal(serde_json::Value),
}

impl ArgSpec {
    /// Create an array argument spec.
    #[must_use]
    pub fn array(name: impl Into<ArrayName>, labels: impl IntoIterator<Item = Label>) -> Self {
        Self::Array {
            name: name.into(),
            labels: labels.into_iter().collect(),
        }
    }
}

/// A lowering error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// Inputs sharing a label disagree on the number of blocks along it.
    #[error("inputs disagree on the number of blocks along axis '{label}' ({lhs} vs {rhs})")]
    IndexMismatch {
        /// The offending label.
        label: Label,
        /// The block count seen first.
        lhs: u64,
        /// The disagreeing block count.
        rhs: u64,
    },
    /// An output label derived from no input and absent from `new_axes`.
    #[error("output axis '{label}' is not carried by any input and is missing from new_axes")]
    UnknownNewAxis {
        /// The offending label.
        label: Label,
    },
    /// Lowering was called without block counts for an input.
    #[error("missing numblocks for input array '{name}'")]
    MissingNumblocks {
        /// The input array name.
        name: ArrayName,
    },
    /// An input's label count does not match its block axes.
    #[error("input array '{name}' has {labels} axis labels but {numblocks} block axes")]
    LabelCountMismatch {
        /// The input array name.
        name: ArrayName,
        /// The number of labels given.
        labels: usize,
        /// The number of block axes.
        numblocks: usize,
    },
}

#[derive(Clone, Debug)]
enum PlannedArg {
    Literal(serde_json::Value),
    Array {
        name: ArrayName,
        /// Positions of this input's axes within `out_coords ++ dummy_coords`.
        coord_map: Vec<usize>,
    },
}

/// The abstract plan of an indexed blockwise expression.
///
/// Implements [`BlockFunction`]: for each output chunk key it emits, per
/// argument, either the literal, a single chunk address, or the nested
/// Cartesian product of the argument's contraction-axis block indices
/// (outer list = outermost contraction axis, indices increasing, innermost
/// axis fastest).
#[derive(Clone, Debug)]
pub struct BlockwisePlan {
    args: Vec<PlannedArg>,
    nout: usize,
    /// Block counts of the contraction axes, in order of first appearance.
    dummy_extents: Vec<u64>,
}

impl BlockwisePlan {
    /// Lower an indexed expression to a plan.
    ///
    /// `out_ind` labels the output axes; `args` are the kernel arguments in
    /// order; `numblocks` gives per-input block counts; `new_axes` declares
    /// block counts for output axes derived from no input.
    ///
    /// # Errors
    /// Returns a [`PlanError`] if the labelling is inconsistent.
    pub fn new(
        out_ind: &[Label],
        args: &[ArgSpec],
        numblocks: &HashMap<ArrayName, Vec<u64>>,
        new_axes: &BTreeMap<Label, u64>,
    ) -> Result<Self, PlanError> {
        // dims: label -> block count, in order of first appearance.
        let mut dims: Vec<(Label, u64)> = Vec::new();
        for arg in args {
            let ArgSpec::Array { name, labels } = arg else {
                continue;
            };
            let nb = numblocks
                .get(name)
                .ok_or_else(|| PlanError::MissingNumblocks { name: name.clone() })?;
            if nb.len() != labels.len() {
                return Err(PlanError::LabelCountMismatch {
                    name: name.clone(),
                    labels: labels.len(),
                    numblocks: nb.len(),
                });
            }
            for (&label, &count) in std::iter::zip(labels, nb) {
                let existing = dims.iter().find(|(l, _)| *l == label).map(|&(_, c)| c);
                match existing {
                    Some(existing) if existing != count => {
                        return Err(PlanError::IndexMismatch {
                            label,
                            lhs: existing,
                            rhs: count,
                        });
                    }
                    Some(_) => {}
                    None => dims.push((label, count)),
                }
            }
        }
        for (&label, &count) in new_axes {
            if !dims.iter().any(|(l, _)| *l == label) {
                dims.push((label, count));
            }
        }
        for &label in out_ind {
            if !dims.iter().any(|(l, _)| *l == label) {
                return Err(PlanError::UnknownNewAxis { label });
            }
        }

        // Contraction axes: labelled on some input but not on the output.
        let dummies: Vec<(Label, u64)> = dims
            .iter()
            .filter(|(label, _)| !out_ind.contains(label))
            .copied()
            .collect();

        let position = |label: Label| -> usize {
            out_ind
                .iter()
                .position(|&l| l == label)
                .unwrap_or_else(|| {
                    out_ind.len()
                        + dummies
                            .iter()
                            .position(|&(l, _)| l == label)
                            .expect("label is on the output or a contraction axis")
                })
        };

        let args = args
            .iter()
            .map(|arg| match arg {
                ArgSpec::Literal(value) => PlannedArg::Literal(value.clone()),
                ArgSpec::Array { name, labels } => PlannedArg::Array {
                    name: name.clone(),
                    coord_map: labels.iter().map(|&label| position(label)).collect(),
                },
            })
            .collect();

        Ok(Self {
            args,
            nout: out_ind.len(),
            dummy_extents: dummies.iter().map(|&(_, count)| count).collect(),
        })
    }

    /// The per-array fan-in: for each array argument, the product of the
    /// block counts of the contraction axes it carries (`1` for pointwise).
    #[must_use]
    pub fn num_input_blocks(&self) -> Vec<u64> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                PlannedArg::Literal(_) => None,
                PlannedArg::Array { coord_map, .. } => Some(
                    coord_map
                        .iter()
                        .filter(|&&position| position >= self.nout)
                        .map(|&position| self.dummy_extents[position - self.nout])
                        .product(),
                ),
            })
            .collect()
    }

    /// Wrap the plan so nested contraction products are flattened to a flat
    /// chunk sequence.
    #[must_use]
    pub fn flattened(self) -> FlattenedBlockwisePlan {
        FlattenedBlockwisePlan { inner: self }
    }

    fn arg_deps(&self, arg: &PlannedArg, out_key: &[u64]) -> ArgDeps {
        match arg {
            PlannedArg::Literal(value) => ArgDeps::Literal(value.clone()),
            PlannedArg::Array { name, coord_map } => {
                let coords: Vec<AxisCoord> = coord_map
                    .iter()
                    .map(|&position| {
                        if position < self.nout {
                            AxisCoord::Fixed(out_key[position])
                        } else {
                            AxisCoord::Contract(self.dummy_extents[position - self.nout])
                        }
                    })
                    .collect();
                nested_product(name, &coords)
            }
        }
    }
}

impl BlockFunction for BlockwisePlan {
    fn block_deps(&self, out_key: &[u64]) -> Vec<ArgDeps> {
        debug_assert_eq!(out_key.len(), self.nout);
        self.args
            .iter()
            .map(|arg| self.arg_deps(arg, out_key))
            .collect()
    }
}

#[derive(Clone, Copy, Debug)]
enum AxisCoord {
    Fixed(u64),
    Contract(u64),
}

/// Build the nested list-of-lists over the contraction axes of one argument.
fn nested_product(name: &ArrayName, coords: &[AxisCoord]) -> ArgDeps {
    let contract = coords
        .iter()
        .position(|coord| matches!(coord, AxisCoord::Contract(_)));
    match contract {
        None => ArgDeps::Chunk(ChunkKey::new(
            name.clone(),
            coords
                .iter()
                .map(|coord| match coord {
                    AxisCoord::Fixed(index) => *index,
                    AxisCoord::Contract(_) => unreachable!(),
                })
                .collect(),
        )),
        Some(axis) => {
            let AxisCoord::Contract(extent) = coords[axis] else {
                unreachable!()
            };
            ArgDeps::Nested(
                (0..extent)
                    .map(|index| {
                        let mut fixed = coords.to_vec();
                        fixed[axis] = AxisCoord::Fixed(index);
                        nested_product(name, &fixed)
                    })
                    .collect(),
            )
        }
    }
}

/// A plan wrapper that flattens nested contraction products.
///
/// When any argument fans over contraction axes, every argument entry is
/// replaced by the flat in-order sequence of its leaf chunk addresses, one
/// kernel argument per block. Pointwise expressions are returned unchanged,
/// so for a pointwise kernel this wrapper is the identity.
#[derive(Clone, Debug)]
pub struct FlattenedBlockwisePlan {
    inner: BlockwisePlan,
}

impl BlockFunction for FlattenedBlockwisePlan {
    fn block_deps(&self, out_key: &[u64]) -> Vec<ArgDeps> {
        let deps = self.inner.block_deps(out_key);
        if deps.iter().any(|dep| matches!(dep, ArgDeps::Nested(_))) {
            deps.iter()
                .flat_map(|dep| match dep {
                    ArgDeps::Literal(value) => vec![ArgDeps::Literal(value.clone())],
                    other => other
                        .chunk_leaves()
                        .into_iter()
                        .map(ArgDeps::Chunk)
                        .collect(),
                })
                .collect()
        } else {
            deps
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn numblocks(entries: &[(&str, &[u64])]) -> HashMap<ArrayName, Vec<u64>> {
        entries
            .iter()
            .map(|(name, nb)| ((*name).to_string(), nb.to_vec()))
            .collect()
    }

    fn leaves(dep: &ArgDeps) -> Vec<(String, Vec<u64>)> {
        dep.chunk_leaves()
            .into_iter()
            .map(|key| (key.name, key.coords))
            .collect()
    }

    #[test]
    fn pointwise_two_inputs() {
        let plan = BlockwisePlan::new(
            &['i'],
            &[ArgSpec::array("a", ['i']), ArgSpec::array("b", ['i'])],
            &numblocks(&[("a", &[2]), ("b", &[2])]),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(plan.num_input_blocks(), vec![1, 1]);

        let deps = plan.block_deps(&[0]);
        assert_eq!(deps.len(), 2);
        assert_eq!(leaves(&deps[0]), vec![("a".to_string(), vec![0])]);
        assert_eq!(leaves(&deps[1]), vec![("b".to_string(), vec![0])]);

        let deps = plan.block_deps(&[1]);
        assert_eq!(leaves(&deps[0]), vec![("a".to_string(), vec![1])]);
        assert_eq!(leaves(&deps[1]), vec![("b".to_string(), vec![1])]);
    }

    #[test]
    fn matmul_contraction() {
        // out[i, j] = sum_k a[i, k] * b[k, j], two blocks along k.
        let plan = BlockwisePlan::new(
            &['i', 'j'],
            &[ArgSpec::array("a", ['i', 'k']), ArgSpec::array("b", ['k', 'j'])],
            &numblocks(&[("a", &[2, 2]), ("b", &[2, 2])]),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(plan.num_input_blocks(), vec![2, 2]);

        let deps = plan.block_deps(&[0, 0]);
        let ArgDeps::Nested(a) = &deps[0] else {
            panic!("expected a nested contraction for a");
        };
        assert_eq!(a.len(), 2);
        assert_eq!(
            leaves(&deps[0]),
            vec![
                ("a".to_string(), vec![0, 0]),
                ("a".to_string(), vec![0, 1])
            ]
        );
        assert_eq!(
            leaves(&deps[1]),
            vec![
                ("b".to_string(), vec![0, 0]),
                ("b".to_string(), vec![1, 0])
            ]
        );
    }

    #[test]
    fn two_contraction_axes_nest_outermost_first() {
        // out[i] = f(a[i, k, l]) with 2 blocks along k and 3 along l.
        let plan = BlockwisePlan::new(
            &['i'],
            &[ArgSpec::array("a", ['i', 'k', 'l'])],
            &numblocks(&[("a", &[2, 2, 3])]),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(plan.num_input_blocks(), vec![6]);

        let deps = plan.block_deps(&[1]);
        let ArgDeps::Nested(outer) = &deps[0] else {
            panic!("expected nesting over k");
        };
        assert_eq!(outer.len(), 2);
        let ArgDeps::Nested(inner) = &outer[0] else {
            panic!("expected nesting over l");
        };
        assert_eq!(inner.len(), 3);
        // Innermost axis varies fastest.
        assert_eq!(
            leaves(&deps[0]),
            vec![
                ("a".to_string(), vec![1, 0, 0]),
                ("a".to_string(), vec![1, 0, 1]),
                ("a".to_string(), vec![1, 0, 2]),
                ("a".to_string(), vec![1, 1, 0]),
                ("a".to_string(), vec![1, 1, 1]),
                ("a".to_string(), vec![1, 1, 2]),
            ]
        );
    }

    #[test]
    fn new_axis_broadcast() {
        let plan = BlockwisePlan::new(
            &['0', 'i'],
            &[ArgSpec::array("x", ['i'])],
            &numblocks(&[("x", &[2])]),
            &BTreeMap::from([('0', 1)]),
        )
        .unwrap();
        let deps = plan.block_deps(&[0, 1]);
        assert_eq!(deps.len(), 1);
        assert_eq!(leaves(&deps[0]), vec![("x".to_string(), vec![1])]);
    }

    #[test]
    fn literal_arguments_pass_through() {
        let plan = BlockwisePlan::new(
            &['i'],
            &[
                ArgSpec::array("x", ['i']),
                ArgSpec::Literal(serde_json::json!(2.5)),
            ],
            &numblocks(&[("x", &[3])]),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(plan.num_input_blocks(), vec![1]);
        let deps = plan.block_deps(&[2]);
        assert_eq!(deps.len(), 2);
        assert!(matches!(&deps[1], ArgDeps::Literal(v) if v == &serde_json::json!(2.5)));
    }

    #[test]
    fn index_mismatch() {
        let err = BlockwisePlan::new(
            &['i'],
            &[ArgSpec::array("a", ['i']), ArgSpec::array("b", ['i'])],
            &numblocks(&[("a", &[2]), ("b", &[3])]),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::IndexMismatch {
                label: 'i',
                lhs: 2,
                rhs: 3
            }
        );
    }

    #[test]
    fn unknown_new_axis() {
        let err = BlockwisePlan::new(
            &['i', 'j'],
            &[ArgSpec::array("x", ['i'])],
            &numblocks(&[("x", &[2])]),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert_eq!(err, PlanError::UnknownNewAxis { label: 'j' });
    }

    #[test]
    fn missing_numblocks() {
        let err = BlockwisePlan::new(
            &['i'],
            &[ArgSpec::array("x", ['i'])],
            &HashMap::new(),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::MissingNumblocks {
                name: "x".to_string()
            }
        );
    }

    #[test]
    fn label_count_mismatch() {
        let err = BlockwisePlan::new(
            &['i'],
            &[ArgSpec::array("x", ['i', 'j'])],
            &numblocks(&[("x", &[2])]),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::LabelCountMismatch { .. }));
    }

    #[test]
    fn flattened_expands_contraction() {
        let plan = BlockwisePlan::new(
            &['i', 'j'],
            &[ArgSpec::array("a", ['i', 'k']), ArgSpec::array("b", ['k', 'j'])],
            &numblocks(&[("a", &[1, 2]), ("b", &[2, 1])]),
            &BTreeMap::new(),
        )
        .unwrap()
        .flattened();
        let deps = plan.block_deps(&[0, 0]);
        assert_eq!(
            deps.iter().map(leaves).collect::<Vec<_>>(),
            vec![
                vec![("a".to_string(), vec![0, 0])],
                vec![("a".to_string(), vec![0, 1])],
                vec![("b".to_string(), vec![0, 0])],
                vec![("b".to_string(), vec![1, 0])],
            ]
        );
    }

    #[test]
    fn flattened_is_identity_for_pointwise() {
        let plan = BlockwisePlan::new(
            &['i'],
            &[ArgSpec::array("a", ['i'])],
            &numblocks(&[("a", &[2])]),
            &BTreeMap::new(),
        )
        .unwrap()
        .flattened();
        let deps = plan.block_deps(&[0]);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].as_chunk().unwrap(), &ChunkKey::new("a", vec![0]));
    }

    #[test]
    fn deps_match_expected_structure() {
        // The full nested structure for a matmul output chunk.
        let plan = BlockwisePlan::new(
            &['i', 'j'],
            &[ArgSpec::array("a", ['i', 'k']), ArgSpec::array("b", ['k', 'j'])],
            &numblocks(&[("a", &[2, 2]), ("b", &[2, 2])]),
            &BTreeMap::new(),
        )
        .unwrap();
        let deps = plan.block_deps(&[0, 0]);
        let ArgDeps::Nested(a_items) = &deps[0] else {
            panic!()
        };
        assert!(
            matches!(&a_items[0], ArgDeps::Chunk(key) if key == &ChunkKey::new("a", vec![0, 0]))
        );
        assert!(
            matches!(&a_items[1], ArgDeps::Chunk(key) if key == &ChunkKey::new("a", vec![0, 1]))
        );
    }
}
