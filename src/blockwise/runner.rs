//! The per-task blockwise runner.
//!
//! [`apply_blockwise`] executes one task: it resolves the output chunk key
//! through the spec's block function, reads the input chunks (lazily for
//! fused fan-in sequences), invokes the kernel, and writes each output value
//! into its target chunk slice.

use thiserror::Error;

use crate::kernel::{BackendBridge, BlockArg, BlockStream, BlockValue, KernelError};
use crate::storage::{ReadableArrayTraits, StorageError, WritableArrayTraits};

use super::block_function::{ArgDeps, ArrayName, BlockFunction, ChunkKey};
use super::BlockwiseSpec;

/// A task execution error.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// An input chunk could not be read. The runtime may retry the task.
    #[error("failed to read an input chunk: {0}")]
    Read(#[source] StorageError),
    /// An output chunk could not be written. Fatal for the task.
    #[error("failed to write an output chunk: {0}")]
    Write(#[source] StorageError),
    /// The kernel failed. Fatal for the task.
    #[error(transparent)]
    Kernel(KernelError),
    /// The block function referenced an input the spec does not read.
    #[error("block function referenced unknown input array '{0}'")]
    UnknownInput(ArrayName),
    /// A chunk key outside its array's chunk grid.
    #[error("chunk key {0} is outside its array's chunk grid")]
    InvalidChunkKey(ChunkKey),
    /// An output key outside the target's chunk grid.
    #[error("output key {key:?} is outside the target chunk grid")]
    InvalidOutputKey {
        /// The offending key.
        key: Vec<u64>,
    },
    /// The kernel produced a different number of outputs than the operation
    /// has targets.
    #[error("kernel produced {produced} outputs, operation writes {expected}")]
    OutputCountMismatch {
        /// The number of outputs produced.
        produced: usize,
        /// The number of write targets.
        expected: usize,
    },
}

impl ApplyError {
    /// Returns true if the runtime may retry the task.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Read(_))
    }
}

/// Classify a kernel error: storage errors pulled through a lazy argument
/// are chunk reads and stay retriable.
fn from_kernel_error(err: KernelError) -> ApplyError {
    match err {
        KernelError::Storage(err) => ApplyError::Read(err),
        other => ApplyError::Kernel(other),
    }
}

fn to_kernel_error(err: ApplyError) -> KernelError {
    match err {
        ApplyError::Read(err) | ApplyError::Write(err) => KernelError::Storage(err),
        ApplyError::Kernel(err) => err,
        other => KernelError::InvalidArgument(other.to_string()),
    }
}

/// Run one blockwise task: read the input chunks for `out_key`, apply the
/// kernel, and write the outputs.
///
/// # Errors
/// Returns an [`ApplyError`]; only [`ApplyError::Read`] is retriable.
pub fn apply_blockwise(out_key: &[u64], config: &BlockwiseSpec) -> Result<(), ApplyError> {
    let deps = config.block_function.block_deps(out_key);
    let mut args = Vec::with_capacity(deps.len());
    for dep in deps {
        args.push(materialize_arg(dep, config)?);
    }

    let results = config
        .function
        .outputs(args)
        .map_err(from_kernel_error)?;
    if results.len() != config.writes_list.len() {
        return Err(ApplyError::OutputCountMismatch {
            produced: results.len(),
            expected: config.writes_list.len(),
        });
    }

    for (result, proxy) in std::iter::zip(results, &config.writes_list) {
        let ranges = proxy
            .chunk_grid()
            .key_to_ranges(out_key)
            .ok_or_else(|| ApplyError::InvalidOutputKey {
                key: out_key.to_vec(),
            })?;
        let array = proxy.open().map_err(ApplyError::Write)?;
        match result {
            BlockValue::Dense(block) => {
                let block = config
                    .bridge
                    .kernel_to_store(block)
                    .map_err(ApplyError::Kernel)?;
                array
                    .store_ranges(&ranges, &block)
                    .map_err(ApplyError::Write)?;
            }
            BlockValue::Fields(fields) => {
                for (field, block) in fields {
                    let block = config
                        .bridge
                        .kernel_to_store(block)
                        .map_err(ApplyError::Kernel)?;
                    array
                        .store_ranges_field(&ranges, &field, &block)
                        .map_err(ApplyError::Write)?;
                }
            }
        }
    }
    Ok(())
}

/// Materialize one argument's chunk addresses into kernel arguments,
/// preserving the nesting shape. Mapped fan-in sequences stay lazy: their
/// chunk reads happen as the kernel pulls.
fn materialize_arg(dep: ArgDeps, config: &BlockwiseSpec) -> Result<BlockArg, ApplyError> {
    match dep {
        ArgDeps::Literal(value) => Ok(BlockArg::Literal(value)),
        ArgDeps::Chunk(key) => read_chunk(&key, config).map(BlockArg::Block),
        ArgDeps::Nested(items) => {
            let mut args = Vec::with_capacity(items.len());
            for item in items {
                args.push(materialize_arg(item, config)?);
            }
            Ok(BlockArg::List(args))
        }
        ArgDeps::Mapped(mapped) => {
            let config = config.clone();
            Ok(BlockArg::Stream(BlockStream::new(
                mapped
                    .into_iter()
                    .map(move |item| materialize_arg(item, &config).map_err(to_kernel_error)),
            )))
        }
    }
}

/// Read the chunk at `key` from the named input and convert it to the
/// kernel representation.
fn read_chunk(key: &ChunkKey, config: &BlockwiseSpec) -> Result<crate::array::Block, ApplyError> {
    let proxy = config
        .reads_map
        .get(&key.name)
        .ok_or_else(|| ApplyError::UnknownInput(key.name.clone()))?;
    let ranges = proxy
        .chunk_grid()
        .key_to_ranges(&key.coords)
        .ok_or_else(|| ApplyError::InvalidChunkKey(key.clone()))?;
    let array = proxy.open().map_err(ApplyError::Read)?;
    let block = array.retrieve_ranges(&ranges).map_err(ApplyError::Read)?;
    config
        .bridge
        .store_to_kernel(block)
        .map_err(ApplyError::Kernel)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::array::{Block, ChunkedArrayRef, DataType, StructuredField};
    use crate::blockwise::{blockwise, BlockwiseInput, BlockwiseOptions};
    use crate::kernel::{BoundKernel, KernelParams};

    use super::*;

    fn memory_array_from(elements: &[f64], chunk: u64) -> ChunkedArrayRef {
        let array = ChunkedArrayRef::memory(
            vec![elements.len() as u64],
            DataType::Float64,
            &[chunk],
        )
        .unwrap();
        let store = array.open().unwrap();
        let block = Block::from_elements(vec![elements.len() as u64], elements).unwrap();
        store.store_ranges(&[0..elements.len() as u64], &block).unwrap();
        array
    }

    fn read_all(array: &ChunkedArrayRef) -> Vec<f64> {
        let store = array.open().unwrap();
        let len = array.shape()[0];
        store
            .retrieve_ranges(&[0..len])
            .unwrap()
            .elements::<f64>()
            .unwrap()
    }

    fn add_kernel() -> BoundKernel {
        BoundKernel::single(|args, _| {
            let mut blocks = args.into_iter().map(BlockArg::into_block);
            let x = blocks.next().unwrap()?;
            let y = blocks.next().unwrap()?;
            let sum: Vec<f64> = std::iter::zip(x.elements::<f64>()?, y.elements::<f64>()?)
                .map(|(a, b)| a + b)
                .collect();
            Ok(BlockValue::Dense(Block::from_elements(
                x.shape().to_vec(),
                &sum,
            )?))
        })
    }

    fn run_all(op: &crate::blockwise::PrimitiveOperation) {
        for key in op.pipeline().mappable().iter() {
            op.pipeline()
                .function()
                .call(&key, op.pipeline().config())
                .unwrap();
        }
    }

    #[test]
    fn pointwise_add() {
        let a = memory_array_from(&[1.0, 2.0, 3.0, 4.0], 2);
        let b = memory_array_from(&[10.0, 20.0, 30.0, 40.0], 2);
        let out = ChunkedArrayRef::memory(vec![4], DataType::Float64, &[2]).unwrap();

        let op = blockwise(
            add_kernel(),
            &['i'],
            vec![
                BlockwiseInput::array("a", a, ['i']),
                BlockwiseInput::array("b", b, ['i']),
            ],
            &BTreeMap::new(),
            out.clone(),
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        assert_eq!(op.num_tasks(), 2);
        run_all(&op);
        assert_eq!(read_all(&out), vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn ragged_last_chunk() {
        let a = memory_array_from(&[1.0, 2.0, 3.0, 4.0, 5.0], 2);
        let b = memory_array_from(&[1.0, 1.0, 1.0, 1.0, 1.0], 2);
        let out = ChunkedArrayRef::memory(vec![5], DataType::Float64, &[2]).unwrap();

        let op = blockwise(
            add_kernel(),
            &['i'],
            vec![
                BlockwiseInput::array("a", a, ['i']),
                BlockwiseInput::array("b", b, ['i']),
            ],
            &BTreeMap::new(),
            out.clone(),
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        assert_eq!(op.num_tasks(), 3);
        run_all(&op);
        assert_eq!(read_all(&out), vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn matmul_contraction() {
        // A: (4, 6) chunked (2, 3); B: (6, 4) chunked (3, 2); out (4, 4)
        // chunked (2, 2). Identity-patterned inputs keep the expectation
        // simple: A is all ones, B is the column index.
        let a = ChunkedArrayRef::memory(vec![4, 6], DataType::Float64, &[2, 3]).unwrap();
        let a_store = a.open().unwrap();
        a_store
            .store_ranges(
                &[0..4, 0..6],
                &Block::from_elements(vec![4, 6], &[1.0f64; 24]).unwrap(),
            )
            .unwrap();
        let b = ChunkedArrayRef::memory(vec![6, 4], DataType::Float64, &[3, 2]).unwrap();
        let b_elements: Vec<f64> = (0..24).map(|i| (i % 4) as f64).collect();
        let b_store = b.open().unwrap();
        b_store
            .store_ranges(
                &[0..6, 0..4],
                &Block::from_elements(vec![6, 4], &b_elements).unwrap(),
            )
            .unwrap();
        let out = ChunkedArrayRef::memory(vec![4, 4], DataType::Float64, &[2, 2]).unwrap();

        // Sum-of-products over the k fan-in lists.
        let matmul = BoundKernel::single(|args, _| {
            let mut args = args.into_iter();
            let a_blocks = args.next().unwrap().into_stream()?;
            let b_blocks = args.next().unwrap().into_stream()?;
            let mut acc: Option<Block> = None;
            for (a_item, b_item) in std::iter::zip(a_blocks, b_blocks) {
                let a_block = a_item?.into_block()?;
                let b_block = b_item?.into_block()?;
                let (m, k) = (a_block.shape()[0] as usize, a_block.shape()[1] as usize);
                let n = b_block.shape()[1] as usize;
                let a_elements = a_block.elements::<f64>()?;
                let b_elements = b_block.elements::<f64>()?;
                let mut product = match &acc {
                    Some(block) => block.elements::<f64>()?,
                    None => vec![0.0; m * n],
                };
                for i in 0..m {
                    for j in 0..n {
                        for l in 0..k {
                            product[i * n + j] += a_elements[i * k + l] * b_elements[l * n + j];
                        }
                    }
                }
                acc = Some(Block::from_elements(
                    vec![m as u64, n as u64],
                    &product,
                )?);
            }
            Ok(BlockValue::Dense(acc.expect("nonempty contraction")))
        });

        let op = blockwise(
            matmul,
            &['i', 'j'],
            vec![
                BlockwiseInput::array("a", a, ['i', 'k']),
                BlockwiseInput::array("b", b, ['k', 'j']),
            ],
            &BTreeMap::new(),
            out.clone(),
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        assert_eq!(op.num_tasks(), 4);
        run_all(&op);

        // Each output element is sum over 6 rows of ones * column value.
        let store = out.open().unwrap();
        let result = store
            .retrieve_ranges(&[0..4, 0..4])
            .unwrap()
            .elements::<f64>()
            .unwrap();
        let expected: Vec<f64> = (0..16).map(|i| 6.0 * (i % 4) as f64).collect();
        assert_eq!(result, expected);
    }

    #[test]
    fn new_axis() {
        let x = memory_array_from(&[1.0, 2.0, 3.0, 4.0], 2);
        let out = ChunkedArrayRef::memory(vec![1, 4], DataType::Float64, &[1, 2]).unwrap();

        let expand = BoundKernel::single(|mut args, _| {
            let block = args.remove(0).into_block()?;
            let elements = block.elements::<f64>()?;
            Ok(BlockValue::Dense(Block::from_elements(
                vec![1, block.shape()[0]],
                &elements,
            )?))
        });

        let op = blockwise(
            expand,
            &['0', 'i'],
            vec![BlockwiseInput::array("x", x, ['i'])],
            &BTreeMap::from([('0', 1)]),
            out.clone(),
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        assert_eq!(op.num_tasks(), 2);
        let keys: Vec<_> = op.pipeline().mappable().iter().collect();
        assert_eq!(keys, vec![vec![0, 0], vec![0, 1]]);
        run_all(&op);

        let store = out.open().unwrap();
        let result = store
            .retrieve_ranges(&[0..1, 0..4])
            .unwrap()
            .elements::<f64>()
            .unwrap();
        assert_eq!(result, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn bound_params_reach_kernel() {
        let x = memory_array_from(&[1.0, 2.0], 2);
        let out = ChunkedArrayRef::memory(vec![2], DataType::Float64, &[2]).unwrap();

        let scale = BoundKernel::single(|mut args, params: &KernelParams| {
            let factor = params["factor"].as_f64().unwrap_or(1.0);
            let block = args.remove(0).into_block()?;
            let scaled: Vec<f64> = block.elements::<f64>()?.iter().map(|v| v * factor).collect();
            Ok(BlockValue::Dense(Block::from_elements(
                block.shape().to_vec(),
                &scaled,
            )?))
        })
        .with_params({
            let mut params = KernelParams::new();
            params.insert("factor".to_string(), 10.0.into());
            params
        });

        let op = blockwise(
            scale,
            &['i'],
            vec![BlockwiseInput::array("x", x, ['i'])],
            &BTreeMap::new(),
            out.clone(),
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        run_all(&op);
        assert_eq!(read_all(&out), vec![10.0, 20.0]);
    }

    #[test]
    fn multi_output_generator_kernel() {
        let x = memory_array_from(&[1.0, 2.0, 3.0, 4.0], 2);
        let out_lo = ChunkedArrayRef::memory(vec![4], DataType::Float64, &[2]).unwrap();
        let out_hi = ChunkedArrayRef::memory(vec![4], DataType::Float64, &[2]).unwrap();

        let split = BoundKernel::multi_yield(|mut args, _| {
            let block = args.remove(0).into_block()?;
            let elements = block.elements::<f64>()?;
            let lo: Vec<f64> = elements.iter().map(|v| v - 0.5).collect();
            let hi: Vec<f64> = elements.iter().map(|v| v + 0.5).collect();
            Ok(vec![
                BlockValue::Dense(Block::from_elements(block.shape().to_vec(), &lo)?),
                BlockValue::Dense(Block::from_elements(block.shape().to_vec(), &hi)?),
            ])
        });

        let plan = crate::blockwise::BlockwisePlan::new(
            &['i'],
            &[crate::blockwise::ArgSpec::array("x", ['i'])],
            &std::collections::HashMap::from([("x".to_string(), vec![2])]),
            &BTreeMap::new(),
        )
        .unwrap();
        let op = crate::blockwise::general_blockwise(
            split,
            std::sync::Arc::new(plan),
            vec![("x".to_string(), x)],
            vec![out_lo.clone(), out_hi.clone()],
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        run_all(&op);

        assert_eq!(read_all(&out_lo), vec![0.5, 1.5, 2.5, 3.5]);
        assert_eq!(read_all(&out_hi), vec![1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn structured_field_output() {
        let x = memory_array_from(&[1.0, 2.0, 3.0, 4.0], 2);
        let data_type = DataType::Structured(vec![
            StructuredField::new("value", DataType::Float64),
            StructuredField::new("doubled", DataType::Float64),
        ]);
        let out =
            ChunkedArrayRef::memory(vec![4], data_type, &[2]).unwrap();

        let fields = BoundKernel::single(|mut args, _| {
            let block = args.remove(0).into_block()?;
            let elements = block.elements::<f64>()?;
            let doubled: Vec<f64> = elements.iter().map(|v| v * 2.0).collect();
            Ok(BlockValue::Fields(vec![
                (
                    "value".to_string(),
                    Block::from_elements(block.shape().to_vec(), &elements)?,
                ),
                (
                    "doubled".to_string(),
                    Block::from_elements(block.shape().to_vec(), &doubled)?,
                ),
            ]))
        });

        let op = blockwise(
            fields,
            &['i'],
            vec![BlockwiseInput::array("x", x, ['i'])],
            &BTreeMap::new(),
            out.clone(),
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        run_all(&op);

        let store = out.open().unwrap();
        let raw = store.retrieve_ranges(&[0..4]).unwrap();
        let bytes = raw.bytes();
        let element = |i: usize, offset: usize| {
            f64::from_ne_bytes(bytes[i * 16 + offset..i * 16 + offset + 8].try_into().unwrap())
        };
        for i in 0..4 {
            assert_eq!(element(i, 0), (i + 1) as f64);
            assert_eq!(element(i, 8), 2.0 * (i + 1) as f64);
        }
    }

    #[test]
    fn kernel_failure_is_fatal() {
        let x = memory_array_from(&[1.0, 2.0], 2);
        let out = ChunkedArrayRef::memory(vec![2], DataType::Float64, &[2]).unwrap();

        let failing = BoundKernel::single(|_, _| Err(KernelError::from("boom")));
        let op = blockwise(
            failing,
            &['i'],
            vec![BlockwiseInput::array("x", x, ['i'])],
            &BTreeMap::new(),
            out,
            BlockwiseOptions::new(1 << 20),
        )
        .unwrap();
        let err = op
            .pipeline()
            .function()
            .call(&[0], op.pipeline().config())
            .unwrap_err();
        assert!(matches!(err, ApplyError::Kernel(_)));
        assert!(!err.is_retriable());
    }
}
