//! Blockwise fusion.
//!
//! Fusion rewrites a chain or fan of blockwise operations into a single
//! [`PrimitiveOperation`] whose execution yields the same target array
//! without materializing the intermediate targets. The decision functions
//! never fail; they return `false` with the reason logged.

use std::sync::Arc;

use log::debug;

use crate::kernel::{BlockArg, BlockStream, BoundKernel, KernelError, KernelOutput};
use crate::memory::{chunk_memory, MemoryModeller};

use super::block_function::{ArgDeps, BlockFunction, MappedDeps};
use super::{
    gensym, BlockwisePipeline, BlockwiseSpec, PrimitiveOperation, TaskFunction,
};

/// Returns true if an operation is a candidate for blockwise fusion: its
/// per-task function is the standard blockwise runner and has not been
/// substituted.
#[must_use]
pub fn is_fuse_candidate(op: &PrimitiveOperation) -> bool {
    op.pipeline.function.is_blockwise()
}

/// Returns true if `op1` and `op2` may be fused pairwise: both candidates
/// with pointwise-aligned task counts.
#[must_use]
pub fn can_fuse_pair(op1: &PrimitiveOperation, op2: &PrimitiveOperation) -> bool {
    if is_fuse_candidate(op1) && is_fuse_candidate(op2) {
        return op1.num_tasks == op2.num_tasks;
    }
    false
}

/// Returns true if `op` may be fused with its immediate predecessors.
///
/// `predecessors` is aligned to the consumer's argument slots; `None` means
/// the slot reads an original array and stays as is. `name` identifies the
/// operation in log output.
#[must_use]
pub fn can_fuse_multiple(
    name: &str,
    op: &PrimitiveOperation,
    predecessors: &[Option<&PrimitiveOperation>],
    max_total_num_input_blocks: Option<u64>,
) -> bool {
    if !is_fuse_candidate(op)
        || !predecessors
            .iter()
            .flatten()
            .all(|p| is_fuse_candidate(p))
    {
        debug!("can't fuse {name} since primitive op and predecessors are not all candidates");
        return false;
    }

    // If the peak projected memory for running all the predecessor ops in
    // order is larger than allowed_mem then we can't fuse.
    let peak_projected = peak_projected_mem(predecessors.iter().flatten().copied());
    if peak_projected > op.allowed_mem {
        debug!(
            "can't fuse {name} since peak projected memory for predecessor ops ({peak_projected}) \
             is greater than allowed ({})",
            op.allowed_mem
        );
        return false;
    }

    let num_input_blocks = &op.pipeline.config.num_input_blocks;
    if !num_input_blocks
        .iter()
        .all(|n| Some(n) == num_input_blocks.first())
    {
        debug!(
            "can't fuse {name} since number of input blocks for each input is not uniform: \
             {num_input_blocks:?}"
        );
        return false;
    }

    match max_total_num_input_blocks {
        None => {
            // Only fuse if the task counts of the predecessor ops match.
            let ret = predecessors
                .iter()
                .flatten()
                .all(|p| p.num_tasks == op.num_tasks);
            if ret {
                debug!("can fuse {name} since num tasks of predecessor ops match");
            } else {
                debug!("can't fuse {name} since num tasks of predecessor ops do not match");
            }
            ret
        }
        Some(max_total) => {
            let total: u64 = std::iter::zip(num_input_blocks, predecessors)
                .map(|(ni, p)| match p {
                    Some(p) => p
                        .pipeline
                        .config
                        .num_input_blocks
                        .iter()
                        .map(|nj| ni * nj)
                        .sum(),
                    None => *ni,
                })
                .sum();
            let ret = total <= max_total;
            if ret {
                debug!(
                    "can fuse {name} since total number of input blocks ({total}) does not \
                     exceed max ({max_total})"
                );
            } else {
                debug!(
                    "can't fuse {name} since total number of input blocks ({total}) exceeds \
                     max ({max_total})"
                );
            }
            ret
        }
    }
}

/// The peak projected memory for running a series of operations in order
/// while retaining each one's output chunk in memory.
#[must_use]
pub fn peak_projected_mem<'a>(ops: impl IntoIterator<Item = &'a PrimitiveOperation>) -> u64 {
    let mut modeller = MemoryModeller::new();
    for op in ops {
        modeller.allocate(op.projected_mem);
        let chunk_mem = chunk_memory(
            op.target_array().data_type(),
            &op.target_array().chunk_shape(),
        );
        modeller.free(op.projected_mem.saturating_sub(chunk_mem));
    }
    modeller.peak_mem()
}

/// Fuse two operations into one, avoiding writing to (or reading from) the
/// target of the producer.
///
/// `op1` is the producer, `op2` the consumer: the fused operation reads
/// `op1`'s inputs, feeds `op1`'s kernel output straight into `op2`'s kernel,
/// and writes `op2`'s target.
///
/// # Panics
/// Panics unless the task counts match and the consumer is a single-input
/// pointwise operation.
#[must_use]
pub fn fuse(op1: &PrimitiveOperation, op2: &PrimitiveOperation) -> PrimitiveOperation {
    assert_eq!(
        op1.num_tasks, op2.num_tasks,
        "fused operations must have the same number of tasks"
    );
    let spec1 = &op1.pipeline.config;
    let spec2 = &op2.pipeline.config;
    assert_eq!(
        spec2.function_nargs, 1,
        "pairwise fusion requires a single-input consumer"
    );
    assert_eq!(
        spec2.num_input_blocks,
        [1],
        "pairwise fusion requires a pointwise consumer"
    );

    let block_function: Arc<dyn BlockFunction> = Arc::new(PairFusedBlockFunction {
        producer: spec1.block_function.clone(),
        consumer: spec2.block_function.clone(),
    });

    let producer = spec1.function.clone();
    let consumer = spec2.function.clone();
    let function = BoundKernel::new(consumer.kind(), move |args, _| {
        let block = producer.call(args)?.into_single_dense()?;
        consumer.call(vec![BlockArg::Block(block)])
    });

    let num_input_blocks = spec1
        .num_input_blocks
        .iter()
        .map(|n| n * spec2.num_input_blocks[0])
        .collect();

    let spec = BlockwiseSpec {
        block_function,
        function,
        function_nargs: spec1.function_nargs,
        num_input_blocks,
        reads_map: spec1.reads_map.clone(),
        writes_list: spec2.writes_list.clone(),
        bridge: spec2.bridge.clone(),
    };

    PrimitiveOperation {
        pipeline: BlockwisePipeline {
            function: TaskFunction::ApplyBlockwise,
            name: gensym("fused-apply-blockwise"),
            mappable: op2.pipeline.mappable.clone(),
            config: spec,
        },
        source_array_names: op1.source_array_names.clone(),
        target_arrays: op2.target_arrays.clone(),
        projected_mem: op1.projected_mem.max(op2.projected_mem),
        allowed_mem: op2.allowed_mem,
        reserved_mem: op2.reserved_mem,
        num_tasks: op2.num_tasks,
        fusable: true,
    }
}

/// Fuse an operation with its immediate predecessors, avoiding writing to
/// (or reading from) the predecessor targets.
///
/// `predecessors` is aligned to the consumer's argument slots; `None` means
/// the slot keeps reading an original array.
///
/// # Panics
/// Panics unless the consumer's fan-in counts are uniform, every slot
/// without a predecessor has fan-in 1, and one predecessor slot is given
/// per consumer argument.
#[must_use]
pub fn fuse_multiple(
    op: &PrimitiveOperation,
    predecessors: &[Option<&PrimitiveOperation>],
) -> PrimitiveOperation {
    let spec = &op.pipeline.config;
    assert_eq!(
        predecessors.len(),
        spec.function_nargs,
        "one predecessor slot per consumer argument"
    );
    let num_input_blocks = &spec.num_input_blocks;
    assert!(
        num_input_blocks
            .iter()
            .all(|n| Some(n) == num_input_blocks.first()),
        "consumer fan-in must be uniform"
    );
    for (slot, pred) in predecessors.iter().enumerate() {
        assert!(
            pred.is_some() || num_input_blocks[slot] == 1,
            "a slot without a predecessor must have fan-in 1"
        );
    }

    let pred_specs: Vec<Option<&BlockwiseSpec>> = predecessors
        .iter()
        .map(|p| p.map(|p| &p.pipeline.config))
        .collect();

    let block_function: Arc<dyn BlockFunction> = Arc::new(MultiFusedBlockFunction {
        consumer: spec.block_function.clone(),
        predecessors: pred_specs
            .iter()
            .map(|p| p.map(|p| (p.block_function.clone(), p.function_nargs)))
            .collect(),
        num_input_blocks: num_input_blocks.clone(),
    });

    let consumer = spec.function.clone();
    let slots: Vec<Option<(BoundKernel, u64)>> = std::iter::zip(&pred_specs, num_input_blocks)
        .map(|(p, &n)| p.map(|p| (p.function.clone(), n)))
        .collect();
    let function = BoundKernel::new(consumer.kind(), move |args, _| {
        let mut results = Vec::with_capacity(args.len());
        for (arg, slot) in std::iter::zip(args, &slots) {
            // Each argument is the group of predecessor arguments for one
            // consumer slot.
            let group: Vec<BlockArg> = arg.into_stream()?.collect::<Result<_, _>>()?;
            let result = match slot {
                None => group.into_iter().next().ok_or_else(|| {
                    KernelError::InvalidArgument("empty pass-through argument group".to_string())
                })?,
                Some((kernel, n)) if *n == 1 => {
                    BlockArg::Block(kernel.call(group)?.into_single_dense()?)
                }
                Some((kernel, _)) => {
                    // Map the predecessor kernel across the fan-in lazily so
                    // only one upstream block is resident at a time.
                    let streams: Vec<BlockStream> = group
                        .into_iter()
                        .map(BlockArg::into_stream)
                        .collect::<Result<_, _>>()?;
                    BlockArg::Stream(BlockStream::new(ZipApply {
                        streams,
                        kernel: kernel.clone(),
                    }))
                }
            };
            results.push(result);
        }
        consumer.call(results)
    });

    let mut fused_num_input_blocks = Vec::new();
    for pred in &pred_specs {
        match pred {
            Some(pred) => fused_num_input_blocks.extend(
                pred.num_input_blocks
                    .iter()
                    .map(|n| num_input_blocks[0] * n),
            ),
            None => fused_num_input_blocks.push(num_input_blocks[0]),
        }
    }

    let mut reads_map = spec.reads_map.clone();
    for pred in pred_specs.iter().flatten() {
        reads_map.extend(pred.reads_map.clone());
    }

    let fused_spec = BlockwiseSpec {
        block_function,
        function,
        function_nargs: spec.function_nargs,
        num_input_blocks: fused_num_input_blocks,
        reads_map,
        writes_list: spec.writes_list.clone(),
        bridge: spec.bridge.clone(),
    };

    let mut source_array_names = Vec::new();
    for (slot, pred) in predecessors.iter().enumerate() {
        match pred {
            None => source_array_names.push(op.source_array_names[slot].clone()),
            Some(pred) => source_array_names.extend(pred.source_array_names.iter().cloned()),
        }
    }

    let projected_mem = op
        .projected_mem
        .max(peak_projected_mem(predecessors.iter().flatten().copied()));

    PrimitiveOperation {
        pipeline: BlockwisePipeline {
            function: TaskFunction::ApplyBlockwise,
            name: gensym("fused-apply-blockwise"),
            mappable: op.pipeline.mappable.clone(),
            config: fused_spec,
        },
        source_array_names,
        target_arrays: op.target_arrays.clone(),
        projected_mem,
        allowed_mem: op.allowed_mem,
        reserved_mem: op.reserved_mem,
        num_tasks: op.num_tasks,
        fusable: true,
    }
}

/// The composed block function of a pairwise fuse: the consumer's mapping
/// translates the output key to the producer's output key, which the
/// producer's mapping resolves to input chunk addresses.
#[derive(Debug)]
struct PairFusedBlockFunction {
    producer: Arc<dyn BlockFunction>,
    consumer: Arc<dyn BlockFunction>,
}

impl BlockFunction for PairFusedBlockFunction {
    fn block_deps(&self, out_key: &[u64]) -> Vec<ArgDeps> {
        let deps = self.consumer.block_deps(out_key);
        let key = deps
            .first()
            .and_then(ArgDeps::as_chunk)
            .expect("pairwise fusion requires a pointwise consumer");
        self.producer.block_deps(&key.coords)
    }
}

/// The composed block function of a multi-way fuse. Each consumer slot
/// expands to the group of its predecessor's arguments; fan-in slots stay
/// lazy via [`MappedDeps`].
#[derive(Debug)]
struct MultiFusedBlockFunction {
    consumer: Arc<dyn BlockFunction>,
    predecessors: Vec<Option<(Arc<dyn BlockFunction>, usize)>>,
    num_input_blocks: Vec<u64>,
}

impl BlockFunction for MultiFusedBlockFunction {
    fn block_deps(&self, out_key: &[u64]) -> Vec<ArgDeps> {
        let slot_deps = self.consumer.block_deps(out_key);
        debug_assert_eq!(slot_deps.len(), self.predecessors.len());
        std::iter::zip(slot_deps, &self.predecessors)
            .enumerate()
            .map(|(slot, (dep, pred))| match pred {
                None => ArgDeps::Nested(vec![dep]),
                Some((block_function, nargs)) => {
                    if self.num_input_blocks[slot] == 1 {
                        let key = dep
                            .as_chunk()
                            .expect("a fan-in 1 slot yields a single chunk");
                        ArgDeps::Nested(block_function.block_deps(&key.coords))
                    } else {
                        let keys = dep.chunk_leaves();
                        ArgDeps::Nested(
                            (0..*nargs)
                                .map(|arg_index| {
                                    ArgDeps::Mapped(MappedDeps::new(
                                        keys.clone(),
                                        block_function.clone(),
                                        arg_index,
                                    ))
                                })
                                .collect(),
                        )
                    }
                }
            })
            .collect()
    }
}

/// Pulls one item from every stream, applies the kernel, and yields the
/// dense result; ends with the first exhausted stream.
struct ZipApply {
    streams: Vec<BlockStream>,
    kernel: BoundKernel,
}

impl Iterator for ZipApply {
    type Item = Result<BlockArg, KernelError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut args = Vec::with_capacity(self.streams.len());
        for stream in &mut self.streams {
            match stream.next()? {
                Ok(arg) => args.push(arg),
                Err(err) => return Some(Err(err)),
            }
        }
        Some(
            self.kernel
                .call(args)
                .and_then(KernelOutput::into_single_dense)
                .map(BlockArg::Block),
        )
    }
}
