//! Blockwise primitive operations.
//!
//! A blockwise operation materializes an output chunked array by applying a
//! kernel independently to groups of input chunks. Lowering produces a
//! [`PrimitiveOperation`]: a [`BlockwiseSpec`] (block function, kernel,
//! proxies, fan-in counts) plus the projected per-task memory, the task
//! count and the target array. Construction fails fast if the projected
//! memory exceeds the worker budget.
//!
//! Use [`blockwise`] to lower an indexed expression, or [`general_blockwise`]
//! to supply an explicit block function (and multiple outputs). Chains and
//! fans of operations can be rewritten by the [fusion](self::fusion)
//! functions so intermediate arrays are never materialized.

mod block_function;
pub mod fusion;
mod plan;
mod runner;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use thiserror::Error;

use crate::{
    array::{ArrayProxy, ChunkedArrayRef},
    kernel::{BackendBridge, BoundKernel, IdentityBridge},
    memory::chunk_memory,
};

pub use block_function::{ArgDeps, ArrayName, BlockFunction, ChunkKey, MappedDeps};
pub use plan::{ArgSpec, BlockwisePlan, FlattenedBlockwisePlan, Label, PlanError};
pub use runner::{apply_blockwise, ApplyError};

static SYM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique symbolic name from a process-wide counter.
///
/// Names are unique within a process but not monotonic across processes.
#[must_use]
pub fn gensym(prefix: &str) -> String {
    let count = SYM_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{prefix}-{count:03}")
}

/// A blockwise construction error.
///
/// Construction errors abort lowering and carry the offending operation
/// name.
#[derive(Debug, Error)]
pub enum BlockwiseError {
    /// Lowering the indexed expression failed.
    #[error("{op_name}: {source}")]
    Plan {
        /// The operation name.
        op_name: String,
        /// The lowering error.
        #[source]
        source: PlanError,
    },
    /// The projected per-task memory exceeds the worker budget.
    #[error(
        "projected blockwise memory ({projected}) exceeds allowed memory ({allowed}), \
         including reserved memory ({reserved}), for operation {op_name}"
    )]
    MemoryBudgetExceeded {
        /// The operation name.
        op_name: String,
        /// The projected per-task peak memory in bytes.
        projected: u64,
        /// The worker memory budget in bytes.
        allowed: u64,
        /// The reserved non-data worker memory in bytes.
        reserved: u64,
    },
}

/// Specification for how to run blockwise on an array.
///
/// Immutable after construction; fusion builds a new spec rather than
/// mutating one.
#[derive(Clone, Debug)]
pub struct BlockwiseSpec {
    pub(crate) block_function: Arc<dyn BlockFunction>,
    pub(crate) function: BoundKernel,
    pub(crate) function_nargs: usize,
    pub(crate) num_input_blocks: Vec<u64>,
    pub(crate) reads_map: HashMap<ArrayName, ArrayProxy>,
    pub(crate) writes_list: Vec<ArrayProxy>,
    pub(crate) bridge: Arc<dyn BackendBridge>,
}

impl BlockwiseSpec {
    /// The map from an output chunk key to input chunk addresses.
    #[must_use]
    pub fn block_function(&self) -> &Arc<dyn BlockFunction> {
        &self.block_function
    }

    /// The kernel applied to each group of input chunks.
    #[must_use]
    pub const fn function(&self) -> &BoundKernel {
        &self.function
    }

    /// The number of array arguments the kernel accepts.
    #[must_use]
    pub const fn function_nargs(&self) -> usize {
        self.function_nargs
    }

    /// The number of input blocks read from each input array.
    #[must_use]
    pub fn num_input_blocks(&self) -> &[u64] {
        &self.num_input_blocks
    }

    /// Read proxies keyed by input array name.
    #[must_use]
    pub const fn reads_map(&self) -> &HashMap<ArrayName, ArrayProxy> {
        &self.reads_map
    }

    /// Write proxies, ordered to match the kernel outputs.
    #[must_use]
    pub fn writes_list(&self) -> &[ArrayProxy] {
        &self.writes_list
    }

    /// The bridge between store-native and kernel-native blocks.
    #[must_use]
    pub fn bridge(&self) -> &Arc<dyn BackendBridge> {
        &self.bridge
    }
}

/// The per-task function of a pipeline.
#[derive(Clone)]
pub enum TaskFunction {
    /// The standard blockwise task runner, [`apply_blockwise`].
    ApplyBlockwise,
    /// A substituted per-task function. Operations carrying one are not
    /// candidates for blockwise fusion.
    Custom(Arc<dyn Fn(&[u64], &BlockwiseSpec) -> Result<(), ApplyError> + Send + Sync>),
}

impl TaskFunction {
    /// Returns true if this is the standard blockwise task runner.
    #[must_use]
    pub const fn is_blockwise(&self) -> bool {
        matches!(self, Self::ApplyBlockwise)
    }

    /// Run one task.
    ///
    /// # Errors
    /// Propagates the task's [`ApplyError`].
    pub fn call(&self, out_key: &[u64], config: &BlockwiseSpec) -> Result<(), ApplyError> {
        match self {
            Self::ApplyBlockwise => apply_blockwise(out_key, config),
            Self::Custom(function) => function(out_key, config),
        }
    }
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApplyBlockwise => f.write_str("ApplyBlockwise"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// The output chunk key space of an operation.
///
/// Keys are ordered integer sequences (not tuples, for the benefit of
/// serializers that reject them) iterated in C order. The key space is
/// derived lazily from the target's per-axis chunk counts.
#[derive(Clone, Debug)]
pub struct ChunkKeys {
    numblocks: Vec<u64>,
}

impl ChunkKeys {
    /// Create the key space for a grid with `numblocks` chunks per axis.
    #[must_use]
    pub fn new(numblocks: Vec<u64>) -> Self {
        Self { numblocks }
    }

    /// The per-axis chunk counts.
    #[must_use]
    pub fn numblocks(&self) -> &[u64] {
        &self.numblocks
    }

    /// The total number of keys.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.numblocks.iter().product()
    }

    /// Returns true if the key space is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the keys in C order (last axis fastest).
    #[must_use]
    pub fn iter(&self) -> ChunkKeysIter<'_> {
        let start = if self.numblocks.contains(&0) {
            None
        } else {
            Some(vec![0; self.numblocks.len()])
        };
        ChunkKeysIter {
            numblocks: &self.numblocks,
            next: start,
        }
    }
}

/// An iterator over [`ChunkKeys`].
#[derive(Clone, Debug)]
pub struct ChunkKeysIter<'a> {
    numblocks: &'a [u64],
    next: Option<Vec<u64>>,
}

impl Iterator for ChunkKeysIter<'_> {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut successor = current.clone();
        for axis in (0..successor.len()).rev() {
            successor[axis] += 1;
            if successor[axis] < self.numblocks[axis] {
                self.next = Some(successor);
                return Some(current);
            }
            successor[axis] = 0;
        }
        Some(current)
    }
}

/// A named, runnable pipeline: a per-task function, the iterable of output
/// chunk keys, and the spec the function closes over.
#[derive(Clone, Debug)]
pub struct BlockwisePipeline {
    pub(crate) function: TaskFunction,
    pub(crate) name: String,
    pub(crate) mappable: ChunkKeys,
    pub(crate) config: BlockwiseSpec,
}

impl BlockwisePipeline {
    /// The per-task function.
    #[must_use]
    pub const fn function(&self) -> &TaskFunction {
        &self.function
    }

    /// The unique pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The iterable of output chunk keys.
    #[must_use]
    pub const fn mappable(&self) -> &ChunkKeys {
        &self.mappable
    }

    /// The blockwise spec.
    #[must_use]
    pub const fn config(&self) -> &BlockwiseSpec {
        &self.config
    }
}

/// The smallest runnable unit handed to the distributed runtime.
#[derive(Clone, Debug)]
pub struct PrimitiveOperation {
    pub(crate) pipeline: BlockwisePipeline,
    pub(crate) source_array_names: Vec<ArrayName>,
    pub(crate) target_arrays: Vec<ChunkedArrayRef>,
    pub(crate) projected_mem: u64,
    pub(crate) allowed_mem: u64,
    pub(crate) reserved_mem: u64,
    pub(crate) num_tasks: u64,
    pub(crate) fusable: bool,
}

impl PrimitiveOperation {
    /// The runnable pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &BlockwisePipeline {
        &self.pipeline
    }

    /// The ordered names of the source arrays.
    #[must_use]
    pub fn source_array_names(&self) -> &[ArrayName] {
        &self.source_array_names
    }

    /// The target arrays, ordered to match the kernel outputs.
    #[must_use]
    pub fn target_arrays(&self) -> &[ChunkedArrayRef] {
        &self.target_arrays
    }

    /// The first (usually only) target array.
    #[must_use]
    pub fn target_array(&self) -> &ChunkedArrayRef {
        &self.target_arrays[0]
    }

    /// The projected per-task peak memory in bytes.
    #[must_use]
    pub const fn projected_mem(&self) -> u64 {
        self.projected_mem
    }

    /// The worker memory budget in bytes.
    #[must_use]
    pub const fn allowed_mem(&self) -> u64 {
        self.allowed_mem
    }

    /// The reserved non-data worker memory in bytes.
    #[must_use]
    pub const fn reserved_mem(&self) -> u64 {
        self.reserved_mem
    }

    /// The number of tasks.
    #[must_use]
    pub const fn num_tasks(&self) -> u64 {
        self.num_tasks
    }

    /// Returns true if the operation may take part in fusion.
    #[must_use]
    pub const fn fusable(&self) -> bool {
        self.fusable
    }
}

/// Options for constructing a blockwise operation.
#[derive(Clone, Debug)]
pub struct BlockwiseOptions {
    pub(crate) allowed_mem: u64,
    pub(crate) reserved_mem: u64,
    pub(crate) extra_projected_mem: u64,
    pub(crate) fusable: bool,
    pub(crate) num_input_blocks: Option<Vec<u64>>,
    pub(crate) bridge: Option<Arc<dyn BackendBridge>>,
    pub(crate) name: Option<String>,
}

impl BlockwiseOptions {
    /// Create options with a worker memory budget of `allowed_mem` bytes
    /// (inclusive of reserved memory).
    #[must_use]
    pub fn new(allowed_mem: u64) -> Self {
        Self {
            allowed_mem,
            reserved_mem: 0,
            extra_projected_mem: 0,
            fusable: true,
            num_input_blocks: None,
            bridge: None,
            name: None,
        }
    }

    /// Set the memory reserved on a worker for non-data use.
    #[must_use]
    pub fn reserved_mem(mut self, bytes: u64) -> Self {
        self.reserved_mem = bytes;
        self
    }

    /// Declare extra projected memory beyond chunk reads and writes.
    #[must_use]
    pub fn extra_projected_mem(mut self, bytes: u64) -> Self {
        self.extra_projected_mem = bytes;
        self
    }

    /// Mark the operation as not fusable.
    #[must_use]
    pub fn fusable(mut self, fusable: bool) -> Self {
        self.fusable = fusable;
        self
    }

    /// Override the per-input fan-in counts.
    #[must_use]
    pub fn num_input_blocks(mut self, num_input_blocks: Vec<u64>) -> Self {
        self.num_input_blocks = Some(num_input_blocks);
        self
    }

    /// Use a non-trivial store/kernel block bridge.
    #[must_use]
    pub fn bridge(mut self, bridge: Arc<dyn BackendBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Use an explicit operation name instead of a generated one.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One argument to [`blockwise`].
#[derive(Clone, Debug)]
pub enum BlockwiseInput {
    /// An array argument with its per-axis labels.
    Array {
        /// The input array name.
        name: ArrayName,
        /// The input array.
        array: ChunkedArrayRef,
        /// One label per array axis.
        labels: Vec<Label>,
    },
    /// A non-array argument passed to the kernel unchanged.
    Literal(serde_json::Value),
}

impl BlockwiseInput {
    /// Create an array argument.
    #[must_use]
    pub fn array(
        name: impl Into<ArrayName>,
        array: ChunkedArrayRef,
        labels: impl IntoIterator<Item = Label>,
    ) -> Self {
        Self::Array {
            name: name.into(),
            array,
            labels: labels.into_iter().collect(),
        }
    }
}

/// Build a [`PrimitiveOperation`] from an explicit block function.
///
/// A more general form of [`blockwise`] that uses a function to specify the
/// block mapping rather than an index notation, and which supports multiple
/// outputs.
///
/// The projected per-task memory accounts for a compressed and an
/// uncompressed copy of one chunk per input plus the largest output, with
/// compression assumed to achieve no reduction, on top of the reserved and
/// extra projected memory.
///
/// # Errors
/// Returns [`BlockwiseError::MemoryBudgetExceeded`] if the projection
/// exceeds `options.allowed_mem`.
///
/// # Panics
/// Panics if `targets` is empty.
pub fn general_blockwise(
    function: BoundKernel,
    block_function: Arc<dyn BlockFunction>,
    inputs: Vec<(ArrayName, ChunkedArrayRef)>,
    targets: Vec<ChunkedArrayRef>,
    options: BlockwiseOptions,
) -> Result<PrimitiveOperation, BlockwiseError> {
    assert!(
        !targets.is_empty(),
        "a blockwise operation requires at least one target"
    );
    let op_name = options
        .name
        .unwrap_or_else(|| gensym("apply-blockwise"));
    let num_input_blocks = options
        .num_input_blocks
        .unwrap_or_else(|| vec![1; inputs.len()]);
    let bridge = options
        .bridge
        .unwrap_or_else(|| Arc::new(IdentityBridge));

    let reads_map: HashMap<ArrayName, ArrayProxy> = inputs
        .iter()
        .map(|(name, array)| {
            (
                name.clone(),
                ArrayProxy::new(array.clone(), array.chunk_grid().clone()),
            )
        })
        .collect();
    let writes_list: Vec<ArrayProxy> = targets
        .iter()
        .map(|target| ArrayProxy::new(target.clone(), target.chunk_grid().clone()))
        .collect();

    let mut projected_mem = options.reserved_mem + options.extra_projected_mem;
    for (_, array) in &inputs {
        // Memory for a compressed and an uncompressed copy of one input
        // chunk; compression is assumed to achieve no reduction.
        projected_mem += 2 * chunk_memory(array.data_type(), &array.chunk_shape());
    }
    // Only one output chunk is resident at a time, so take the largest.
    let output_chunk_memory = targets
        .iter()
        .map(|target| 2 * chunk_memory(target.data_type(), &target.chunk_shape()))
        .max()
        .unwrap_or(0);
    projected_mem += output_chunk_memory;

    if projected_mem > options.allowed_mem {
        return Err(BlockwiseError::MemoryBudgetExceeded {
            op_name,
            projected: projected_mem,
            allowed: options.allowed_mem,
            reserved: options.reserved_mem,
        });
    }

    let mappable = ChunkKeys::new(targets[0].numblocks());
    let num_tasks = mappable.len();

    let spec = BlockwiseSpec {
        block_function,
        function_nargs: inputs.len(),
        function,
        num_input_blocks,
        reads_map,
        writes_list,
        bridge,
    };

    Ok(PrimitiveOperation {
        pipeline: BlockwisePipeline {
            function: TaskFunction::ApplyBlockwise,
            name: op_name,
            mappable,
            config: spec,
        },
        source_array_names: inputs.into_iter().map(|(name, _)| name).collect(),
        target_arrays: targets,
        projected_mem,
        allowed_mem: options.allowed_mem,
        reserved_mem: options.reserved_mem,
        num_tasks,
        fusable: options.fusable,
    })
}

/// Build a [`PrimitiveOperation`] from an indexed expression.
///
/// The block mapping is specified with per-axis labels: shared labels align
/// axes, labels only on the output broadcast (their block counts declared in
/// `new_axes`), and labels only on inputs are contraction axes over which
/// the kernel receives every block. Per-input fan-in counts are derived from
/// the contraction axes unless overridden in `options`.
///
/// # Errors
/// Returns a [`BlockwiseError`] carrying the operation name if lowering
/// fails or the memory projection exceeds the budget.
pub fn blockwise(
    function: BoundKernel,
    out_ind: &[Label],
    args: Vec<BlockwiseInput>,
    new_axes: &BTreeMap<Label, u64>,
    target: ChunkedArrayRef,
    options: BlockwiseOptions,
) -> Result<PrimitiveOperation, BlockwiseError> {
    let op_name = options
        .name
        .clone()
        .unwrap_or_else(|| gensym("apply-blockwise"));

    let mut numblocks: HashMap<ArrayName, Vec<u64>> = HashMap::new();
    let mut arg_specs = Vec::with_capacity(args.len());
    let mut inputs = Vec::new();
    for arg in &args {
        match arg {
            BlockwiseInput::Array {
                name,
                array,
                labels,
            } => {
                numblocks.insert(name.clone(), array.numblocks());
                arg_specs.push(ArgSpec::Array {
                    name: name.clone(),
                    labels: labels.clone(),
                });
                inputs.push((name.clone(), array.clone()));
            }
            BlockwiseInput::Literal(value) => {
                arg_specs.push(ArgSpec::Literal(value.clone()));
            }
        }
    }

    let plan = BlockwisePlan::new(out_ind, &arg_specs, &numblocks, new_axes).map_err(|source| {
        BlockwiseError::Plan {
            op_name: op_name.clone(),
            source,
        }
    })?;
    let num_input_blocks = options
        .num_input_blocks
        .clone()
        .unwrap_or_else(|| plan.num_input_blocks());

    general_blockwise(
        function,
        Arc::new(plan),
        inputs,
        vec![target],
        options.name(op_name).num_input_blocks(num_input_blocks),
    )
}
