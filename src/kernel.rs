//! Kernels applied to tuples of array blocks.
//!
//! A kernel is a pure user function mapping input blocks to one or more
//! output blocks. Kernels are registered with a [`KernelKind`] tag so the
//! engine never has to introspect the function: [`KernelKind::Single`]
//! kernels return one output, [`KernelKind::MultiYield`] kernels return a
//! sequence of outputs which are written to the targets in yield order.
//!
//! Keyword parameters are bound once, when the [`BoundKernel`] is built;
//! they are never rebound per task.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::array::{Block, BlockError};
use crate::storage::StorageError;

/// Keyword parameters bound to a kernel at construction.
pub type KernelParams = serde_json::Map<String, serde_json::Value>;

/// A kernel error.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A kernel argument had an unexpected form.
    #[error("invalid kernel argument: {0}")]
    InvalidArgument(String),
    /// A storage error surfaced while a kernel pulled a lazy argument.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An invalid block.
    #[error(transparent)]
    Block(#[from] BlockError),
    /// A failure raised by the user kernel. Fatal for the task.
    #[error("{0}")]
    Failure(String),
}

impl From<&str> for KernelError {
    fn from(err: &str) -> Self {
        Self::Failure(err.to_string())
    }
}

impl From<String> for KernelError {
    fn from(err: String) -> Self {
        Self::Failure(err)
    }
}

/// How a kernel produces its outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelKind {
    /// The kernel returns a single output value.
    Single,
    /// The kernel yields a sequence of output values, one per target.
    MultiYield,
}

/// A single output value of a kernel.
#[derive(Clone, Debug)]
pub enum BlockValue {
    /// A dense block.
    Dense(Block),
    /// Named field blocks of a structured output, written field by field.
    Fields(Vec<(String, Block)>),
}

/// The outputs of one kernel invocation.
#[derive(Debug)]
pub enum KernelOutput {
    /// The output of a [`KernelKind::Single`] kernel.
    Single(BlockValue),
    /// The outputs of a [`KernelKind::MultiYield`] kernel, in yield order.
    Multi(Vec<BlockValue>),
}

impl KernelOutput {
    /// Normalize to an output sequence.
    #[must_use]
    pub fn into_outputs(self) -> Vec<BlockValue> {
        match self {
            Self::Single(value) => vec![value],
            Self::Multi(values) => values,
        }
    }

    /// Extract a single dense block, the only output form that can feed a
    /// downstream kernel in a fused operation.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] for multi-valued or
    /// field-structured outputs.
    pub fn into_single_dense(self) -> Result<Block, KernelError> {
        match self {
            Self::Single(BlockValue::Dense(block)) => Ok(block),
            Self::Single(BlockValue::Fields(_)) => Err(KernelError::InvalidArgument(
                "a field-structured output cannot feed a downstream kernel".to_string(),
            )),
            Self::Multi(_) => Err(KernelError::InvalidArgument(
                "a multi-output kernel cannot feed a downstream kernel".to_string(),
            )),
        }
    }
}

/// A lazy, pull-based sequence of kernel arguments.
///
/// Fan-in arguments of fused operations are delivered as streams so that
/// only one upstream block is resident at a time while a kernel folds over
/// them.
pub struct BlockStream {
    inner: Box<dyn Iterator<Item = Result<BlockArg, KernelError>> + Send>,
}

impl BlockStream {
    /// Create a stream from an iterator.
    #[must_use]
    pub fn new(
        inner: impl Iterator<Item = Result<BlockArg, KernelError>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Create an already materialized stream.
    #[must_use]
    pub fn from_args(args: Vec<BlockArg>) -> Self {
        Self::new(args.into_iter().map(Ok))
    }
}

impl Iterator for BlockStream {
    type Item = Result<BlockArg, KernelError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl fmt::Debug for BlockStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlockStream(..)")
    }
}

/// One argument passed to a kernel.
///
/// The structure is congruent to the chunk-address structure produced by the
/// operation's block function: a contraction axis contributes one level of
/// [`BlockArg::List`] nesting, a fused fan-in arrives as a lazy
/// [`BlockArg::Stream`].
#[derive(Debug)]
pub enum BlockArg {
    /// A non-array argument passed through unchanged.
    Literal(serde_json::Value),
    /// A dense block.
    Block(Block),
    /// A materialized sequence of arguments.
    List(Vec<BlockArg>),
    /// A lazy sequence of arguments.
    Stream(BlockStream),
}

impl BlockArg {
    /// Extract a dense block.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] for any other argument form.
    pub fn into_block(self) -> Result<Block, KernelError> {
        match self {
            Self::Block(block) => Ok(block),
            other => Err(KernelError::InvalidArgument(format!(
                "expected a dense block, got {other:?}"
            ))),
        }
    }

    /// Convert a sequence argument into a stream, materialized or not.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] for non-sequence arguments.
    pub fn into_stream(self) -> Result<BlockStream, KernelError> {
        match self {
            Self::List(items) => Ok(BlockStream::from_args(items)),
            Self::Stream(stream) => Ok(stream),
            other => Err(KernelError::InvalidArgument(format!(
                "expected a sequence of blocks, got {other:?}"
            ))),
        }
    }
}

/// The function type wrapped by a [`BoundKernel`].
pub type KernelFn =
    dyn Fn(Vec<BlockArg>, &KernelParams) -> Result<KernelOutput, KernelError> + Send + Sync;

/// A kernel reference paired with its kind tag and bound parameters.
#[derive(Clone)]
pub struct BoundKernel {
    function: Arc<KernelFn>,
    kind: KernelKind,
    params: Arc<KernelParams>,
}

impl BoundKernel {
    /// Create a kernel from a function and its kind tag.
    #[must_use]
    pub fn new(
        kind: KernelKind,
        function: impl Fn(Vec<BlockArg>, &KernelParams) -> Result<KernelOutput, KernelError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            function: Arc::new(function),
            kind,
            params: Arc::new(KernelParams::new()),
        }
    }

    /// Create a [`KernelKind::Single`] kernel.
    #[must_use]
    pub fn single(
        function: impl Fn(Vec<BlockArg>, &KernelParams) -> Result<BlockValue, KernelError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::new(KernelKind::Single, move |args, params| {
            function(args, params).map(KernelOutput::Single)
        })
    }

    /// Create a [`KernelKind::MultiYield`] kernel.
    #[must_use]
    pub fn multi_yield(
        function: impl Fn(Vec<BlockArg>, &KernelParams) -> Result<Vec<BlockValue>, KernelError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::new(KernelKind::MultiYield, move |args, params| {
            function(args, params).map(KernelOutput::Multi)
        })
    }

    /// Bind keyword parameters. Parameters are bound once, before the kernel
    /// is handed to an operation.
    #[must_use]
    pub fn with_params(mut self, params: KernelParams) -> Self {
        self.params = Arc::new(params);
        self
    }

    /// Get the kind tag.
    #[must_use]
    pub const fn kind(&self) -> KernelKind {
        self.kind
    }

    /// Get the bound parameters.
    #[must_use]
    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    /// Invoke the kernel.
    ///
    /// # Errors
    /// Propagates any [`KernelError`] from the kernel.
    pub fn call(&self, args: Vec<BlockArg>) -> Result<KernelOutput, KernelError> {
        (self.function)(args, &self.params)
    }

    /// Invoke the kernel and normalize its outputs to a sequence.
    ///
    /// # Errors
    /// Propagates any [`KernelError`] from the kernel.
    pub fn outputs(&self, args: Vec<BlockArg>) -> Result<Vec<BlockValue>, KernelError> {
        Ok(self.call(args)?.into_outputs())
    }
}

impl fmt::Debug for BoundKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundKernel")
            .field("kind", &self.kind)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Conversions between store-native blocks and kernel-native blocks.
///
/// Both directions must preserve shape and data type exactly and be inverses
/// of one another.
pub trait BackendBridge: Send + Sync + fmt::Debug {
    /// Convert a block read from storage into the kernel representation.
    ///
    /// # Errors
    /// Returns a [`KernelError`] if the block cannot be represented.
    fn store_to_kernel(&self, block: Block) -> Result<Block, KernelError>;

    /// Convert a kernel output block into the storage representation.
    ///
    /// # Errors
    /// Returns a [`KernelError`] if the block cannot be represented.
    fn kernel_to_store(&self, block: Block) -> Result<Block, KernelError>;
}

/// The trivial bridge: store and kernel share one block representation.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityBridge;

impl BackendBridge for IdentityBridge {
    fn store_to_kernel(&self, block: Block) -> Result<Block, KernelError> {
        Ok(block)
    }

    fn kernel_to_store(&self, block: Block) -> Result<Block, KernelError> {
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use crate::array::DataType;

    use super::*;

    #[test]
    fn single_kernel_outputs() {
        let kernel = BoundKernel::single(|mut args, _| {
            let block = args.remove(0).into_block()?;
            Ok(BlockValue::Dense(block))
        });
        assert_eq!(kernel.kind(), KernelKind::Single);

        let block = Block::from_elements(vec![2], &[1.0f64, 2.0]).unwrap();
        let outputs = kernel.outputs(vec![BlockArg::Block(block)]).unwrap();
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn params_bound_once() {
        let kernel = BoundKernel::single(|_, params| {
            let scale = params["scale"].as_f64().unwrap();
            Ok(BlockValue::Dense(
                Block::from_elements(vec![1], &[scale]).unwrap(),
            ))
        })
        .with_params({
            let mut params = KernelParams::new();
            params.insert("scale".to_string(), 3.0.into());
            params
        });

        let outputs = kernel.outputs(vec![]).unwrap();
        let BlockValue::Dense(block) = &outputs[0] else {
            panic!("expected a dense output");
        };
        assert_eq!(block.elements::<f64>().unwrap(), vec![3.0]);
    }

    #[test]
    fn stream_pulls_lazily() {
        let pulled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = pulled.clone();
        let stream = BlockStream::new((0..3u8).map(move |i| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(BlockArg::Block(
                Block::from_elements(vec![1], &[i]).unwrap(),
            ))
        }));
        let mut stream = stream;
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 0);
        let first = stream.next().unwrap().unwrap().into_block().unwrap();
        assert_eq!(first.data_type(), &DataType::UInt8);
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn into_single_dense_rejects_multi() {
        let output = KernelOutput::Multi(vec![]);
        assert!(output.into_single_dense().is_err());
    }
}
