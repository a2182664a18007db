//! Chunk-addressable array storage.
//!
//! The storage collaborator holds the data pages of chunked arrays. The
//! engine only requires that a backing store expose its shape, data type and
//! regular chunk shape, and support dense range-slicing reads and writes,
//! plus a field-addressed write for structured data types.
//!
//! The operations available for an array depend on the traits implemented by
//! its backing store:
//!  - [`ReadableArrayTraits`] storage can read chunk data,
//!  - [`WritableArrayTraits`] storage can write chunk data, and
//!  - both are needed to run a blockwise task end to end.
//!
//! Distinct tasks write disjoint ranges, so a store must support concurrent
//! disjoint-range writes; no cross-task locking is required beyond that.

mod memory_store;

use std::{fmt, ops::Range, sync::Arc};

use thiserror::Error;

use crate::array::{Block, BlockError, DataType};

pub use memory_store::{MemoryArrayOpener, MemoryArrayStore};

/// [`Arc`] wrapped readable and writable array storage.
pub type ReadableWritableArray = Arc<dyn ReadableWritableArrayTraits>;

/// Readable array storage traits.
pub trait ReadableArrayTraits: Send + Sync {
    /// The array shape.
    fn shape(&self) -> &[u64];

    /// The array data type.
    fn data_type(&self) -> &DataType;

    /// The regular chunk shape of the backing store.
    fn chunk_shape(&self) -> &[u64];

    /// Read the elements within `ranges` as a dense block.
    ///
    /// `ranges` holds one half-open element range per axis.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if `ranges` is incompatible with the array
    /// or there is an error with the underlying store.
    fn retrieve_ranges(&self, ranges: &[Range<u64>]) -> Result<Block, StorageError>;
}

/// Writable array storage traits.
pub trait WritableArrayTraits: Send + Sync + ReadableArrayTraits {
    /// Store a dense block into the elements within `ranges`.
    ///
    /// The block shape must match the selection shape and the block data type
    /// must match the array data type.
    ///
    /// # Errors
    /// Returns a [`StorageError`] on failure to store.
    fn store_ranges(&self, ranges: &[Range<u64>], block: &Block) -> Result<(), StorageError>;

    /// Store a dense block into one field of a structured array within
    /// `ranges`.
    ///
    /// The write must be atomic per field per chunk.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the array data type has no field named
    /// `field`, or on failure to store.
    fn store_ranges_field(
        &self,
        ranges: &[Range<u64>],
        field: &str,
        block: &Block,
    ) -> Result<(), StorageError>;
}

/// A supertrait of [`ReadableArrayTraits`] and [`WritableArrayTraits`].
pub trait ReadableWritableArrayTraits: ReadableArrayTraits + WritableArrayTraits {}

impl<T> ReadableWritableArrayTraits for T where T: ReadableArrayTraits + WritableArrayTraits {}

/// A lazy open capability for a backing store.
///
/// Opening may materialize the store; a target array is only created when a
/// task first opens it.
pub trait ArrayOpener: Send + Sync + fmt::Debug {
    /// Open the backing store, materializing it if necessary.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store cannot be opened.
    fn open(&self) -> Result<ReadableWritableArray, StorageError>;
}

/// A storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A selection with the wrong number of axes.
    #[error("selection has {selection} axes, array has {array}")]
    IncompatibleDimensionality { selection: usize, array: usize },
    /// A selection outside the array bounds.
    #[error("range {start}..{end} is out of bounds on axis {axis} (length {len})")]
    OutOfBounds {
        axis: usize,
        start: u64,
        end: u64,
        len: u64,
    },
    /// A block whose shape does not match the selection shape.
    #[error("block shape {block:?} does not match selection shape {selection:?}")]
    InvalidBlockShape {
        block: Vec<u64>,
        selection: Vec<u64>,
    },
    /// A block whose data type does not match the array data type.
    #[error("block data type {block} does not match array data type {array}")]
    DataTypeMismatch { block: DataType, array: DataType },
    /// A field write addressed to a field the array does not have.
    #[error("array has no field named '{0}'")]
    UnknownField(String),
    /// An invalid block.
    #[error(transparent)]
    InvalidBlock(#[from] BlockError),
    /// The requested method is not supported.
    #[error("{0}")]
    Unsupported(String),
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}

/// Validate `ranges` against `shape`, returning the selection shape.
pub(crate) fn validate_ranges(
    ranges: &[Range<u64>],
    shape: &[u64],
) -> Result<Vec<u64>, StorageError> {
    if ranges.len() != shape.len() {
        return Err(StorageError::IncompatibleDimensionality {
            selection: ranges.len(),
            array: shape.len(),
        });
    }
    let mut selection_shape = Vec::with_capacity(ranges.len());
    for (axis, (range, &len)) in std::iter::zip(ranges, shape).enumerate() {
        if range.start > range.end || range.end > len {
            return Err(StorageError::OutOfBounds {
                axis,
                start: range.start,
                end: range.end,
                len,
            });
        }
        selection_shape.push(range.end - range.start);
    }
    Ok(selection_shape)
}
