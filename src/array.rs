//! Chunked array references.
//!
//! A [`ChunkedArrayRef`] is an opaque handle to a chunk-addressable backing
//! store: a shape, a data type, a [`ChunkGrid`] and a lazy open capability.
//! It does not own data pages; the [storage](crate::storage) collaborator
//! does.
//!
//! An [`ArrayProxy`] pairs a reference with the chunk grid a blockwise
//! operation addresses it through, and caches the live store handle across
//! chunk reads and writes within a task.

mod block;
pub mod chunk_grid;
pub mod data_type;

use std::sync::{Arc, OnceLock};

use thiserror::Error;

pub use self::{
    block::{Block, BlockError, Element},
    chunk_grid::{ChunkGrid, ChunkGridCreateError},
    data_type::{DataType, StructuredField},
};

use crate::storage::{
    ArrayOpener, MemoryArrayOpener, ReadableWritableArray, StorageError,
};

/// The shape of an array.
pub type ArrayShape = Vec<u64>;

/// An array creation error.
#[derive(Debug, Error)]
pub enum ArrayCreateError {
    /// An invalid chunk grid.
    #[error(transparent)]
    ChunkGridCreateError(#[from] ChunkGridCreateError),
    /// The chunk grid does not have the same dimensionality as the array shape.
    #[error("chunk grid has {grid} dimensions, array shape has {array}")]
    InvalidChunkGridDimensionality { grid: usize, array: usize },
    /// The chunk grid does not cover the array shape.
    #[error("chunk grid covers shape {grid:?}, array shape is {array:?}")]
    InvalidChunkGridShape { grid: Vec<u64>, array: Vec<u64> },
}

/// An opaque reference to a chunked array in a backing store.
#[derive(Clone, Debug)]
pub struct ChunkedArrayRef {
    shape: ArrayShape,
    data_type: DataType,
    chunk_grid: ChunkGrid,
    opener: Arc<dyn ArrayOpener>,
}

impl ChunkedArrayRef {
    /// Create a reference from its parts.
    ///
    /// # Errors
    /// Returns an [`ArrayCreateError`] if the chunk grid does not cover
    /// `shape`.
    pub fn new(
        shape: ArrayShape,
        data_type: DataType,
        chunk_grid: ChunkGrid,
        opener: Arc<dyn ArrayOpener>,
    ) -> Result<Self, ArrayCreateError> {
        if chunk_grid.dimensionality() != shape.len() {
            return Err(ArrayCreateError::InvalidChunkGridDimensionality {
                grid: chunk_grid.dimensionality(),
                array: shape.len(),
            });
        }
        if chunk_grid.shape() != shape {
            return Err(ArrayCreateError::InvalidChunkGridShape {
                grid: chunk_grid.shape(),
                array: shape,
            });
        }
        Ok(Self {
            shape,
            data_type,
            chunk_grid,
            opener,
        })
    }

    /// Create a reference backed by a lazily materialized in-memory store
    /// with a regular `chunk_shape`.
    ///
    /// # Errors
    /// Returns an [`ArrayCreateError`] if `chunk_shape` is incompatible with
    /// `shape`.
    pub fn memory(
        shape: ArrayShape,
        data_type: DataType,
        chunk_shape: &[u64],
    ) -> Result<Self, ArrayCreateError> {
        let chunk_grid = ChunkGrid::regular(&shape, chunk_shape)?;
        let opener = Arc::new(MemoryArrayOpener::new(
            shape.clone(),
            data_type.clone(),
            chunk_shape.to_vec(),
        ));
        Self::new(shape, data_type, chunk_grid, opener)
    }

    /// Get the array shape.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Get the data type.
    #[must_use]
    pub const fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Get the chunk grid.
    #[must_use]
    pub const fn chunk_grid(&self) -> &ChunkGrid {
        &self.chunk_grid
    }

    /// Get the regular chunk shape.
    #[must_use]
    pub fn chunk_shape(&self) -> Vec<u64> {
        self.chunk_grid.chunk_size()
    }

    /// The number of chunks along each axis.
    #[must_use]
    pub fn numblocks(&self) -> Vec<u64> {
        self.chunk_grid.numblocks()
    }

    /// Get the opener.
    #[must_use]
    pub fn opener(&self) -> &Arc<dyn ArrayOpener> {
        &self.opener
    }

    /// Open the backing store.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store cannot be opened.
    pub fn open(&self) -> Result<ReadableWritableArray, StorageError> {
        self.opener.open()
    }
}

/// A chunked array reference paired with the chunk grid a blockwise
/// operation addresses it through.
#[derive(Clone)]
pub struct ArrayProxy {
    array: ChunkedArrayRef,
    chunk_grid: ChunkGrid,
    opened: OnceLock<ReadableWritableArray>,
}

impl ArrayProxy {
    /// Create a new [`ArrayProxy`].
    #[must_use]
    pub fn new(array: ChunkedArrayRef, chunk_grid: ChunkGrid) -> Self {
        Self {
            array,
            chunk_grid,
            opened: OnceLock::new(),
        }
    }

    /// Get the underlying array reference.
    #[must_use]
    pub const fn array(&self) -> &ChunkedArrayRef {
        &self.array
    }

    /// Get the chunk grid used for key to range conversion.
    #[must_use]
    pub const fn chunk_grid(&self) -> &ChunkGrid {
        &self.chunk_grid
    }

    /// Open the backing store, caching the live handle.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store cannot be opened. Open
    /// failures are not cached.
    pub fn open(&self) -> Result<ReadableWritableArray, StorageError> {
        if let Some(opened) = self.opened.get() {
            return Ok(opened.clone());
        }
        let opened = self.array.open()?;
        Ok(self.opened.get_or_init(|| opened).clone())
    }
}

impl std::fmt::Debug for ArrayProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayProxy")
            .field("array", &self.array)
            .field("chunk_grid", &self.chunk_grid)
            .field("opened", &self.opened.get().is_some())
            .finish()
    }
}
