//! An in-memory array store.

use std::{ops::Range, sync::Arc};

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

use crate::array::{Block, DataType};

use super::{
    validate_ranges, ArrayOpener, ReadableArrayTraits, ReadableWritableArray, StorageError,
    WritableArrayTraits,
};

/// An in-memory chunk-addressable array store.
///
/// Holds the full dense array in C order behind a [`RwLock`]. Concurrent
/// disjoint-range writes serialize on the lock but never observe each other's
/// partial state.
#[derive(Debug)]
pub struct MemoryArrayStore {
    shape: Vec<u64>,
    data_type: DataType,
    chunk_shape: Vec<u64>,
    data: RwLock<Vec<u8>>,
}

impl MemoryArrayStore {
    /// Create a new zero-filled in-memory array.
    #[must_use]
    pub fn new(shape: Vec<u64>, data_type: DataType, chunk_shape: Vec<u64>) -> Self {
        let num_elements: u64 = shape.iter().product();
        let data = vec![0; usize::try_from(num_elements).unwrap() * data_type.size()];
        Self {
            shape,
            data_type,
            chunk_shape,
            data: RwLock::new(data),
        }
    }

    /// Read the entire array as one block.
    #[must_use]
    pub fn to_block(&self) -> Block {
        let data = self.data.read();
        Block::new(self.shape.clone(), self.data_type.clone(), data.clone())
            .expect("buffer length matches shape")
    }

    /// Element strides of the full array, in elements.
    fn strides(&self) -> Vec<u64> {
        let mut strides = vec![1; self.shape.len()];
        for axis in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.shape[axis + 1];
        }
        strides
    }

    /// Call `f` for every contiguous row of the selection with the element
    /// offset of the row within the array and within the selection.
    fn for_each_row(
        &self,
        ranges: &[Range<u64>],
        selection_shape: &[u64],
        mut f: impl FnMut(u64, u64, u64),
    ) {
        let n = ranges.len();
        if selection_shape.iter().any(|&len| len == 0) {
            return;
        }
        if n == 0 {
            f(0, 0, 1);
            return;
        }
        let strides = self.strides();
        let mut selection_strides = vec![1; n];
        for axis in (0..n - 1).rev() {
            selection_strides[axis] = selection_strides[axis + 1] * selection_shape[axis + 1];
        }
        let row_len = selection_shape[n - 1];
        let prefixes: Box<dyn Iterator<Item = Vec<u64>>> = if n == 1 {
            Box::new(std::iter::once(vec![]))
        } else {
            Box::new(ranges[..n - 1].iter().cloned().multi_cartesian_product())
        };
        for prefix in prefixes {
            let mut array_offset = ranges[n - 1].start;
            let mut selection_offset = 0;
            for (axis, &index) in prefix.iter().enumerate() {
                array_offset += index * strides[axis];
                selection_offset += (index - ranges[axis].start) * selection_strides[axis];
            }
            f(array_offset, selection_offset, row_len);
        }
    }
}

impl ReadableArrayTraits for MemoryArrayStore {
    fn shape(&self) -> &[u64] {
        &self.shape
    }

    fn data_type(&self) -> &DataType {
        &self.data_type
    }

    fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }

    fn retrieve_ranges(&self, ranges: &[Range<u64>]) -> Result<Block, StorageError> {
        let selection_shape = validate_ranges(ranges, &self.shape)?;
        let element_size = self.data_type.size() as u64;
        let num_elements: u64 = selection_shape.iter().product();
        let mut bytes = vec![0; usize::try_from(num_elements * element_size).unwrap()];
        let data = self.data.read();
        self.for_each_row(ranges, &selection_shape, |array_offset, selection_offset, len| {
            let src = usize::try_from(array_offset * element_size).unwrap();
            let dst = usize::try_from(selection_offset * element_size).unwrap();
            let run = usize::try_from(len * element_size).unwrap();
            bytes[dst..dst + run].copy_from_slice(&data[src..src + run]);
        });
        drop(data);
        Ok(Block::new(selection_shape, self.data_type.clone(), bytes)?)
    }
}

impl WritableArrayTraits for MemoryArrayStore {
    fn store_ranges(&self, ranges: &[Range<u64>], block: &Block) -> Result<(), StorageError> {
        let selection_shape = validate_ranges(ranges, &self.shape)?;
        if block.shape() != selection_shape {
            return Err(StorageError::InvalidBlockShape {
                block: block.shape().to_vec(),
                selection: selection_shape,
            });
        }
        if block.data_type() != &self.data_type {
            return Err(StorageError::DataTypeMismatch {
                block: block.data_type().clone(),
                array: self.data_type.clone(),
            });
        }
        let element_size = self.data_type.size() as u64;
        let mut data = self.data.write();
        self.for_each_row(ranges, &selection_shape, |array_offset, selection_offset, len| {
            let dst = usize::try_from(array_offset * element_size).unwrap();
            let src = usize::try_from(selection_offset * element_size).unwrap();
            let run = usize::try_from(len * element_size).unwrap();
            data[dst..dst + run].copy_from_slice(&block.bytes()[src..src + run]);
        });
        Ok(())
    }

    fn store_ranges_field(
        &self,
        ranges: &[Range<u64>],
        field: &str,
        block: &Block,
    ) -> Result<(), StorageError> {
        let selection_shape = validate_ranges(ranges, &self.shape)?;
        let Some((field_offset, field_type)) = self.data_type.field(field) else {
            return Err(StorageError::UnknownField(field.to_string()));
        };
        if block.shape() != selection_shape {
            return Err(StorageError::InvalidBlockShape {
                block: block.shape().to_vec(),
                selection: selection_shape,
            });
        }
        if block.data_type() != field_type {
            return Err(StorageError::DataTypeMismatch {
                block: block.data_type().clone(),
                array: field_type.clone(),
            });
        }
        let element_size = self.data_type.size() as u64;
        let field_size = field_type.size();
        // The write lock is held for the whole field, making it atomic.
        let mut data = self.data.write();
        self.for_each_row(ranges, &selection_shape, |array_offset, selection_offset, len| {
            for i in 0..len {
                let dst = usize::try_from((array_offset + i) * element_size).unwrap() + field_offset;
                let src = usize::try_from(selection_offset + i).unwrap() * field_size;
                data[dst..dst + field_size].copy_from_slice(&block.bytes()[src..src + field_size]);
            }
        });
        Ok(())
    }
}

/// An opener that materializes a [`MemoryArrayStore`] on first open.
#[derive(Debug)]
pub struct MemoryArrayOpener {
    shape: Vec<u64>,
    data_type: DataType,
    chunk_shape: Vec<u64>,
    store: Mutex<Option<Arc<MemoryArrayStore>>>,
}

impl MemoryArrayOpener {
    /// Create a new [`MemoryArrayOpener`]. No storage is allocated until
    /// [`open`](ArrayOpener::open) is called.
    #[must_use]
    pub fn new(shape: Vec<u64>, data_type: DataType, chunk_shape: Vec<u64>) -> Self {
        Self {
            shape,
            data_type,
            chunk_shape,
            store: Mutex::new(None),
        }
    }

    /// Returns true if the backing store has been materialized.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.store.lock().is_some()
    }
}

impl ArrayOpener for MemoryArrayOpener {
    fn open(&self) -> Result<ReadableWritableArray, StorageError> {
        let mut store = self.store.lock();
        let store = store.get_or_insert_with(|| {
            Arc::new(MemoryArrayStore::new(
                self.shape.clone(),
                self.data_type.clone(),
                self.chunk_shape.clone(),
            ))
        });
        Ok(store.clone())
    }
}
