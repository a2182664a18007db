//! Dense array blocks.
//!
//! A [`Block`] is the unit of data exchanged between storage and kernels: a
//! dense C-order buffer with a shape and a data type.

use bytemuck::Pod;
use thiserror::Error;

use super::DataType;

/// A block error.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The byte buffer does not match the block shape and data type.
    #[error(
        "byte length {found} does not match shape {shape:?} of {data_type} ({expected} bytes)"
    )]
    InvalidByteLength {
        found: usize,
        expected: usize,
        shape: Vec<u64>,
        data_type: DataType,
    },
    /// An element view was requested with the wrong element type.
    #[error("element type {requested} does not match block data type {actual}")]
    ElementTypeMismatch {
        requested: DataType,
        actual: DataType,
    },
}

/// An element type with a corresponding [`DataType`].
pub trait Element: Pod {
    /// The data type of blocks holding this element type.
    const DATA_TYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $data_type:expr),* $(,)?) => {
        $(impl Element for $ty {
            const DATA_TYPE: DataType = $data_type;
        })*
    };
}

impl_element! {
    i8 => DataType::Int8,
    i16 => DataType::Int16,
    i32 => DataType::Int32,
    i64 => DataType::Int64,
    u8 => DataType::UInt8,
    u16 => DataType::UInt16,
    u32 => DataType::UInt32,
    u64 => DataType::UInt64,
    half::f16 => DataType::Float16,
    half::bf16 => DataType::BFloat16,
    f32 => DataType::Float32,
    f64 => DataType::Float64,
}

/// A dense N-dimensional block of array elements in C (row-major) order.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    shape: Vec<u64>,
    data_type: DataType,
    bytes: Vec<u8>,
}

impl Block {
    /// Create a block from raw bytes.
    ///
    /// # Errors
    /// Returns [`BlockError::InvalidByteLength`] if the byte length does not
    /// equal the element count times the element size.
    pub fn new(
        shape: Vec<u64>,
        data_type: DataType,
        bytes: Vec<u8>,
    ) -> Result<Self, BlockError> {
        let num_elements: u64 = shape.iter().product();
        let expected = usize::try_from(num_elements).unwrap() * data_type.size();
        if bytes.len() != expected {
            return Err(BlockError::InvalidByteLength {
                found: bytes.len(),
                expected,
                shape,
                data_type,
            });
        }
        Ok(Self {
            shape,
            data_type,
            bytes,
        })
    }

    /// Create a zero-filled block.
    #[must_use]
    pub fn zeroed(shape: Vec<u64>, data_type: DataType) -> Self {
        let num_elements: u64 = shape.iter().product();
        let bytes = vec![0; usize::try_from(num_elements).unwrap() * data_type.size()];
        Self {
            shape,
            data_type,
            bytes,
        }
    }

    /// Create a block from a typed element buffer in C order.
    ///
    /// # Errors
    /// Returns [`BlockError::InvalidByteLength`] if the element count does
    /// not match the shape.
    pub fn from_elements<T: Element>(shape: Vec<u64>, elements: &[T]) -> Result<Self, BlockError> {
        Self::new(shape, T::DATA_TYPE, bytemuck::cast_slice(elements).to_vec())
    }

    /// Copy the block contents out as typed elements in C order.
    ///
    /// # Errors
    /// Returns [`BlockError::ElementTypeMismatch`] if `T` does not match the
    /// block data type.
    pub fn elements<T: Element>(&self) -> Result<Vec<T>, BlockError> {
        if T::DATA_TYPE != self.data_type {
            return Err(BlockError::ElementTypeMismatch {
                requested: T::DATA_TYPE,
                actual: self.data_type.clone(),
            });
        }
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }

    /// The block shape.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The block data type.
    #[must_use]
    pub const fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// The number of elements.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    /// The raw bytes in C order.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the block, returning its raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Convert the block to an [`ndarray::ArrayD`].
    ///
    /// # Errors
    /// Returns [`BlockError::ElementTypeMismatch`] if `T` does not match the
    /// block data type.
    #[cfg(feature = "ndarray")]
    pub fn to_ndarray<T: Element>(&self) -> Result<ndarray::ArrayD<T>, BlockError> {
        let elements = self.elements::<T>()?;
        let shape: Vec<usize> = self
            .shape
            .iter()
            .map(|&len| usize::try_from(len).unwrap())
            .collect();
        Ok(ndarray::ArrayD::from_shape_vec(shape, elements)
            .expect("element count matches shape"))
    }

    /// Create a block from an [`ndarray`] array, copying into C order.
    #[cfg(feature = "ndarray")]
    #[must_use]
    pub fn from_ndarray<T: Element, D: ndarray::Dimension>(array: &ndarray::Array<T, D>) -> Self {
        let shape: Vec<u64> = array.shape().iter().map(|&len| len as u64).collect();
        let elements: Vec<T> = array.iter().copied().collect();
        Self::from_elements(shape, &elements).expect("element count matches shape")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let block = Block::from_elements(vec![2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(block.data_type(), &DataType::Float32);
        assert_eq!(block.num_elements(), 4);
        assert_eq!(block.elements::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(block.elements::<f64>().is_err());
    }

    #[test]
    fn invalid_byte_length() {
        assert!(Block::new(vec![2], DataType::Float64, vec![0; 4]).is_err());
        assert!(Block::new(vec![2], DataType::Float64, vec![0; 16]).is_ok());
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn ndarray_round_trip() {
        let array = ndarray::arr2(&[[1.0f64, 2.0], [3.0, 4.0]]);
        let block = Block::from_ndarray(&array);
        assert_eq!(block.shape(), &[2, 2]);
        let back = block.to_ndarray::<f64>().unwrap();
        assert_eq!(back.into_dimensionality::<ndarray::Ix2>().unwrap(), array);
    }
}
