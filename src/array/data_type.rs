//! Element data types.
//!
//! Every data type has a fixed byte width that is known without consulting a
//! backing store, which is what makes chunk memory projection pure arithmetic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named field of a [`DataType::Structured`] data type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredField {
    name: String,
    data_type: DataType,
}

impl StructuredField {
    /// Create a new [`StructuredField`].
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// Get the field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the field data type.
    #[must_use]
    pub const fn data_type(&self) -> &DataType {
        &self.data_type
    }
}

/// The data type of chunked array elements.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// `bool`, stored as one byte per element.
    Bool,
    /// `int8`.
    Int8,
    /// `int16`.
    Int16,
    /// `int32`.
    Int32,
    /// `int64`.
    Int64,
    /// `uint8`.
    UInt8,
    /// `uint16`.
    UInt16,
    /// `uint32`.
    UInt32,
    /// `uint64`.
    UInt64,
    /// `float16` (IEEE 754 half precision).
    Float16,
    /// `bfloat16` (brain floating point).
    BFloat16,
    /// `float32`.
    Float32,
    /// `float64`.
    Float64,
    /// `complex64` (two `float32`s).
    Complex64,
    /// `complex128` (two `float64`s).
    Complex128,
    /// A structured element composed of named fields, laid out in field order
    /// with no padding.
    Structured(Vec<StructuredField>),
}

impl DataType {
    /// The byte width of a single element.
    ///
    /// For [`DataType::Structured`] this is the sum of the field sizes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
            Self::Structured(fields) => fields.iter().map(|f| f.data_type().size()).sum(),
        }
    }

    /// Return the byte offset within an element and the data type of the
    /// field named `name`.
    ///
    /// Returns [`None`] for non-structured data types and unknown fields.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<(usize, &DataType)> {
        let Self::Structured(fields) = self else {
            return None;
        };
        let mut offset = 0;
        for field in fields {
            if field.name() == name {
                return Some((offset, field.data_type()));
            }
            offset += field.data_type().size();
        }
        None
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Complex64 => "complex64",
            Self::Complex128 => "complex128",
            Self::Structured(_) => "structured",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::Bool.size(), 1);
        assert_eq!(DataType::Int16.size(), 2);
        assert_eq!(DataType::Float16.size(), 2);
        assert_eq!(DataType::Float64.size(), 8);
        assert_eq!(DataType::Complex128.size(), 16);
    }

    #[test]
    fn structured_field_offsets() {
        let data_type = DataType::Structured(vec![
            StructuredField::new("a", DataType::Int32),
            StructuredField::new("b", DataType::Float64),
            StructuredField::new("c", DataType::UInt8),
        ]);
        assert_eq!(data_type.size(), 13);
        assert_eq!(data_type.field("a"), Some((0, &DataType::Int32)));
        assert_eq!(data_type.field("b"), Some((4, &DataType::Float64)));
        assert_eq!(data_type.field("c"), Some((12, &DataType::UInt8)));
        assert_eq!(data_type.field("d"), None);
        assert_eq!(DataType::Float32.field("a"), None);
    }
}
