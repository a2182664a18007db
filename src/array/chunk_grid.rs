//! Chunk grids.
//!
//! A chunk grid holds, for each axis of an array, the ordered sequence of
//! chunk lengths along that axis. Grids are regular except that the last
//! chunk of an axis may be short.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The chunk grid of a chunked array.
///
/// Invariants: every chunk length is positive, and the per-axis lengths sum
/// to the array length on that axis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGrid {
    axes: Vec<Vec<u64>>,
}

/// A chunk grid creation error.
#[derive(Debug, Error)]
pub enum ChunkGridCreateError {
    /// A chunk length of zero.
    #[error("chunk length of zero on axis {0}")]
    ZeroChunkLength(usize),
    /// The chunk shape does not have the same dimensionality as the array shape.
    #[error("chunk shape has {chunk} axes, array shape has {array}")]
    IncompatibleDimensionality { chunk: usize, array: usize },
}

impl ChunkGrid {
    /// Create a chunk grid from explicit per-axis chunk lengths.
    ///
    /// # Errors
    /// Returns [`ChunkGridCreateError::ZeroChunkLength`] if any chunk length is zero.
    pub fn new(axes: Vec<Vec<u64>>) -> Result<Self, ChunkGridCreateError> {
        for (axis, lengths) in axes.iter().enumerate() {
            if lengths.iter().any(|&len| len == 0) {
                return Err(ChunkGridCreateError::ZeroChunkLength(axis));
            }
        }
        Ok(Self { axes })
    }

    /// Create a normalized chunk grid for an array of `shape` with a regular
    /// `chunk_shape`. The last chunk of an axis may be short.
    ///
    /// # Errors
    /// Returns an error if the dimensionalities do not match, or a chunk
    /// length is zero on an axis of nonzero length.
    pub fn regular(shape: &[u64], chunk_shape: &[u64]) -> Result<Self, ChunkGridCreateError> {
        if shape.len() != chunk_shape.len() {
            return Err(ChunkGridCreateError::IncompatibleDimensionality {
                chunk: chunk_shape.len(),
                array: shape.len(),
            });
        }
        let mut axes = Vec::with_capacity(shape.len());
        for (axis, (&len, &chunk)) in std::iter::zip(shape, chunk_shape).enumerate() {
            if len == 0 {
                axes.push(vec![]);
                continue;
            }
            if chunk == 0 {
                return Err(ChunkGridCreateError::ZeroChunkLength(axis));
            }
            let mut lengths = vec![chunk; usize::try_from(len / chunk).unwrap()];
            if len % chunk != 0 {
                lengths.push(len % chunk);
            }
            axes.push(lengths);
        }
        Ok(Self { axes })
    }

    /// The number of axes.
    #[must_use]
    pub fn dimensionality(&self) -> usize {
        self.axes.len()
    }

    /// The per-axis chunk lengths.
    #[must_use]
    pub fn axes(&self) -> &[Vec<u64>] {
        &self.axes
    }

    /// The shape of the array described by this grid.
    #[must_use]
    pub fn shape(&self) -> Vec<u64> {
        self.axes
            .iter()
            .map(|lengths| lengths.iter().sum())
            .collect()
    }

    /// The number of chunks along each axis.
    #[must_use]
    pub fn numblocks(&self) -> Vec<u64> {
        self.axes
            .iter()
            .map(|lengths| lengths.len() as u64)
            .collect()
    }

    /// The total number of chunks in the grid.
    #[must_use]
    pub fn num_chunks(&self) -> u64 {
        self.axes
            .iter()
            .map(|lengths| lengths.len() as u64)
            .product()
    }

    /// The regular chunk shape: the length of the first chunk on each axis.
    #[must_use]
    pub fn chunk_size(&self) -> Vec<u64> {
        self.axes
            .iter()
            .map(|lengths| lengths.first().copied().unwrap_or(0))
            .collect()
    }

    /// The shape of the chunk at `key`.
    ///
    /// Returns [`None`] if `key` is outside the grid.
    #[must_use]
    pub fn chunk_shape(&self, key: &[u64]) -> Option<Vec<u64>> {
        if key.len() != self.axes.len() {
            return None;
        }
        std::iter::zip(&self.axes, key)
            .map(|(lengths, &index)| lengths.get(usize::try_from(index).unwrap()).copied())
            .collect()
    }

    /// Convert a chunk key to the tuple of half-open element ranges the chunk
    /// covers.
    ///
    /// Returns [`None`] if `key` is outside the grid. The last chunk of an
    /// axis yields a correspondingly shorter range.
    #[must_use]
    pub fn key_to_ranges(&self, key: &[u64]) -> Option<Vec<Range<u64>>> {
        if key.len() != self.axes.len() {
            return None;
        }
        std::iter::zip(&self.axes, key)
            .map(|(lengths, &index)| {
                let index = usize::try_from(index).unwrap();
                let len = *lengths.get(index)?;
                let start: u64 = lengths[..index].iter().sum();
                Some(start..start + len)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_grid() {
        let grid = ChunkGrid::regular(&[4, 6], &[2, 3]).unwrap();
        assert_eq!(grid.axes(), &[vec![2, 2], vec![3, 3]]);
        assert_eq!(grid.shape(), vec![4, 6]);
        assert_eq!(grid.numblocks(), vec![2, 2]);
        assert_eq!(grid.num_chunks(), 4);
        assert_eq!(grid.chunk_size(), vec![2, 3]);
    }

    #[test]
    fn ragged_last_chunk() {
        let grid = ChunkGrid::regular(&[5], &[2]).unwrap();
        assert_eq!(grid.axes(), &[vec![2, 2, 1]]);
        assert_eq!(grid.key_to_ranges(&[0]), Some(vec![0..2]));
        assert_eq!(grid.key_to_ranges(&[2]), Some(vec![4..5]));
        assert_eq!(grid.chunk_shape(&[2]), Some(vec![1]));
        assert_eq!(grid.key_to_ranges(&[3]), None);
    }

    #[test]
    fn key_to_ranges_2d() {
        let grid = ChunkGrid::regular(&[4, 6], &[2, 3]).unwrap();
        assert_eq!(grid.key_to_ranges(&[1, 0]), Some(vec![2..4, 0..3]));
        assert_eq!(grid.key_to_ranges(&[0, 1]), Some(vec![0..2, 3..6]));
        assert_eq!(grid.key_to_ranges(&[0]), None);
    }

    #[test]
    fn zero_chunk_length_rejected() {
        assert!(ChunkGrid::new(vec![vec![2, 0]]).is_err());
        assert!(ChunkGrid::regular(&[4], &[0]).is_err());
        assert!(ChunkGrid::regular(&[4, 4], &[2]).is_err());
    }

    #[test]
    fn zero_dimensional_grid() {
        let grid = ChunkGrid::regular(&[], &[]).unwrap();
        assert_eq!(grid.num_chunks(), 1);
        assert_eq!(grid.key_to_ranges(&[]), Some(vec![]));
    }
}
