//! Block functions.
//!
//! A block function is the pure heart of a blockwise operation: it maps an
//! output chunk key to the structured multiset of input chunk addresses the
//! output chunk depends on. Block functions must be deterministic; the
//! runtime may call them any number of times for the same key.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// The symbolic name of an input array within an operation.
pub type ArrayName = String;

/// The address of one chunk: an array name and the chunk's grid coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkKey {
    /// The input array name.
    pub name: ArrayName,
    /// The chunk coordinates within the array's chunk grid.
    pub coords: Vec<u64>,
}

impl ChunkKey {
    /// Create a new [`ChunkKey`].
    #[must_use]
    pub fn new(name: impl Into<ArrayName>, coords: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            coords,
        }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.name, self.coords)
    }
}

/// A pure map from an output chunk key to per-argument chunk addresses.
///
/// The returned sequence has one entry per kernel argument, in argument
/// order.
pub trait BlockFunction: Send + Sync + fmt::Debug {
    /// Map `out_key` to the chunk addresses each kernel argument depends on.
    fn block_deps(&self, out_key: &[u64]) -> Vec<ArgDeps>;
}

/// The chunk addresses one kernel argument depends on.
///
/// Contraction axes contribute one level of [`ArgDeps::Nested`] per axis;
/// the innermost level varies fastest. Multi-way fusion produces
/// [`ArgDeps::Mapped`] entries whose expansion is deferred until a task
/// pulls them.
#[derive(Clone, Debug)]
pub enum ArgDeps {
    /// A non-array argument passed to the kernel unchanged.
    Literal(serde_json::Value),
    /// A single chunk; the argument is one block.
    Chunk(ChunkKey),
    /// A nested sequence of dependencies.
    Nested(Vec<ArgDeps>),
    /// A lazily mapped fan-in sequence.
    Mapped(MappedDeps),
}

impl ArgDeps {
    /// Collect every leaf chunk address in order.
    #[must_use]
    pub fn chunk_leaves(&self) -> Vec<ChunkKey> {
        let mut leaves = Vec::new();
        self.collect_chunk_leaves(&mut leaves);
        leaves
    }

    fn collect_chunk_leaves(&self, leaves: &mut Vec<ChunkKey>) {
        match self {
            Self::Literal(_) => {}
            Self::Chunk(key) => leaves.push(key.clone()),
            Self::Nested(items) => {
                for item in items {
                    item.collect_chunk_leaves(leaves);
                }
            }
            Self::Mapped(mapped) => {
                for item in mapped.iter() {
                    item.collect_chunk_leaves(leaves);
                }
            }
        }
    }

    /// The chunk address if this argument is a single chunk.
    #[must_use]
    pub fn as_chunk(&self) -> Option<&ChunkKey> {
        match self {
            Self::Chunk(key) => Some(key),
            _ => None,
        }
    }
}

/// A fan-in sequence whose entries are produced on demand by applying an
/// upstream block function to each key.
///
/// Produced by multi-way fusion: the consumer's fan-in keys for one argument
/// slot are each translated through the fused predecessor's block function,
/// projected onto one of the predecessor's argument positions. Keeping the
/// expansion lazy avoids materializing the full fan-in product during plan
/// resolution.
#[derive(Clone)]
pub struct MappedDeps {
    keys: Vec<ChunkKey>,
    block_function: Arc<dyn BlockFunction>,
    arg_index: usize,
}

impl MappedDeps {
    /// Create a new [`MappedDeps`].
    #[must_use]
    pub fn new(keys: Vec<ChunkKey>, block_function: Arc<dyn BlockFunction>, arg_index: usize) -> Self {
        Self {
            keys,
            block_function,
            arg_index,
        }
    }

    /// The fan-in length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the fan-in is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Lazily expand the sequence, one entry per fan-in key.
    pub fn iter(&self) -> impl Iterator<Item = ArgDeps> + '_ {
        self.keys.iter().map(move |key| {
            self.block_function
                .block_deps(&key.coords)
                .into_iter()
                .nth(self.arg_index)
                .expect("block function returns one entry per argument")
        })
    }

    /// Expand the sequence into an owned iterator.
    #[must_use]
    pub fn into_iter(self) -> impl Iterator<Item = ArgDeps> + Send {
        let Self {
            keys,
            block_function,
            arg_index,
        } = self;
        keys.into_iter().map(move |key| {
            block_function
                .block_deps(&key.coords)
                .into_iter()
                .nth(arg_index)
                .expect("block function returns one entry per argument")
        })
    }
}

impl fmt::Debug for MappedDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedDeps")
            .field("keys", &self.keys)
            .field("arg_index", &self.arg_index)
            .finish_non_exhaustive()
    }
}
