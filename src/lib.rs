//! A library for memory-bounded blockwise computation over chunked
//! multidimensional arrays.
//!
//! A blockwise operation applies a user kernel independently to groups of
//! input chunks to materialize an output chunked array, one chunk per task.
//! This crate provides the lowering, planning and execution core of such a
//! framework:
//!  - [`blockwise::blockwise`] lowers an indexed expression (inputs with
//!    axis labels, output with axis labels) to a pure block function and a
//!    runnable [`blockwise::PrimitiveOperation`], rejecting plans whose
//!    projected per-task memory exceeds the worker budget,
//!  - [`blockwise::fusion`] rewrites chains and fans of operations into a
//!    single operation so intermediate arrays are never materialized,
//!  - [`blockwise::apply_blockwise`] is the worker-side routine that reads
//!    input chunks, invokes the kernel and writes the output chunk, and
//!  - [`runtime`] is an in-process stand-in for the distributed runtime.
//!
//! The front-end array API, the DAG optimizer that decides fusion order,
//! the distributed runtime and the persistent storage format are external
//! collaborators; [`storage`] defines the traits they meet.
//!
//! ## Example
//!
//! Add two chunked arrays elementwise:
//!
//! ```
//! # use std::collections::BTreeMap;
//! use chunkwise::array::{Block, ChunkedArrayRef, DataType};
//! use chunkwise::blockwise::{blockwise, BlockwiseInput, BlockwiseOptions};
//! use chunkwise::kernel::{BlockArg, BlockValue, BoundKernel};
//! use chunkwise::runtime::execute_primitive_op;
//! use chunkwise::storage::{ReadableArrayTraits, WritableArrayTraits};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let a = ChunkedArrayRef::memory(vec![4], DataType::Float64, &[2])?;
//! a.open()?.store_ranges(
//!     &[0..4],
//!     &Block::from_elements(vec![4], &[1.0f64, 2.0, 3.0, 4.0])?,
//! )?;
//! let b = ChunkedArrayRef::memory(vec![4], DataType::Float64, &[2])?;
//! b.open()?.store_ranges(
//!     &[0..4],
//!     &Block::from_elements(vec![4], &[10.0f64, 20.0, 30.0, 40.0])?,
//! )?;
//! let out = ChunkedArrayRef::memory(vec![4], DataType::Float64, &[2])?;
//!
//! let add = BoundKernel::single(|args, _| {
//!     let mut blocks = args.into_iter().map(BlockArg::into_block);
//!     let x = blocks.next().unwrap()?;
//!     let y = blocks.next().unwrap()?;
//!     let sum: Vec<f64> = std::iter::zip(x.elements::<f64>()?, y.elements::<f64>()?)
//!         .map(|(a, b)| a + b)
//!         .collect();
//!     Ok(BlockValue::Dense(Block::from_elements(x.shape().to_vec(), &sum)?))
//! });
//!
//! let op = blockwise(
//!     add,
//!     &['i'],
//!     vec![
//!         BlockwiseInput::array("a", a, ['i']),
//!         BlockwiseInput::array("b", b, ['i']),
//!     ],
//!     &BTreeMap::new(),
//!     out.clone(),
//!     BlockwiseOptions::new(1 << 20),
//! )?;
//! execute_primitive_op(&op)?;
//!
//! let sum = out.open()?.retrieve_ranges(&[0..4])?.elements::<f64>()?;
//! assert_eq!(sum, vec![11.0, 22.0, 33.0, 44.0]);
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod blockwise;
pub mod config;
pub mod kernel;
pub mod memory;
pub mod runtime;
pub mod storage;
