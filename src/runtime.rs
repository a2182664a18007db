//! In-process execution of primitive operations.
//!
//! A stand-in for the distributed runtime collaborator: it iterates an
//! operation's output chunk keys and runs the per-task function for each,
//! either serially or fanned out over a rayon thread pool. Tasks whose
//! failure is retriable (input chunk reads) are retried up to
//! [`Config::task_retries`](crate::config::Config) attempts; kernel and
//! write failures are fatal. Task execution order is unobservable.

use log::debug;
use rayon::iter::{ParallelBridge, ParallelIterator};
use thiserror::Error;

use crate::blockwise::{ApplyError, BlockwisePipeline, PrimitiveOperation};
use crate::config::global_config;

/// An execution error.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// A task failed.
    #[error("task {key:?} of operation {op_name} failed: {source}")]
    Task {
        /// The operation name.
        op_name: String,
        /// The output chunk key of the failed task.
        key: Vec<u64>,
        /// The task error.
        #[source]
        source: ApplyError,
    },
    /// The worker thread pool could not be built.
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Execute every task of `op` serially.
///
/// # Errors
/// Returns an [`ExecuteError`] for the first task that fails after retries.
pub fn execute_primitive_op(op: &PrimitiveOperation) -> Result<(), ExecuteError> {
    let pipeline = op.pipeline();
    for key in pipeline.mappable().iter() {
        run_task(pipeline, key)?;
    }
    Ok(())
}

/// Execute every task of `op` on a rayon thread pool sized to the global
/// task concurrency target.
///
/// # Errors
/// Returns an [`ExecuteError`] for a task that fails after retries.
pub fn execute_primitive_op_parallel(op: &PrimitiveOperation) -> Result<(), ExecuteError> {
    let pipeline = op.pipeline();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(global_config().task_concurrency_target())
        .build()?;
    pool.install(|| {
        pipeline
            .mappable()
            .iter()
            .par_bridge()
            .try_for_each(|key| run_task(pipeline, key))
    })
}

fn run_task(pipeline: &BlockwisePipeline, key: Vec<u64>) -> Result<(), ExecuteError> {
    let retries = global_config().task_retries().max(1);
    let mut attempt = 1;
    loop {
        match pipeline.function().call(&key, pipeline.config()) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retriable() && attempt < retries => {
                debug!(
                    "retrying task {key:?} of {} after retriable failure: {err}",
                    pipeline.name()
                );
                attempt += 1;
            }
            Err(source) => {
                return Err(ExecuteError::Task {
                    op_name: pipeline.name().to_string(),
                    key,
                    source,
                })
            }
        }
    }
}
