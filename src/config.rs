//! Global configuration options.

use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Global configuration options for the chunkwise crate.
///
/// Retrieve the global [`Config`] with [`global_config`] and modify it with
/// [`global_config_mut`].
///
/// ## Task Retries
///  > default: `3`
///
/// The number of attempts the in-process runtime makes for a task whose
/// failure is retriable (an input chunk read error). Kernel failures and
/// write failures are never retried.
///
/// ## Task Concurrency Target
/// > default: [`std::thread::available_parallelism`]`()`
///
/// The number of tasks the parallel in-process runtime aims to run
/// concurrently.
#[derive(Debug)]
pub struct Config {
    task_retries: usize,
    task_concurrency_target: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_retries: 3,
            task_concurrency_target: std::thread::available_parallelism().unwrap().get(),
        }
    }
}

impl Config {
    /// Get the [task retries](#task-retries) configuration.
    #[must_use]
    pub fn task_retries(&self) -> usize {
        self.task_retries
    }

    /// Set the [task retries](#task-retries) configuration.
    pub fn set_task_retries(&mut self, task_retries: usize) {
        self.task_retries = task_retries;
    }

    /// Get the [task concurrency target](#task-concurrency-target) configuration.
    #[must_use]
    pub fn task_concurrency_target(&self) -> usize {
        self.task_concurrency_target
    }

    /// Set the [task concurrency target](#task-concurrency-target) configuration.
    pub fn set_task_concurrency_target(&mut self, concurrency_target: usize) {
        self.task_concurrency_target = concurrency_target;
    }
}

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Returns a reference to the global chunkwise configuration.
///
/// # Panics
/// This function panics if the underlying lock has been poisoned and might
/// panic if the global config is already held by the current thread.
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    CONFIG
        .get_or_init(|| RwLock::new(Config::default()))
        .read()
        .unwrap()
}

/// Returns a mutable reference to the global chunkwise configuration.
///
/// # Panics
/// This function panics if the underlying lock has been poisoned and might
/// panic if the global config is already held by the current thread.
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    CONFIG
        .get_or_init(|| RwLock::new(Config::default()))
        .write()
        .unwrap()
}
