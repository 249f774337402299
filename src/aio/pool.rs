//! Process-wide worker pool on which every asynchronous operation runs

use std::thread;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::{Error, Result};

/// Upper bound on the default worker count
const MAX_DEFAULT_WORKERS: usize = 8;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub worker_threads: usize,
    /// Thread name prefix
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .min(MAX_DEFAULT_WORKERS);
        Self {
            worker_threads: workers,
            thread_name: "loomwire-worker".to_string(),
        }
    }
}

struct PoolState {
    config: PoolConfig,
    runtime: Option<Runtime>,
}

lazy_static! {
    static ref POOL: Mutex<PoolState> = Mutex::new(PoolState {
        config: PoolConfig::default(),
        runtime: None,
    });
}

/// Set the pool size. Only allowed before the first operation runs.
pub fn configure(config: PoolConfig) -> Result<()> {
    if config.worker_threads == 0 {
        return Err(Error::Config("worker_threads must be at least 1".into()));
    }
    let mut pool = POOL.lock();
    if pool.runtime.is_some() {
        return Err(Error::State("worker pool already started".into()));
    }
    pool.config = config;
    Ok(())
}

/// Handle to the pool, starting it on first use
pub fn handle() -> Result<Handle> {
    let mut pool = POOL.lock();
    if let Some(runtime) = &pool.runtime {
        return Ok(runtime.handle().clone());
    }

    let runtime = Builder::new_multi_thread()
        .worker_threads(pool.config.worker_threads)
        .thread_name(pool.config.thread_name.clone())
        .enable_all()
        .build()?;
    debug!(
        "Worker pool started with {} threads",
        pool.config.worker_threads
    );
    let handle = runtime.handle().clone();
    pool.runtime = Some(runtime);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_runs_work() {
        let handle = handle().unwrap();
        let value = handle.block_on(async { tokio::spawn(async { 40 + 2 }).await.unwrap() });
        assert_eq!(value, 42);
    }

    #[test]
    fn test_configure_after_start_fails() {
        handle().unwrap();
        assert!(matches!(
            configure(PoolConfig::default()),
            Err(Error::State(_))
        ));
        assert!(matches!(
            configure(PoolConfig {
                worker_threads: 0,
                thread_name: "x".into()
            }),
            Err(Error::Config(_))
        ));
    }
}
