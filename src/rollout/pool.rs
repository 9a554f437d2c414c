//! Bounded pool for CPU-bound rollout steps.
//!
//! Request forking, tool processing and scoring run here so they never stall
//! the tasks waiting on the generation engine.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{RemoraError, Result};

/// Runs blocking closures on tokio's blocking threads, at most `workers` at a time.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BlockingPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` once a worker slot is free.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RemoraError::collaborator("blocking pool", e.into()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| RemoraError::collaborator("blocking pool", e.into()))
    }
}
