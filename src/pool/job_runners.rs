//! # Job runner pool: round-robin dispatch.
//!
//! [`JobRunnersPool`] adds [`JobRunnersPool::run`] to a [`WorkerPool`]. Tasks are
//! spread over the workers that are `ready` at dispatch time; a worker in any
//! other state never receives a task, and with no ready worker the call fails
//! immediately instead of queuing.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::RunError;
use crate::pool::{ManagedWorkerFactory, WorkerPool, WorkerPoolConfig};
use crate::protocol::{JobTask, TaskResult};
use crate::worker::{ManagedWorker, WorkerEnv};

/// Worker pool that executes job tasks.
///
/// Dereferences to the underlying [`WorkerPool`]. The dispatch cursor lives in
/// the pool, so every `JobRunnersPool` wrapping the same pool shares it.
#[derive(Clone, Debug)]
pub struct JobRunnersPool {
    pool: WorkerPool,
}

impl JobRunnersPool {
    /// Creates an empty job runner pool.
    pub fn new(
        config: WorkerPoolConfig,
        env: WorkerEnv,
        factory: Arc<dyn ManagedWorkerFactory>,
    ) -> Self {
        Self {
            pool: WorkerPool::new(config, env, factory),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Runs a task on the next ready worker.
    pub async fn run(&self, task: JobTask) -> Result<TaskResult, RunError> {
        let worker = self.next_ready().ok_or_else(|| RunError::NoHealthyWorkers {
            pool: self.pool.name().to_string(),
        })?;
        worker.run(task).await
    }

    fn next_ready(&self) -> Option<ManagedWorker> {
        let ready: Vec<ManagedWorker> = self
            .pool
            .workers()
            .into_iter()
            .filter(|w| w.is_healthy())
            .collect();
        if ready.is_empty() {
            return None;
        }
        let n = self.pool.inner.cursor.fetch_add(1, Ordering::Relaxed);
        let index = n % ready.len();
        ready.into_iter().nth(index)
    }
}

impl From<WorkerPool> for JobRunnersPool {
    fn from(pool: WorkerPool) -> Self {
        Self { pool }
    }
}

impl Deref for JobRunnersPool {
    type Target = WorkerPool;

    fn deref(&self) -> &WorkerPool {
        &self.pool
    }
}
