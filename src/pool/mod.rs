//! Worker pools and the pool manager.
//!
//! ## Contents
//! - [`WorkerPool`] homogeneous set of [`ManagedWorker`]s for one logical service
//! - [`JobRunnersPool`] round-robin task dispatch over the ready workers of a pool
//! - [`PoolManager`] named pools with aggregate server health
//! - [`PoolHealth`], [`PoolHealthReport`], [`ServerHealthReport`] health model
//! - [`ManagedWorkerFactory`], [`WorkerPoolFactory`] construction seams
//!
//! ## Health propagation
//! ```text
//! ManagedWorker state change ──► WorkerPool::update_health ──(changed)──► pool listeners
//!                                                                          │
//!                         PoolManager::update_health ◄─────────────────────┘
//!                                   └──(changed)──► server listeners, ServerHealthChanged
//! ```
//!
//! | Level  | Healthy                 | Degraded (policy allows)         | Unhealthy       |
//! |--------|-------------------------|----------------------------------|-----------------|
//! | Pool   | every worker ready      | some worker ready                | otherwise       |
//! | Server | every pool healthy      | some pool not unhealthy          | otherwise       |

mod job_runners;
mod manager;
mod worker_pool;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::worker::{ManagedWorker, WorkerConfig, WorkerEnv, WorkerKind, WorkerSpawner, WorkerState};

pub use job_runners::JobRunnersPool;
pub use manager::{PoolManager, ServerHealthListener};
pub use worker_pool::{PoolHealthListener, WorkerPool};

/// Health of a pool, or of the whole server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    /// Full capacity.
    Healthy,
    /// Partial capacity, tolerated by the policy.
    Degraded,
    /// Not serving (or partial capacity the policy does not tolerate).
    Unhealthy,
}

/// Aggregate health of all pools.
pub type ServerHealth = PoolHealth;

impl PoolHealth {
    /// Returns the snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Pool name; also the worker id prefix.
    pub name: String,
    /// Unit type of every worker.
    pub kind: WorkerKind,
    /// Spawn descriptor shared by every worker.
    pub entry: String,
    /// Base startup payload, merged under each worker's own payload.
    #[serde(default)]
    pub data: Value,
}

impl WorkerPoolConfig {
    /// Creates a pool description with an empty base payload.
    pub fn new(name: impl Into<String>, kind: WorkerKind, entry: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            entry: entry.into(),
            data: Value::Object(Default::default()),
        }
    }

    /// Sets the base startup payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Per-worker line of a [`PoolHealthReport`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthReport {
    /// Worker id.
    pub id: String,
    /// Current state.
    pub state: WorkerState,
    /// Failures since last stable.
    pub consecutive_failures: u32,
    /// Lifetime failures.
    pub total_failures: u32,
}

/// Snapshot of a pool's health.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolHealthReport {
    /// Pool name.
    pub pool: String,
    /// Aggregate health.
    pub overall: PoolHealth,
    /// Ready workers.
    pub healthy: usize,
    /// All workers.
    pub total: usize,
    /// Per-worker details.
    pub workers: Vec<WorkerHealthReport>,
    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

/// Snapshot of the server's health.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerHealthReport {
    /// Aggregate health.
    pub overall: ServerHealth,
    /// One report per pool, in creation order.
    pub pools: Vec<PoolHealthReport>,
}

/// Creates the [`ManagedWorker`] of a pool slot.
pub trait ManagedWorkerFactory: Send + Sync + 'static {
    /// Builds an idle worker.
    fn create(&self, config: WorkerConfig, env: WorkerEnv) -> ManagedWorker;
}

/// Builds workers backed by a [`WorkerSpawner`].
#[derive(Clone)]
pub struct SpawnerWorkerFactory {
    spawner: Arc<dyn WorkerSpawner>,
}

impl SpawnerWorkerFactory {
    /// Wraps a spawner.
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self { spawner }
    }
}

impl ManagedWorkerFactory for SpawnerWorkerFactory {
    fn create(&self, config: WorkerConfig, env: WorkerEnv) -> ManagedWorker {
        ManagedWorker::new(config, self.spawner.clone(), env)
    }
}

/// Creates the [`WorkerPool`]s of a [`PoolManager`].
pub trait WorkerPoolFactory: Send + Sync + 'static {
    /// Builds an empty pool.
    fn create(
        &self,
        config: WorkerPoolConfig,
        env: WorkerEnv,
        workers: Arc<dyn ManagedWorkerFactory>,
    ) -> WorkerPool;
}

/// Builds plain [`WorkerPool`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPoolFactory;

impl WorkerPoolFactory for DefaultPoolFactory {
    fn create(
        &self,
        config: WorkerPoolConfig,
        env: WorkerEnv,
        workers: Arc<dyn ManagedWorkerFactory>,
    ) -> WorkerPool {
        WorkerPool::new(config, env, workers)
    }
}
