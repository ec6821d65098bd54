//! # Worker pool: one failure domain.
//!
//! A [`WorkerPool`] owns the workers serving one logical role (an application
//! instance or a job tier). Every worker state change recomputes the pool's
//! health; listeners hear about it only when the value actually changes.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::WorkerError;
use crate::events::{Event, EventKind};
use crate::pool::{
    ManagedWorkerFactory, PoolHealth, PoolHealthReport, WorkerHealthReport, WorkerPoolConfig,
};
use crate::worker::{ManagedWorker, WorkerConfig, WorkerEnv, WorkerState};

/// Callback invoked with the new pool health.
pub type PoolHealthListener = Arc<dyn Fn(PoolHealth) + Send + Sync>;

pub(crate) struct PoolInner {
    config: WorkerPoolConfig,
    env: WorkerEnv,
    factory: Arc<dyn ManagedWorkerFactory>,
    workers: Mutex<Vec<ManagedWorker>>,
    health: Mutex<PoolHealth>,
    listeners: Mutex<Vec<PoolHealthListener>>,
    pub(crate) cursor: AtomicUsize,
}

/// Set of workers for one logical service.
///
/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.config.name)
            .field("health", &self.health())
            .finish()
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shallow object merge; `over` keys win. Non-object `over` replaces `base`.
fn merge_data(base: &Value, over: Value) -> Value {
    match (base, over) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            merged.extend(over);
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, over) => over,
    }
}

impl WorkerPool {
    /// Creates an empty, healthy pool.
    pub fn new(
        config: WorkerPoolConfig,
        env: WorkerEnv,
        factory: Arc<dyn ManagedWorkerFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                env,
                factory,
                workers: Mutex::new(Vec::new()),
                health: Mutex::new(PoolHealth::Healthy),
                listeners: Mutex::new(Vec::new()),
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Pool description.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Current health.
    pub fn health(&self) -> PoolHealth {
        *guard(&self.inner.health)
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        guard(&self.inner.workers).len()
    }

    /// Number of ready workers.
    pub fn healthy_count(&self) -> usize {
        self.workers().iter().filter(|w| w.is_healthy()).count()
    }

    /// Snapshot of the workers.
    pub fn workers(&self) -> Vec<ManagedWorker> {
        guard(&self.inner.workers).clone()
    }

    /// Registers a health change listener.
    pub fn on_health_change(&self, listener: PoolHealthListener) {
        guard(&self.inner.listeners).push(listener);
    }

    /// Adds a worker slot.
    ///
    /// The worker id is `"{pool}-{index+1}"`; its payload is the pool payload
    /// overlaid with `data`.
    pub fn add(&self, data: Value, index: usize) -> ManagedWorker {
        let cfg = &self.inner.config;
        let config = WorkerConfig {
            id: format!("{}-{}", cfg.name, index + 1),
            pool: cfg.name.clone(),
            index,
            kind: cfg.kind,
            entry: cfg.entry.clone(),
            data: merge_data(&cfg.data, data),
        };
        let worker = self.inner.factory.create(config, self.inner.env.clone());

        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        worker.on_state_change(Arc::new(move |_, _| {
            if let Some(inner) = pool.upgrade() {
                WorkerPool { inner }.update_health();
            }
        }));

        guard(&self.inner.workers).push(worker.clone());
        worker
    }

    /// Starts every worker concurrently; returns the first failure, if any.
    pub async fn start_all(&self) -> Result<(), WorkerError> {
        let workers = self.workers();
        debug!(pool = %self.name(), count = workers.len(), "starting all workers");
        let results = join_all(workers.iter().map(|w| w.start())).await;
        debug!(pool = %self.name(), count = workers.len(), "all workers started");
        results.into_iter().collect()
    }

    /// Stops every worker concurrently, detaches all listeners and empties the pool.
    pub async fn stop_all(&self) {
        let workers = std::mem::take(&mut *guard(&self.inner.workers));
        debug!(pool = %self.name(), count = workers.len(), "stopping all workers");
        for worker in &workers {
            worker.clear_listeners();
        }
        join_all(workers.iter().map(|w| w.stop())).await;
        guard(&self.inner.listeners).clear();
        debug!(pool = %self.name(), "all workers stopped and cleaned up");
    }

    /// Restarts the workers parked in `error` after resetting their failure counts.
    ///
    /// Returns how many workers were restarted.
    pub async fn restart_failed_workers(&self) -> usize {
        let failed: Vec<ManagedWorker> = self
            .workers()
            .into_iter()
            .filter(|w| w.state() == WorkerState::Error)
            .collect();
        if failed.is_empty() {
            return 0;
        }

        debug!(pool = %self.name(), count = failed.len(), "restarting failed workers");
        for worker in &failed {
            worker.reset_failure_count();
        }
        for (worker, result) in failed.iter().zip(join_all(failed.iter().map(|w| w.start())).await) {
            if let Err(err) = result {
                debug!(worker = %worker.id(), error = %err, "failed worker did not come back");
            }
        }
        failed.len()
    }

    /// Health snapshot.
    pub fn health_report(&self) -> PoolHealthReport {
        let workers = self.workers();
        let details: Vec<WorkerHealthReport> = workers
            .iter()
            .map(|w| {
                let ctx = w.context();
                WorkerHealthReport {
                    id: w.id().to_string(),
                    state: w.state(),
                    consecutive_failures: ctx.consecutive_failures,
                    total_failures: ctx.total_failures,
                }
            })
            .collect();
        PoolHealthReport {
            pool: self.name().to_string(),
            overall: self.health(),
            healthy: details.iter().filter(|w| w.state == WorkerState::Ready).count(),
            total: details.len(),
            workers: details,
            checked_at: Utc::now(),
        }
    }

    fn compute_health(&self) -> PoolHealth {
        let workers = self.workers();
        let ready = workers.iter().filter(|w| w.is_healthy()).count();
        if ready == workers.len() {
            PoolHealth::Healthy
        } else if ready > 0 && self.inner.env.policy.allow_degraded_mode() {
            PoolHealth::Degraded
        } else {
            PoolHealth::Unhealthy
        }
    }

    pub(crate) fn update_health(&self) {
        let next = self.compute_health();
        let prev = {
            let mut health = guard(&self.inner.health);
            if *health == next {
                return;
            }
            std::mem::replace(&mut *health, next)
        };

        trace!(pool = %self.name(), from = %prev, to = %next, "pool health changed");
        self.inner.env.bus.publish(
            Event::new(EventKind::PoolHealthChanged)
                .with_pool(self.name())
                .with_transition(prev.as_str(), next.as_str()),
        );
        let listeners = guard(&self.inner.listeners).clone();
        for listener in &listeners {
            listener(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::pool::SpawnerWorkerFactory;
    use crate::worker::WorkerKind;
    use crate::worker::testing::{ParkPolicy, task, whoami_spawner};

    fn pool(degraded: bool, size: usize) -> WorkerPool {
        let env = WorkerEnv::new(Arc::new(ParkPolicy { degraded }));
        let pool = WorkerPool::new(
            WorkerPoolConfig::new("api", WorkerKind::Application, "whoami")
                .with_data(json!({"region": "eu", "port": 0})),
            env,
            Arc::new(SpawnerWorkerFactory::new(whoami_spawner())),
        );
        for i in 0..size {
            pool.add(json!({ "port": 3000 + i }), i);
        }
        pool
    }

    fn record(pool: &WorkerPool) -> Arc<Mutex<Vec<PoolHealth>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pool.on_health_change(Arc::new(move |h| sink.lock().unwrap().push(h)));
        seen
    }

    #[test]
    fn test_add_names_and_merges_payload() {
        let pool = pool(true, 2);
        let workers = pool.workers();
        assert_eq!(workers[0].id(), "api-1");
        assert_eq!(workers[1].id(), "api-2");
        assert_eq!(workers[1].config().data, json!({"region": "eu", "port": 3001}));
        assert_eq!(pool.health(), PoolHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_when_policy_allows() {
        let pool = pool(true, 2);
        let seen = record(&pool);
        pool.start_all().await.unwrap();
        assert_eq!(pool.healthy_count(), 2);

        let _ = pool.workers()[0].run(task("crash")).await;
        assert_eq!(pool.health(), PoolHealth::Degraded);

        let _ = pool.workers()[1].run(task("crash")).await;
        assert_eq!(pool.health(), PoolHealth::Unhealthy);
        assert_eq!(pool.healthy_count(), 0);

        // Starting went through Unhealthy (nobody ready yet) back to Healthy.
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.last(), Some(&PoolHealth::Unhealthy));
        assert!(seen.windows(2).all(|w| w[0] != w[1]), "duplicate notification: {seen:?}");
        pool.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_capacity_is_unhealthy_without_degraded_mode() {
        let pool = pool(false, 2);
        pool.start_all().await.unwrap();
        let _ = pool.workers()[0].run(task("crash")).await;
        assert_eq!(pool.healthy_count(), 1);
        assert_eq!(pool.health(), PoolHealth::Unhealthy);
        pool.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_failed_workers_only_touches_errored_ones() {
        let pool = pool(true, 3);
        pool.start_all().await.unwrap();
        let _ = pool.workers()[1].run(task("crash")).await;
        assert_eq!(pool.health_report().workers[1].state, WorkerState::Error);

        assert_eq!(pool.restart_failed_workers().await, 1);
        assert_eq!(pool.health(), PoolHealth::Healthy);

        let report = pool.health_report();
        assert_eq!(report.healthy, 3);
        assert_eq!(report.workers[1].consecutive_failures, 0);
        assert_eq!(report.workers[1].total_failures, 1);
        assert_eq!(pool.restart_failed_workers().await, 0);
        pool.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_detaches_listeners_and_empties_pool() {
        let pool = pool(true, 2);
        let seen = record(&pool);
        pool.start_all().await.unwrap();
        let before = seen.lock().unwrap().len();

        pool.stop_all().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(seen.lock().unwrap().len(), before);
    }
}
