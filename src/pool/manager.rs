//! # Pool manager: named pools and server health.
//!
//! Each application instance or job tier gets its own pool so failures stay
//! isolated: a degraded job tier does not degrade a healthy API tier. The
//! manager folds the pool healths into one server health and notifies only
//! when that aggregate changes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::join_all;
use tracing::{debug, info};

use crate::error::{PoolError, WorkerError};
use crate::events::{Event, EventKind};
use crate::pool::{
    DefaultPoolFactory, JobRunnersPool, ManagedWorkerFactory, PoolHealth, ServerHealth,
    ServerHealthReport, SpawnerWorkerFactory, WorkerPool, WorkerPoolConfig, WorkerPoolFactory,
};
use crate::worker::{WorkerEnv, WorkerSpawner};

/// Callback invoked with the new server health.
pub type ServerHealthListener = Arc<dyn Fn(ServerHealth) + Send + Sync>;

type PoolChangeListener = Arc<dyn Fn(&str, PoolHealth) + Send + Sync>;

struct ManagerInner {
    env: WorkerEnv,
    worker_factory: Arc<dyn ManagedWorkerFactory>,
    pool_factory: Arc<dyn WorkerPoolFactory>,
    pools: Mutex<Vec<WorkerPool>>,
    health: Mutex<ServerHealth>,
    listeners: Mutex<Vec<ServerHealthListener>>,
    pool_listeners: Mutex<Vec<PoolChangeListener>>,
}

/// Registry of named pools with aggregate health.
///
/// Cheap to clone; clones share the same pools.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoolManager {
    /// Creates a manager with explicit factories.
    pub fn new(
        env: WorkerEnv,
        worker_factory: Arc<dyn ManagedWorkerFactory>,
        pool_factory: Arc<dyn WorkerPoolFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                env,
                worker_factory,
                pool_factory,
                pools: Mutex::new(Vec::new()),
                health: Mutex::new(PoolHealth::Healthy),
                listeners: Mutex::new(Vec::new()),
                pool_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a manager whose workers are spawned by `spawner`.
    pub fn with_spawner(env: WorkerEnv, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self::new(
            env,
            Arc::new(SpawnerWorkerFactory::new(spawner)),
            Arc::new(DefaultPoolFactory),
        )
    }

    /// Current server health.
    pub fn health(&self) -> ServerHealth {
        *guard(&self.inner.health)
    }

    /// Number of pools.
    pub fn pool_count(&self) -> usize {
        guard(&self.inner.pools).len()
    }

    /// Pool by name.
    pub fn get_pool(&self, name: &str) -> Option<WorkerPool> {
        guard(&self.inner.pools)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Job runner view of a pool.
    pub fn job_runners(&self, name: &str) -> Option<JobRunnersPool> {
        self.get_pool(name).map(JobRunnersPool::from)
    }

    /// All pools, in creation order.
    pub fn pools(&self) -> Vec<WorkerPool> {
        guard(&self.inner.pools).clone()
    }

    /// Registers a server health listener.
    pub fn on_health_change(&self, listener: ServerHealthListener) {
        guard(&self.inner.listeners).push(listener);
    }

    /// Registers a per-pool health listener, called with `(pool, health)`.
    pub fn on_pool_health_change(&self, listener: impl Fn(&str, PoolHealth) + Send + Sync + 'static) {
        guard(&self.inner.pool_listeners).push(Arc::new(listener));
    }

    /// Creates and registers a pool.
    pub fn create_pool(&self, config: WorkerPoolConfig) -> Result<WorkerPool, PoolError> {
        let mut pools = guard(&self.inner.pools);
        if pools.iter().any(|p| p.name() == config.name) {
            return Err(PoolError::DuplicatePool { name: config.name });
        }

        let name = config.name.clone();
        let pool = self.inner.pool_factory.create(
            config,
            self.inner.env.clone(),
            self.inner.worker_factory.clone(),
        );

        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let pool_name = name.clone();
        pool.on_health_change(Arc::new(move |health| {
            if let Some(inner) = manager.upgrade() {
                let manager = PoolManager { inner };
                manager.pool_health_changed(&pool_name, health);
                manager.update_health();
            }
        }));

        pools.push(pool.clone());
        debug!(pool = %name, "pool created");
        Ok(pool)
    }

    /// Starts every pool concurrently; returns the first failure, if any.
    pub async fn start_all(&self) -> Result<(), WorkerError> {
        let pools = self.pools();
        debug!(count = pools.len(), "starting all pools");
        let results = join_all(pools.iter().map(|p| p.start_all())).await;
        debug!(count = pools.len(), "all pools started");
        results.into_iter().collect()
    }

    /// Stops every pool concurrently and forgets them.
    pub async fn stop_all(&self) {
        let pools = std::mem::take(&mut *guard(&self.inner.pools));
        debug!(count = pools.len(), "stopping all pools");
        join_all(pools.iter().map(|p| p.stop_all())).await;
        debug!("all pools stopped");
    }

    /// Restarts failed workers of every pool; returns how many were restarted.
    pub async fn restart_failed_workers(&self) -> usize {
        let pools = self.pools();
        join_all(pools.iter().map(|p| p.restart_failed_workers()))
            .await
            .into_iter()
            .sum()
    }

    /// Health snapshot of every pool.
    pub fn health_report(&self) -> ServerHealthReport {
        ServerHealthReport {
            overall: self.health(),
            pools: self.pools().iter().map(|p| p.health_report()).collect(),
        }
    }

    fn pool_health_changed(&self, pool: &str, health: PoolHealth) {
        let listeners = guard(&self.inner.pool_listeners).clone();
        for listener in &listeners {
            listener(pool, health);
        }
    }

    fn compute_health(&self) -> ServerHealth {
        let healths: Vec<PoolHealth> = self.pools().iter().map(|p| p.health()).collect();
        if healths.iter().all(|h| *h == PoolHealth::Healthy) {
            PoolHealth::Healthy
        } else if healths.iter().any(|h| *h != PoolHealth::Unhealthy)
            && self.inner.env.policy.allow_degraded_mode()
        {
            PoolHealth::Degraded
        } else {
            PoolHealth::Unhealthy
        }
    }

    fn update_health(&self) {
        let next = self.compute_health();
        let prev = {
            let mut health = guard(&self.inner.health);
            if *health == next {
                return;
            }
            std::mem::replace(&mut *health, next)
        };

        info!(from = %prev, to = %next, "server health changed");
        self.inner.env.bus.publish(
            Event::new(EventKind::ServerHealthChanged).with_transition(prev.as_str(), next.as_str()),
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

    use crate::error::PoolError;
    use crate::worker::WorkerKind;
    use crate::worker::testing::{ParkPolicy, task, whoami_spawner};
    use serde_json::Value;

    fn manager(degraded: bool) -> PoolManager {
        PoolManager::with_spawner(
            WorkerEnv::new(Arc::new(ParkPolicy { degraded })),
            whoami_spawner(),
        )
    }

    fn add_pool(manager: &PoolManager, name: &str, size: usize) -> WorkerPool {
        let pool = manager
            .create_pool(WorkerPoolConfig::new(name, WorkerKind::Application, "whoami"))
            .unwrap();
        for i in 0..size {
            pool.add(Value::Null, i);
        }
        pool
    }

    #[test]
    fn test_duplicate_pool_is_rejected() {
        let manager = manager(true);
        add_pool(&manager, "api", 1);
        let err = manager
            .create_pool(WorkerPoolConfig::new("api", WorkerKind::Application, "whoami"))
            .unwrap_err();
        assert_eq!(err, PoolError::DuplicatePool { name: "api".into() });
        assert_eq!(manager.pool_count(), 1);
        assert!(manager.get_pool("api").is_some());
        assert!(manager.get_pool("admin").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_domains_stay_isolated() {
        let manager = manager(true);
        let api = add_pool(&manager, "api", 1);
        let jobs = add_pool(&manager, "jobs", 2);

        let pool_events = Arc::new(Mutex::new(Vec::new()));
        let sink = pool_events.clone();
        manager.on_pool_health_change(move |pool, health| {
            sink.lock().unwrap().push((pool.to_string(), health));
        });

        manager.start_all().await.unwrap();
        assert_eq!(manager.health(), PoolHealth::Healthy);

        let _ = jobs.workers()[0].run(task("crash")).await;
        assert_eq!(jobs.health(), PoolHealth::Degraded);
        assert_eq!(api.health(), PoolHealth::Healthy);
        assert_eq!(manager.health(), PoolHealth::Degraded);
        assert!(
            pool_events
                .lock()
                .unwrap()
                .contains(&("jobs".to_string(), PoolHealth::Degraded))
        );

        let report = manager.health_report();
        assert_eq!(report.overall, PoolHealth::Degraded);
        assert_eq!(report.pools.len(), 2);
        assert_eq!(report.pools[0].pool, "api");

        manager.stop_all().await;
        assert_eq!(manager.pool_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_health_emits_only_on_change() {
        let manager = manager(false);
        let api = add_pool(&manager, "api", 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_health_change(Arc::new(move |h| sink.lock().unwrap().push(h)));

        manager.start_all().await.unwrap();
        let _ = api.workers()[0].run(task("crash")).await;
        let _ = api.workers()[1].run(task("crash")).await;
        assert_eq!(manager.health(), PoolHealth::Unhealthy);

        assert_eq!(manager.restart_failed_workers().await, 2);
        assert_eq!(manager.health(), PoolHealth::Healthy);

        let seen = seen.lock().unwrap().clone();
        assert!(seen.windows(2).all(|w| w[0] != w[1]), "duplicate notification: {seen:?}");
        assert_eq!(seen.last(), Some(&PoolHealth::Healthy));
        manager.stop_all().await;
    }
}
