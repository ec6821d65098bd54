//! # Pool-backed server instance.
//!
//! [`PoolServer`] is the server instance used by the runtime: a [`PoolManager`]
//! whose pools are declared by a user closure. Every start or reload builds a
//! fresh manager, so a reload really replaces all workers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::pool::{PoolManager, ServerHealthReport};
use crate::server::{ServerFactory, ServerInstance};
use crate::worker::{WorkerEnv, WorkerSpawner};

type Configure = dyn Fn(&PoolManager) -> anyhow::Result<()> + Send + Sync;

/// Server instance made of named worker pools.
#[derive(Clone)]
pub struct PoolServer {
    manager: PoolManager,
}

impl PoolServer {
    /// Wraps an already configured manager.
    pub fn new(manager: PoolManager) -> Self {
        Self { manager }
    }

    /// The underlying pool manager.
    pub fn manager(&self) -> &PoolManager {
        &self.manager
    }
}

#[async_trait]
impl ServerInstance for PoolServer {
    async fn start(&self) -> anyhow::Result<()> {
        self.manager.start_all().await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.manager.stop_all().await;
        Ok(())
    }

    fn health_report(&self) -> Option<ServerHealthReport> {
        Some(self.manager.health_report())
    }

    async fn restart_failed_workers(&self) -> usize {
        self.manager.restart_failed_workers().await
    }
}

/// Builds a [`PoolServer`] per start/reload.
pub struct PoolServerFactory {
    env: WorkerEnv,
    spawner: Arc<dyn WorkerSpawner>,
    configure: Arc<Configure>,
}

impl PoolServerFactory {
    /// `configure` declares the pools (and their workers) of each new instance.
    pub fn new(
        env: WorkerEnv,
        spawner: Arc<dyn WorkerSpawner>,
        configure: impl Fn(&PoolManager) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            env,
            spawner,
            configure: Arc::new(configure),
        }
    }
}

#[async_trait]
impl ServerFactory for PoolServerFactory {
    async fn create(&self) -> anyhow::Result<Box<dyn ServerInstance>> {
        let manager = PoolManager::with_spawner(self.env.clone(), self.spawner.clone());
        (self.configure)(&manager)?;
        Ok(Box::new(PoolServer::new(manager)))
    }
}
