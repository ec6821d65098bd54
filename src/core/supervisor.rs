//! # Supervisor: owns the server lifecycle, event delivery and graceful shutdown.
//!
//! The [`Supervisor`] owns the event bus, a [`SubscriberSet`], the
//! [`ServerLifecycle`] and the [`HmrCoordinator`] wrapped around it.
//!
//! ## Key responsibilities
//! - subscribe to the [`Bus`] and **fan-out** events via [`SubscriberSet`]
//! - start the server through its lifecycle (startup failures go through the error policy)
//! - handle OS termination signals (SIGINT/SIGTERM/SIGQUIT/Ctrl-C) or a programmatic [`Supervisor::shutdown`]
//! - stop the server within [`Config::grace`]
//!
//! ## Run path
//! ```text
//! run()
//!   ├─► subscriber_listener(): Bus.subscribe() ─► SubscriberSet::emit(&Event)
//!   ├─► lifecycle.start()              (failed startup: policy decides, run keeps waiting)
//!   ├─► wait: OS signal | shutdown()
//!   │         └─► Bus.publish(ShutdownRequested)
//!   └─► timeout(cfg.grace, lifecycle.stop()):
//!          ├─ Ok       → Bus.publish(AllStoppedWithin)
//!          └─ Timeout  → Bus.publish(GraceExceeded), Err(RuntimeError::GraceExceeded)
//! ```
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use workvisor::{
//!     Config, LogWriter, PoolServerFactory, Subscribe, Supervisor, ThreadSpawner,
//!     WorkerKind, WorkerPoolConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let builder = Supervisor::builder(Config::default()).with_subscribers(subs);
//!
//!     let spawner = Arc::new(ThreadSpawner::new().with_entry("app", |mut port| async move {
//!         port.ready(None);
//!         while port.recv().await.is_some() {}
//!         Ok(())
//!     }));
//!     let factory = PoolServerFactory::new(builder.env(), spawner, |manager| {
//!         let pool = manager.create_pool(WorkerPoolConfig::new("app", WorkerKind::Application, "app"))?;
//!         pool.add(serde_json::json!({}), 0);
//!         Ok(())
//!     });
//!
//!     builder.build(factory).run().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::{SupervisorBuilder, shutdown};
use crate::error::{LifecycleError, RuntimeError};
use crate::events::{Bus, Event, EventKind};
use crate::server::{HmrCoordinator, ServerLifecycle};
use crate::subscribers::SubscriberSet;
use crate::{config::Config, worker::WorkerEnv};

/// Runs one server until a termination signal, with hot reload and event fan-out.
pub struct Supervisor {
    cfg: Config,
    env: WorkerEnv,
    subs: Arc<SubscriberSet>,
    lifecycle: ServerLifecycle,
    hmr: HmrCoordinator,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Starts building a supervisor.
    pub fn builder(cfg: Config) -> SupervisorBuilder {
        SupervisorBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        cfg: Config,
        env: WorkerEnv,
        subs: Arc<SubscriberSet>,
        lifecycle: ServerLifecycle,
        hmr: HmrCoordinator,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            env,
            subs,
            lifecycle,
            hmr,
            shutdown,
        }
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Event bus shared by every component.
    pub fn bus(&self) -> &Bus {
        &self.env.bus
    }

    /// Collaborators handed to workers.
    pub fn env(&self) -> &WorkerEnv {
        &self.env
    }

    /// The server lifecycle.
    pub fn lifecycle(&self) -> &ServerLifecycle {
        &self.lifecycle
    }

    /// The reload coordinator.
    pub fn hmr(&self) -> &HmrCoordinator {
        &self.hmr
    }

    /// Requests a reload; bursts collapse into at most one extra reload.
    pub async fn reload(&self) -> Result<(), LifecycleError> {
        self.hmr.schedule_reload().await
    }

    /// Restarts parked workers of the running server; returns how many were restarted.
    pub async fn restart_failed_workers(&self) -> usize {
        self.lifecycle.restart_failed_workers().await
    }

    /// Makes [`Supervisor::run`] stop the server as if a signal had arrived.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Starts the server and runs until a termination signal or [`Supervisor::shutdown`].
    ///
    /// A startup failure handled by the policy (wait, restart, ignore) keeps the
    /// supervisor waiting so a reload can fix it.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        self.subscriber_listener();
        self.lifecycle.start().await?;
        info!(state = %self.lifecycle.state(), "supervisor running");

        self.wait_for_shutdown().await;
        self.bus().publish(Event::new(EventKind::ShutdownRequested));
        self.stop_with_grace().await
    }

    /// Subscribes to the bus and forwards events to the subscriber set (fire-and-forget).
    fn subscriber_listener(&self) {
        if self.subs.is_empty() {
            return;
        }
        let mut rx = self.bus().subscribe();
        let set = Arc::clone(&self.subs);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscriber listener lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn wait_for_shutdown(&self) {
        tokio::select! {
            res = shutdown::wait_for_shutdown_signal() => match res {
                Ok(signal) => info!(signal, "termination signal received"),
                Err(err) => {
                    warn!(error = %err, "cannot listen for termination signals");
                    self.shutdown.cancelled().await;
                }
            },
            _ = self.shutdown.cancelled() => info!("shutdown requested"),
        }
    }

    /// Stops the server within [`Config::grace`].
    ///
    /// Publishes [`EventKind::AllStoppedWithin`] on success, or
    /// [`EventKind::GraceExceeded`] and returns [`RuntimeError::GraceExceeded`].
    async fn stop_with_grace(&self) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace;
        match tokio::time::timeout(grace, self.lifecycle.stop()).await {
            Ok(res) => {
                if let Err(err) = res {
                    warn!(error = %err, "server stop rejected");
                }
                self.bus().publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                let state = self.lifecycle.state();
                error!(?grace, state = %state, "server did not stop within grace period");
                self.bus().publish(
                    Event::new(EventKind::GraceExceeded).with_reason(format!("state={state}")),
                );
                Err(RuntimeError::GraceExceeded { grace, state })
            }
        }
    }
}
