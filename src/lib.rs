//! # workvisor
//!
//! **Workvisor** supervises isolated worker units and runs resumable,
//! multi-step jobs on them.
//!
//! A server is a set of named worker pools. Every worker unit runs on its own
//! thread or child process and talks to the supervisor only through a closed
//! message protocol.
//! Crashes, readiness timeouts and reported errors go through an
//! [`ErrorPolicy`] that decides whether to restart, wait for a fix, ignore the
//! failure or exit the process. Job pools execute [`jobs::Job`]s step by step,
//! persisting a checkpoint after every step so a redelivered job resumes where
//! the previous attempt stopped.
//!
//! ## Architecture
//! ```text
//!                         ┌───────────────────────────────┐
//!   OS signal / reload ──►│ Supervisor                    │
//!                         │  - ServerLifecycle            │── Bus ──► SubscriberSet ──► LogWriter, ...
//!                         │  - HmrCoordinator             │
//!                         └──────────────┬────────────────┘
//!                                        ▼
//!                         ┌───────────────────────────────┐
//!                         │ PoolServer (PoolManager)      │  server health = f(pool health)
//!                         └──────┬─────────────────┬──────┘
//!                                ▼                 ▼
//!                         WorkerPool "app"   JobRunnersPool "jobs"     pool health = f(worker states)
//!                           │       │          │          │
//!                           ▼       ▼          ▼          ▼
//!                      ManagedWorker ...   ManagedWorker ...           restart timers, failure counters
//!                           │                  │
//!                  ready/error/task      task ▲ │ task result
//!                           ▼                  │ ▼
//!                       worker unit      JobWorkerRuntime ──► JobRunner ──► CheckpointStore
//! ```
//!
//! ## Failure handling
//! ```text
//! worker failure ─► consecutive_failures += 1 (reset to 1 after a stable run)
//!                ─► ErrorPolicy::on_worker_error
//!                     ├─ Restart ─► restart timer (BackoffPolicy delay) ─► start()
//!                     ├─ Wait    ─► parked in error until restart_failed_workers() / reload
//!                     ├─ Ignore  ─► logged, nothing else happens
//!                     └─ Exit    ─► Terminate::exit(1)
//! ```
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                                 |
//! |-------------------|---------------------------------------------------------------|----------------------------------------------------|
//! | **Workers**       | Supervised worker units with a closed message protocol.       | [`ManagedWorker`], [`WorkerSpawner`], [`protocol`] |
//! | **Pools**         | Named pools, round-robin job dispatch, health aggregation.    | [`WorkerPool`], [`JobRunnersPool`], [`PoolManager`]|
//! | **Policies**      | Interactive and unattended failure handling with backoff.     | [`ErrorPolicy`], [`BackoffPolicy`]                 |
//! | **Lifecycle**     | Server state machine and coalescing hot reload.               | [`ServerLifecycle`], [`HmrCoordinator`]            |
//! | **Jobs**          | Typed step pipelines with checkpoints and parallel groups.    | [`jobs::Job`], [`jobs::JobRunner`]                 |
//! | **Subscriber API**| Hook into runtime events (logging, metrics, alerts).          | [`Subscribe`], [`LogWriter`]                       |
//! | **Errors**        | Typed errors per failure domain.                              | [`WorkerError`], [`JobError`], [`RuntimeError`]    |
//! | **Configuration** | Centralized runtime settings.                                 | [`Config`]                                         |
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use workvisor::jobs::{JobRegistry, JobRunner, JobWorkerRuntime};
//! use workvisor::{Config, PoolServerFactory, Supervisor, ThreadSpawner, WorkerKind, WorkerPoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = JobWorkerRuntime::new(JobRegistry::new(), JobRunner::new());
//!     let spawner = Arc::new(ThreadSpawner::new().with_entry_fn("jobs", runtime.entry()));
//!
//!     let builder = Supervisor::builder(Config::default());
//!     let factory = PoolServerFactory::new(builder.env(), spawner, |manager| {
//!         let pool = manager.create_pool(WorkerPoolConfig::new("jobs", WorkerKind::JobRunner, "jobs"))?;
//!         for index in 0..2 {
//!             pool.add(serde_json::json!({}), index);
//!         }
//!         Ok(())
//!     });
//!
//!     builder.build(factory).run().await?;
//!     Ok(())
//! }
//! ```
mod config;
mod core;
mod error;
mod events;
mod policies;
mod pool;
mod server;
mod subscribers;
mod worker;

pub mod jobs;
pub mod protocol;

// ---- Public re-exports ----

pub use config::{Config, RuntimeMode, WorkerSettings};
pub use crate::core::{Supervisor, SupervisorBuilder};
pub use error::{
    DefinitionError, JobError, LifecycleError, PoolError, ProtocolError, RunError, RuntimeError,
    SchemaError, StoreError, WorkerError,
};
pub use events::{Bus, Event, EventKind};
pub use policies::{
    BackoffPolicy, ErrorAction, ErrorPolicy, InteractivePolicy, JitterPolicy, UnattendedPolicy,
    WorkerErrorContext,
};
pub use pool::{
    DefaultPoolFactory, JobRunnersPool, ManagedWorkerFactory, PoolHealth, PoolHealthListener,
    PoolHealthReport, PoolManager, ServerHealth, ServerHealthListener, ServerHealthReport,
    SpawnerWorkerFactory, WorkerHealthReport, WorkerPool, WorkerPoolConfig, WorkerPoolFactory,
};
pub use server::{
    HmrCoordinator, LifecycleErrorListener, LifecycleListener, LifecycleState, PoolServer,
    PoolServerFactory, ProcessExit, RecordExit, ServerFactory, ServerInstance, ServerLifecycle,
    Terminate,
};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use worker::{
    EntryFn, ExitFuture, ManagedWorker, Outbox, ProcessSpawner, StateListener, TaskSpawner,
    ThreadSpawner, UnitMessage, WORKER_CONFIG_ENV, WorkerConfig, WorkerContext, WorkerEnv,
    WorkerKind, WorkerPort, WorkerSpawner, WorkerState, WorkerUnit, serve_stdio,
};
