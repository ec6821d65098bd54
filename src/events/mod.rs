//! Runtime events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to runtime events emitted by workers, pools, the pool
//! manager, the server lifecycle, the reload coordinator and the job runner.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `ManagedWorker`, `WorkerPool`, `PoolManager`, `ServerLifecycle`,
//!   `HmrCoordinator`, `JobRunner`, `SubscriberSet` workers (overflow/panic), `Supervisor`.
//! - **Consumers**: `Supervisor`'s subscriber listener (fans out to `SubscriberSet`).
//!
//! See `core/mod.rs` for the system-level wiring diagram.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
