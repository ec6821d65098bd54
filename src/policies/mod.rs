//! Error and restart policies.
//!
//! This module groups the knobs that control **what happens** when a worker or
//! the server fails, and **how long** to wait before trying again.
//!
//! ## Contents
//! - [`ErrorPolicy`] pure decision function: error + context → [`ErrorAction`]
//! - [`InteractivePolicy`] development policy (wait for fixes, degraded mode allowed)
//! - [`UnattendedPolicy`] production policy (bounded restarts, then exit)
//! - [`BackoffPolicy`] how restart delays evolve (`min(first × factor^(n-1), max)`)
//! - [`JitterPolicy`] randomization strategy to avoid restart storms
//!
//! ## Quick wiring
//! ```text
//! Config { mode } ──► Config::error_policy() ──► Arc<dyn ErrorPolicy>
//!      ├─► ManagedWorker: on crash → on_worker_error(err, ctx) → restart/exit/wait/ignore
//!      ├─► WorkerPool / PoolManager: allow_degraded_mode() → health aggregation
//!      └─► ServerLifecycle: on startup failure → on_startup_error(err)
//! ```

mod action;
mod backoff;
mod interactive;
mod jitter;
mod unattended;

pub use action::{ErrorAction, ErrorPolicy, WorkerErrorContext};
pub use backoff::BackoffPolicy;
pub use interactive::InteractivePolicy;
pub use jitter::JitterPolicy;
pub use unattended::UnattendedPolicy;
