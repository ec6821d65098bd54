//! Server lifecycle, hot reload and the pool-backed server instance.
//!
//! ## Contents
//! - [`ServerLifecycle`], [`LifecycleState`] state machine owning the server instance
//! - [`ServerFactory`], [`ServerInstance`] what the lifecycle creates and drives
//! - [`HmrCoordinator`] serializes reloads with the supersede rule
//! - [`PoolServer`], [`PoolServerFactory`] server instance backed by a [`PoolManager`](crate::PoolManager)
//! - [`Terminate`], [`ProcessExit`], [`RecordExit`] process exit hook for `Exit` decisions
//!
//! ## Transitions
//! ```text
//! idle ──start()──► starting ──ok──► running ──reload()──► reloading ──ok──► running
//!                      │                │                      │
//!                      └──err──► failed ◄───────────err────────┘
//!                                  │  └──reload()──► reloading
//! running/failed/reloading ──stop()──► stopping ──► stopped
//! ```

mod hmr;
mod instance;
mod lifecycle;
mod terminate;

pub use hmr::HmrCoordinator;
pub use instance::{PoolServer, PoolServerFactory};
pub use lifecycle::{
    LifecycleErrorListener, LifecycleListener, LifecycleState, ServerFactory, ServerInstance,
    ServerLifecycle,
};
pub use terminate::{ProcessExit, RecordExit, Terminate};
