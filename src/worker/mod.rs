//! Worker units and their supervision.
//!
//! ## Contents
//! - [`WorkerState`], [`WorkerKind`], [`WorkerConfig`], [`WorkerContext`] data model
//! - [`WorkerSpawner`], [`WorkerUnit`], [`WorkerPort`] how units are created
//! - [`ThreadSpawner`], [`ProcessSpawner`], [`TaskSpawner`] isolation backends
//! - [`ManagedWorker`] state machine supervising one unit
//!
//! ## State machine
//! ```text
//!  idle ──start()──► starting ──ready──► ready
//!   ▲                   │                 │
//!   │              timeout/error      crash/error
//!   │                   ▼                 ▼
//!   └──timer fires── restarting ◄─policy── error
//!
//!  idle/starting/ready/error/restarting ──stop()──► stopping ──► stopped
//! ```

mod managed;
mod process;
mod thread;
mod unit;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerError;

pub use managed::{ManagedWorker, StateListener, WorkerEnv};
pub use process::{ProcessSpawner, WORKER_CONFIG_ENV, serve_stdio};
pub use thread::{TaskSpawner, ThreadSpawner};
pub use unit::{EntryFn, ExitFuture, Outbox, UnitMessage, WorkerPort, WorkerSpawner, WorkerUnit};

/// State of a [`ManagedWorker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No unit exists; `start()` is allowed.
    Idle,
    /// Unit spawned, waiting for `ready`.
    Starting,
    /// Unit is serving.
    Ready,
    /// Unit crashed or failed to start.
    Error,
    /// Restart timer armed.
    Restarting,
    /// Unit is being terminated.
    Stopping,
    /// Terminal.
    Stopped,
}

impl WorkerState {
    /// Returns the snake_case label of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Error => "error",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker unit runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Application server instance.
    Application,
    /// Job runner tier.
    JobRunner,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerKind::Application => "application",
            WorkerKind::JobRunner => "job_runner",
        })
    }
}

/// Immutable description of one worker slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker id (`"{pool}-{index+1}"` for pool workers).
    pub id: String,
    /// Owning pool name.
    pub pool: String,
    /// Slot index inside the pool.
    pub index: usize,
    /// Unit type.
    pub kind: WorkerKind,
    /// Spawn descriptor understood by the [`WorkerSpawner`].
    pub entry: String,
    /// Startup payload handed to the unit.
    pub data: Value,
}

/// Failure counters of a [`ManagedWorker`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerContext {
    /// Failures since the worker was last considered stable.
    pub consecutive_failures: u32,
    /// Failures over the worker's lifetime.
    pub total_failures: u32,
    /// When the worker last reported `ready`.
    pub last_stable: Option<DateTime<Utc>>,
    /// The most recent failure.
    pub last_error: Option<WorkerError>,
}

#[cfg(test)]
pub(crate) mod testing;
