//! # Error policy contract.
//!
//! An [`ErrorPolicy`] is a pure decision function. Given an error and the failure
//! history of the component that produced it, it returns an [`ErrorAction`].
//! Callers apply the action; the policy never touches worker or server state.
//!
//! | Action                  | Worker (`ManagedWorker`)            | Server (`ServerLifecycle`)        |
//! |-------------------------|-------------------------------------|-----------------------------------|
//! | `Exit { code }`         | terminate the whole process         | terminate the whole process       |
//! | `Restart { delay }`     | timer-driven restart                | self-retry if still `failed`      |
//! | `Wait`                  | park in `error` for a manual retry  | park in `failed` for a reload     |
//! | `Ignore`                | log and do nothing                  | log and do nothing                |

use std::fmt;
use std::time::Duration;

use crate::error::{LifecycleError, WorkerError};
use crate::worker::WorkerKind;

/// Decision returned by an [`ErrorPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Terminate the process with the given exit code.
    Exit {
        /// Process exit code.
        code: i32,
    },
    /// Retry after the given delay.
    Restart {
        /// Delay before the retry.
        delay: Duration,
    },
    /// Stay failed until an external trigger (reload, manual restart).
    Wait,
    /// Log and carry on.
    Ignore,
}

impl ErrorAction {
    /// Returns a short stable label for logs/events.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorAction::Exit { .. } => "exit",
            ErrorAction::Restart { .. } => "restart",
            ErrorAction::Wait => "wait",
            ErrorAction::Ignore => "ignore",
        }
    }
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorAction::Exit { code } => write!(f, "exit({code})"),
            ErrorAction::Restart { delay } => write!(f, "restart({delay:?})"),
            ErrorAction::Wait => f.write_str("wait"),
            ErrorAction::Ignore => f.write_str("ignore"),
        }
    }
}

/// Failure history handed to [`ErrorPolicy::on_worker_error`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerErrorContext {
    /// Worker id.
    pub worker_id: String,
    /// Worker unit type.
    pub worker_kind: WorkerKind,
    /// Failures since the worker was last considered stable (includes this one).
    pub consecutive_failures: u32,
    /// Failures over the worker's lifetime (includes this one).
    pub total_failures: u32,
    /// Time elapsed since the worker last reported `ready`, if it ever did.
    pub since_stable: Option<Duration>,
}

/// Environment-specific failure handling.
///
/// Implementations must be cheap and side-effect free; they are consulted
/// while the caller is in the middle of a state transition.
pub trait ErrorPolicy: Send + Sync + 'static {
    /// How to handle a server startup (or reload) failure.
    fn on_startup_error(&self, error: &LifecycleError) -> ErrorAction;

    /// How to handle a worker crash.
    fn on_worker_error(&self, error: &WorkerError, ctx: &WorkerErrorContext) -> ErrorAction;

    /// Delay before restarting a worker after `consecutive_failures` failures.
    fn restart_delay(&self, consecutive_failures: u32) -> Duration;

    /// Whether a pool (and the server) may keep serving with partial capacity.
    fn allow_degraded_mode(&self) -> bool;

    /// Ready time after which a crash is considered isolated.
    ///
    /// When `Some`, a worker that was ready for longer than the window resets its
    /// consecutive failure count to 1 before the policy is consulted. `None`
    /// means every failure accumulates.
    fn stability_window(&self) -> Option<Duration> {
        None
    }
}
