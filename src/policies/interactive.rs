//! # Development error policy.
//!
//! Somebody is watching the terminal and editing code, so nothing here exits
//! the process:
//!
//! - startup errors: [`ErrorAction::Wait`] for a reload that fixes the code
//! - worker errors: restart with exponential backoff (100ms doubling, capped at
//!   5s) until `max_retries` effective failures, then park in `error`
//! - stability window: a worker that was ready for longer than the window
//!   counts its next crash as the first one
//! - degraded mode: allowed

use std::time::Duration;

use crate::error::{LifecycleError, WorkerError};
use crate::policies::{BackoffPolicy, ErrorAction, ErrorPolicy, JitterPolicy, WorkerErrorContext};

/// Failure policy for interactive (development) runs.
#[derive(Clone, Debug)]
pub struct InteractivePolicy {
    backoff: BackoffPolicy,
    max_retries: u32,
    stability_window: Duration,
}

impl Default for InteractivePolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_retries: 1,
            stability_window: Duration::from_secs(30),
        }
    }
}

impl InteractivePolicy {
    /// Sets the ready time after which a crash counts as the first one.
    pub fn with_stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    /// Sets the effective failure count at which the worker parks in `error`.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the restart backoff.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter applied to restart delays.
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.backoff.jitter = jitter;
        self
    }

    fn effective_failures(&self, ctx: &WorkerErrorContext) -> u32 {
        match ctx.since_stable {
            Some(elapsed) if elapsed > self.stability_window => 1,
            _ => ctx.consecutive_failures,
        }
    }
}

impl ErrorPolicy for InteractivePolicy {
    fn on_startup_error(&self, _error: &LifecycleError) -> ErrorAction {
        ErrorAction::Wait
    }

    fn on_worker_error(&self, _error: &WorkerError, ctx: &WorkerErrorContext) -> ErrorAction {
        let failures = self.effective_failures(ctx);
        if failures >= self.max_retries {
            return ErrorAction::Wait;
        }
        ErrorAction::Restart {
            delay: self.backoff.delay(failures),
        }
    }

    fn restart_delay(&self, consecutive_failures: u32) -> Duration {
        self.backoff.delay(consecutive_failures)
    }

    fn allow_degraded_mode(&self) -> bool {
        true
    }

    fn stability_window(&self) -> Option<Duration> {
        Some(self.stability_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerKind;

    fn ctx(consecutive: u32, since_stable: Option<Duration>) -> WorkerErrorContext {
        WorkerErrorContext {
            worker_id: "app-1".into(),
            worker_kind: WorkerKind::Application,
            consecutive_failures: consecutive,
            total_failures: consecutive,
            since_stable,
        }
    }

    fn crash() -> WorkerError {
        WorkerError::UnexpectedExit {
            worker: "app-1".into(),
            code: 1,
        }
    }

    #[test]
    fn test_startup_error_waits() {
        let policy = InteractivePolicy::default();
        let err = LifecycleError::Server(std::sync::Arc::new(anyhow::anyhow!("syntax error")));
        assert_eq!(policy.on_startup_error(&err), ErrorAction::Wait);
    }

    #[test]
    fn test_default_ceiling_parks_after_first_failure() {
        let policy = InteractivePolicy::default();
        assert_eq!(policy.on_worker_error(&crash(), &ctx(1, None)), ErrorAction::Wait);
    }

    #[test]
    fn test_restarts_with_backoff_below_ceiling() {
        let policy = InteractivePolicy::default().with_max_retries(5);
        assert_eq!(
            policy.on_worker_error(&crash(), &ctx(1, None)),
            ErrorAction::Restart { delay: Duration::from_millis(100) }
        );
        assert_eq!(
            policy.on_worker_error(&crash(), &ctx(3, Some(Duration::from_secs(1)))),
            ErrorAction::Restart { delay: Duration::from_millis(400) }
        );
        assert_eq!(
            policy.on_worker_error(&crash(), &ctx(5, None)),
            ErrorAction::Wait
        );
    }

    #[test]
    fn test_stable_worker_counts_as_first_failure() {
        let policy = InteractivePolicy::default().with_max_retries(3);
        let action = policy.on_worker_error(&crash(), &ctx(7, Some(Duration::from_secs(31))));
        assert_eq!(action, ErrorAction::Restart { delay: Duration::from_millis(100) });
    }

    #[test]
    fn test_restart_delay_formula() {
        let policy = InteractivePolicy::default();
        assert_eq!(policy.restart_delay(1), Duration::from_millis(100));
        assert_eq!(policy.restart_delay(4), Duration::from_millis(800));
        assert_eq!(policy.restart_delay(50), Duration::from_millis(5000));
        assert!(policy.allow_degraded_mode());
    }
}
