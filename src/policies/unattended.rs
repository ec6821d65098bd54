//! # Production error policy.
//!
//! Nobody is watching, so failures are bounded and then handed to the process
//! manager:
//!
//! - startup errors: exit with code 1
//! - worker errors: restart after a fixed 1s delay, exit with code 1 once the
//!   worker reached `max_retries` consecutive failures
//! - every failure accumulates (no stability window)
//! - degraded mode: forbidden

use std::time::Duration;

use crate::error::{LifecycleError, WorkerError};
use crate::policies::{BackoffPolicy, ErrorAction, ErrorPolicy, JitterPolicy, WorkerErrorContext};

/// Failure policy for unattended (production) runs.
#[derive(Clone, Debug)]
pub struct UnattendedPolicy {
    backoff: BackoffPolicy,
    max_retries: u32,
    exit_code: i32,
}

impl Default for UnattendedPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::fixed(Duration::from_secs(1)),
            max_retries: 3,
            exit_code: 1,
        }
    }
}

impl UnattendedPolicy {
    /// Sets the consecutive failure count at which the process exits.
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
}

impl ErrorPolicy for UnattendedPolicy {
    fn on_startup_error(&self, _error: &LifecycleError) -> ErrorAction {
        ErrorAction::Exit {
            code: self.exit_code,
        }
    }

    fn on_worker_error(&self, _error: &WorkerError, ctx: &WorkerErrorContext) -> ErrorAction {
        if ctx.consecutive_failures >= self.max_retries {
            return ErrorAction::Exit {
                code: self.exit_code,
            };
        }
        ErrorAction::Restart {
            delay: self.backoff.delay(ctx.consecutive_failures),
        }
    }

    fn restart_delay(&self, consecutive_failures: u32) -> Duration {
        self.backoff.delay(consecutive_failures)
    }

    fn allow_degraded_mode(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerKind;

    fn ctx(consecutive: u32) -> WorkerErrorContext {
        WorkerErrorContext {
            worker_id: "jobs-1".into(),
            worker_kind: WorkerKind::JobRunner,
            consecutive_failures: consecutive,
            total_failures: consecutive,
            since_stable: Some(Duration::from_secs(3600)),
        }
    }

    #[test]
    fn test_restarts_then_exits() {
        let policy = UnattendedPolicy::default();
        let err = WorkerError::UnexpectedExit {
            worker: "jobs-1".into(),
            code: 1,
        };
        assert_eq!(
            policy.on_worker_error(&err, &ctx(1)),
            ErrorAction::Restart { delay: Duration::from_secs(1) }
        );
        assert_eq!(
            policy.on_worker_error(&err, &ctx(2)),
            ErrorAction::Restart { delay: Duration::from_secs(1) }
        );
        assert_eq!(policy.on_worker_error(&err, &ctx(3)), ErrorAction::Exit { code: 1 });
    }

    #[test]
    fn test_stable_time_is_ignored() {
        // A long ready period does not reset the count in production.
        let policy = UnattendedPolicy::default();
        let err = WorkerError::Reported {
            worker: "jobs-1".into(),
            error: crate::protocol::ThreadError::new("boom"),
        };
        assert_eq!(policy.on_worker_error(&err, &ctx(4)), ErrorAction::Exit { code: 1 });
        assert_eq!(policy.stability_window(), None);
    }

    #[test]
    fn test_startup_exits_and_no_degraded_mode() {
        let policy = UnattendedPolicy::default();
        let err = LifecycleError::Server(std::sync::Arc::new(anyhow::anyhow!("port in use")));
        assert_eq!(policy.on_startup_error(&err), ErrorAction::Exit { code: 1 });
        assert!(!policy.allow_degraded_mode());
        assert_eq!(policy.restart_delay(9), Duration::from_secs(1));
    }
}
