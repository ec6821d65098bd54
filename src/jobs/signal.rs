//! # Cooperative job cancellation.
//!
//! A [`JobSignal`] is checked by the runner at every step boundary; a handler
//! that is already running is never preempted. Handlers that block for long
//! can watch [`JobSignal::cancelled`] themselves.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// Abort signal of one job run.
///
/// Cheap to clone; clones observe the same cancellation.
#[derive(Clone, Debug, Default)]
pub struct JobSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl JobSignal {
    /// Creates a signal that is not aborted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal aborted whenever `self` is; its own aborts do not propagate up.
    ///
    /// An unrecoverable reason set on the parent is not inherited: the child
    /// sees a plain cancellation.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Plain cancellation: the job may be redelivered later by its queue.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Aborts the run and forbids any redelivery.
    pub fn abort_unrecoverable(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| reason.into());
        }
        self.token.cancel();
    }

    /// Whether the run was aborted.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason given to [`JobSignal::abort_unrecoverable`], if that is how the run was aborted.
    pub fn unrecoverable_reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Completes once the run is aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_follows_parent_but_not_reverse() {
        let parent = JobSignal::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_aborted());
        assert!(!parent.is_aborted());

        let other = parent.child();
        parent.abort_unrecoverable("queue record removed");
        assert!(other.is_aborted());
        assert_eq!(other.unrecoverable_reason(), None);
        assert_eq!(parent.unrecoverable_reason().as_deref(), Some("queue record removed"));
    }

    #[test]
    fn test_first_unrecoverable_reason_wins() {
        let signal = JobSignal::new();
        signal.abort_unrecoverable("first");
        signal.abort_unrecoverable("second");
        assert_eq!(signal.unrecoverable_reason().as_deref(), Some("first"));
    }
}
