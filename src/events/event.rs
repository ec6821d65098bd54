//! # Runtime events emitted by workers, pools, the lifecycle and the job runner.
//!
//! The [`EventKind`] enum classifies event types across five categories:
//! - **Worker events**: state changes, readiness, crashes, scheduled restarts
//! - **Health events**: pool and server health changes (emitted only on change)
//! - **Lifecycle events**: server state changes, startup failures, reloads
//! - **Job events**: step completion/skip and job outcome
//! - **Runtime events**: subscriber overflow/panic, shutdown progress
//!
//! The [`Event`] struct carries additional metadata such as timestamps, the
//! emitting component, state labels, reasons, and restart delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use workvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::RestartScheduled)
//!     .with_source("app-1")
//!     .with_reason("exited with code 1")
//!     .with_failures(2)
//!     .with_delay(Duration::from_millis(200));
//!
//! assert_eq!(ev.kind, EventKind::RestartScheduled);
//! assert_eq!(ev.source.as_deref(), Some("app-1"));
//! assert_eq!(ev.delay_ms, Some(200));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets: `source` (subscriber name), `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `source` (subscriber name), `reason` ("full" / "closed").
    SubscriberOverflow,

    // === Shutdown events ===
    /// Shutdown requested (OS signal observed).
    ShutdownRequested,

    /// The server stopped within the configured grace period.
    AllStoppedWithin,

    /// Grace period exceeded; the server did not stop in time.
    GraceExceeded,

    // === Worker events ===
    /// Worker state machine moved between two states.
    ///
    /// Sets: `source` (worker id), `pool`, `from`, `to`.
    WorkerStateChanged,

    /// Worker reported `ready`.
    ///
    /// Sets: `source` (worker id), `pool`, `reason` (advertised hosts, if any).
    WorkerReady,

    /// Worker crashed, timed out or reported an error.
    ///
    /// Sets: `source` (worker id), `pool`, `reason`, `failures` (consecutive),
    /// `action` (policy decision label).
    WorkerFailed,

    /// Worker restart timer armed.
    ///
    /// Sets: `source` (worker id), `pool`, `delay_ms`, `failures`.
    RestartScheduled,

    // === Health events ===
    /// Pool health changed.
    ///
    /// Sets: `pool`, `from`, `to`.
    PoolHealthChanged,

    /// Aggregate server health changed.
    ///
    /// Sets: `from`, `to`.
    ServerHealthChanged,

    // === Lifecycle events ===
    /// Server lifecycle state changed.
    ///
    /// Sets: `from`, `to`.
    LifecycleChanged,

    /// Server start or reload failed.
    ///
    /// Sets: `reason`, `action`, `handled` (false only when the policy exits).
    StartupFailed,

    /// A reload request replaced an earlier pending one.
    ReloadSuperseded,

    /// A reload (or fallback start) finished.
    ///
    /// Sets: `reason` on failure.
    ReloadCompleted,

    // === Job events ===
    /// A job step finished and its output was merged.
    ///
    /// Sets: `source` (job name), `step`, `reason` (step label), `delay_ms` (step duration).
    JobStepCompleted,

    /// A conditional step was skipped.
    ///
    /// Sets: `source` (job name), `step`, `reason` (step label).
    JobStepSkipped,

    /// A job run produced its final output.
    ///
    /// Sets: `source` (job name).
    JobCompleted,

    /// A job run failed.
    ///
    /// Sets: `source` (job name), `reason`, `handled` (false when unrecoverable).
    JobFailed,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Emitting component (worker id, job name, subscriber name).
    pub source: Option<Arc<str>>,
    /// Pool name, if applicable.
    pub pool: Option<Arc<str>>,
    /// Previous state/health label.
    pub from: Option<&'static str>,
    /// New state/health label.
    pub to: Option<&'static str>,
    /// Human-readable reason (errors, overflow details, labels).
    pub reason: Option<Arc<str>>,
    /// Delay or duration in milliseconds (compact).
    pub delay_ms: Option<u32>,
    /// Consecutive failure count.
    pub failures: Option<u32>,
    /// Error policy decision label.
    pub action: Option<&'static str>,
    /// Job step index.
    pub step: Option<u32>,
    /// Whether the failure was handled without exiting/giving up.
    pub handled: Option<bool>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            source: None,
            pool: None,
            from: None,
            to: None,
            reason: None,
            delay_ms: None,
            failures: None,
            action: None,
            step: None,
            handled: None,
        }
    }

    /// Attaches the emitting component.
    #[inline]
    pub fn with_source(mut self, source: impl Into<Arc<str>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attaches a pool name.
    #[inline]
    pub fn with_pool(mut self, pool: impl Into<Arc<str>>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// Attaches a `from -> to` transition.
    #[inline]
    pub fn with_transition(mut self, from: &'static str, to: &'static str) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a delay or duration (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    /// Attaches a consecutive failure count.
    #[inline]
    pub fn with_failures(mut self, n: u32) -> Self {
        self.failures = Some(n);
        self
    }

    /// Attaches an error policy decision label.
    #[inline]
    pub fn with_action(mut self, action: &'static str) -> Self {
        self.action = Some(action);
        self
    }

    /// Attaches a job step index.
    #[inline]
    pub fn with_step(mut self, index: usize) -> Self {
        self.step = Some(index.min(u32::MAX as usize) as u32);
        self
    }

    /// Marks whether the failure was handled.
    #[inline]
    pub fn with_handled(mut self, handled: bool) -> Self {
        self.handled = Some(handled);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_source(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_source(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}
