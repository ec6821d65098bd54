//! # LogWriter: bus events rendered through `tracing`
//!
//! A minimal subscriber that turns incoming [`Event`]s into structured log
//! records. The library never installs a global `tracing` subscriber; events
//! only show up once the application does.
//!
//! ## Levels
//! - `error`: startup failures that exit, grace exceeded, subscriber panics
//! - `warn`: worker failures, failed jobs, overflow, handled startup failures
//! - `info`: readiness, restarts, lifecycle and health changes, shutdown
//! - `debug`: everything else

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let source = e.source.as_deref().unwrap_or("-");
        let pool = e.pool.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        let from = e.from.unwrap_or("-");
        let to = e.to.unwrap_or("-");

        match e.kind {
            EventKind::WorkerStateChanged => {
                debug!(worker = source, pool, from, to, "worker state changed");
            }
            EventKind::WorkerReady => {
                info!(worker = source, pool, hosts = reason, "worker ready");
            }
            EventKind::WorkerFailed => {
                warn!(
                    worker = source,
                    pool,
                    failures = e.failures,
                    action = e.action,
                    reason,
                    "worker failed"
                );
            }
            EventKind::RestartScheduled => {
                info!(worker = source, pool, delay_ms = e.delay_ms, failures = e.failures, "worker restart scheduled");
            }
            EventKind::PoolHealthChanged => {
                info!(pool, from, to, "pool health changed");
            }
            EventKind::ServerHealthChanged => {
                info!(from, to, "server health changed");
            }
            EventKind::LifecycleChanged => {
                info!(from, to, "server lifecycle changed");
            }
            EventKind::StartupFailed if e.handled == Some(false) => {
                error!(action = e.action, reason, "server startup failed");
            }
            EventKind::StartupFailed => {
                warn!(action = e.action, reason, "server startup failed");
            }
            EventKind::ReloadSuperseded => {
                debug!("reload superseded");
            }
            EventKind::ReloadCompleted => {
                info!(error = e.reason.as_deref(), "reload completed");
            }
            EventKind::JobStepCompleted => {
                debug!(job = source, step = e.step, label = reason, duration_ms = e.delay_ms, "job step completed");
            }
            EventKind::JobStepSkipped => {
                debug!(job = source, step = e.step, label = reason, "job step skipped");
            }
            EventKind::JobCompleted => {
                debug!(job = source, "job completed");
            }
            EventKind::JobFailed => {
                warn!(job = source, retryable = e.handled, reason, "job failed");
            }
            EventKind::SubscriberOverflow => {
                warn!(subscriber = source, reason, "subscriber dropped an event");
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = source, info = reason, "subscriber panicked");
            }
            EventKind::ShutdownRequested => {
                info!("shutdown requested");
            }
            EventKind::AllStoppedWithin => {
                info!("server stopped within grace period");
            }
            EventKind::GraceExceeded => {
                error!(reason, "grace period exceeded");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
