//! # Reload coordinator.
//!
//! Collapses bursts of reload triggers into at most one reload beyond the one
//! already running.
//!
//! ```text
//! schedule_reload()
//!   ├─ nothing active ──► run now; caller resolves with its own result
//!   └─ reload active  ──► resolve the previous pending caller (superseded, Ok)
//!                         and become the only pending caller
//! active reload done ──► pending caller? run it next, resolve that caller
//! ```
//!
//! A reload is `ServerLifecycle::reload()` when allowed, `start()` when the
//! lifecycle is idle or failed, and a logged no-op otherwise. A reload that
//! leaves the lifecycle failed resolves its caller with the startup error.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::events::{Bus, Event, EventKind};
use crate::server::{LifecycleState, ServerLifecycle};
use crate::subscribers::panic_message;

type Waiter = oneshot::Sender<Result<(), LifecycleError>>;

#[derive(Default)]
struct State {
    active: bool,
    pending: Option<Waiter>,
}

struct Inner {
    lifecycle: ServerLifecycle,
    bus: Bus,
    state: Mutex<State>,
}

/// Serializes reloads of a [`ServerLifecycle`] with the supersede rule.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct HmrCoordinator {
    inner: Arc<Inner>,
}

impl HmrCoordinator {
    /// Creates a coordinator for `lifecycle`, publishing on `bus`.
    pub fn new(lifecycle: ServerLifecycle, bus: Bus) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                bus,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Whether a reload is executing.
    pub fn is_reloading(&self) -> bool {
        self.lock().active
    }

    /// Whether a reload is queued behind the executing one.
    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Requests a reload and waits until the reload covering this request finished.
    ///
    /// A superseded request resolves with `Ok(())` without running its own reload.
    pub async fn schedule_reload(&self) -> Result<(), LifecycleError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.active {
                if let Some(previous) = state.pending.replace(tx) {
                    let _ = previous.send(Ok(()));
                    debug!("pending reload superseded");
                    self.inner
                        .bus
                        .publish(Event::new(EventKind::ReloadSuperseded));
                }
            } else {
                state.active = true;
                tokio::spawn(self.clone().drive(tx));
            }
        }
        rx.await.unwrap_or_else(|_| {
            Err(LifecycleError::Server(Arc::new(anyhow::anyhow!(
                "reload abandoned before completion"
            ))))
        })
    }

    /// Runs reloads back to back until nothing is pending.
    async fn drive(self, first: Waiter) {
        let mut driving = Driving(Some(self.clone()));
        let mut waiter = first;
        loop {
            let result = match AssertUnwindSafe(self.execute()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let info = panic_message(panic.as_ref());
                    error!(info = %info, "reload panicked");
                    Err(LifecycleError::Server(Arc::new(anyhow::anyhow!(
                        "reload panicked: {info}"
                    ))))
                }
            };
            let _ = waiter.send(result);

            let mut state = self.lock();
            match state.pending.take() {
                Some(next) => waiter = next,
                None => {
                    state.active = false;
                    driving.0 = None;
                    return;
                }
            }
        }
    }

    async fn execute(&self) -> Result<(), LifecycleError> {
        let lifecycle = &self.inner.lifecycle;
        let result = if lifecycle.can_reload() {
            lifecycle.reload().await
        } else if lifecycle.can_start() {
            info!("server not running, starting instead of reloading");
            lifecycle.start().await
        } else {
            warn!(state = %lifecycle.state(), "cannot reload server in this state");
            Ok(())
        };
        let result = match result {
            Ok(()) if lifecycle.state() == LifecycleState::Failed => {
                Err(lifecycle.last_error().unwrap_or_else(|| {
                    LifecycleError::Server(Arc::new(anyhow::anyhow!("server failed to start")))
                }))
            }
            other => other,
        };

        let mut event = Event::new(EventKind::ReloadCompleted);
        if let Err(err) = &result {
            event = event.with_reason(err.to_string());
        }
        self.inner.bus.publish(event);
        result
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the coordinator if a driver is dropped before finishing.
struct Driving(Option<HmrCoordinator>);

impl Drop for Driving {
    fn drop(&mut self) {
        if let Some(hmr) = self.0.take() {
            let mut state = hmr.lock();
            state.active = false;
            state.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::future::join_all;

    use crate::error::WorkerError;
    use crate::policies::{ErrorAction, ErrorPolicy, InteractivePolicy, WorkerErrorContext};
    use crate::server::{ServerFactory, ServerInstance};

    struct SlowServer;

    #[async_trait]
    impl ServerInstance for SlowServer {
        async fn start(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct CountingFactory(Arc<AtomicUsize>);

    #[async_trait]
    impl ServerFactory for CountingFactory {
        async fn create(&self) -> anyhow::Result<Box<dyn ServerInstance>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SlowServer))
        }
    }

    fn coordinator() -> (HmrCoordinator, ServerLifecycle, Arc<AtomicUsize>, Bus) {
        let created = Arc::new(AtomicUsize::new(0));
        let lifecycle = ServerLifecycle::new(
            Arc::new(CountingFactory(created.clone())),
            Arc::new(InteractivePolicy::default()),
        );
        let bus = Bus::new(64);
        (HmrCoordinator::new(lifecycle.clone(), bus.clone()), lifecycle, created, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_extra_reload() {
        let (hmr, lifecycle, created, bus) = coordinator();
        let mut rx = bus.subscribe();
        lifecycle.start().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let first = {
            let hmr = hmr.clone();
            tokio::spawn(async move { hmr.schedule_reload().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hmr.is_reloading());

        let burst: Vec<_> = (0..5)
            .map(|_| {
                let hmr = hmr.clone();
                tokio::spawn(async move { hmr.schedule_reload().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hmr.is_pending());

        first.await.unwrap().unwrap();
        for result in join_all(burst).await {
            result.unwrap().unwrap();
        }

        // Initial start, the in-flight reload and one collapsed reload.
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert!(!hmr.is_reloading());
        assert!(!hmr.is_pending());
        assert_eq!(lifecycle.state(), LifecycleState::Running);

        let mut superseded = 0;
        let mut completed = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev.kind {
                EventKind::ReloadSuperseded => superseded += 1,
                EventKind::ReloadCompleted => completed += 1,
                _ => {}
            }
        }
        assert_eq!(superseded, 4);
        assert_eq!(completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_starts_an_idle_server() {
        let (hmr, lifecycle, created, _) = coordinator();
        hmr.schedule_reload().await.unwrap();
        assert!(lifecycle.is_running());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_after_stop_is_a_no_op() {
        let (hmr, lifecycle, created, _) = coordinator();
        lifecycle.start().await.unwrap();
        lifecycle.stop().await.unwrap();
        hmr.schedule_reload().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    struct QuickServer;

    #[async_trait]
    impl ServerInstance for QuickServer {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Panics on its second `create()`.
    struct PanicOnSecondCreate(Arc<AtomicUsize>);

    #[async_trait]
    impl ServerFactory for PanicOnSecondCreate {
        async fn create(&self) -> anyhow::Result<Box<dyn ServerInstance>> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("factory exploded");
            }
            Ok(Box::new(QuickServer))
        }
    }

    #[tokio::test]
    async fn test_panicking_reload_reports_failure_and_frees_the_queue() {
        let created = Arc::new(AtomicUsize::new(0));
        let lifecycle = ServerLifecycle::new(
            Arc::new(PanicOnSecondCreate(created.clone())),
            Arc::new(InteractivePolicy::default()),
        );
        let hmr = HmrCoordinator::new(lifecycle.clone(), Bus::new(16));
        lifecycle.start().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), hmr.schedule_reload())
            .await
            .expect("reload resolves")
            .unwrap_err();
        assert!(err.to_string().contains("factory exploded"), "{err}");
        assert_eq!(lifecycle.state(), LifecycleState::Failed);
        assert!(!hmr.is_reloading());

        tokio::time::timeout(Duration::from_secs(5), hmr.schedule_reload())
            .await
            .expect("later reload does not hang")
            .unwrap();
        assert!(lifecycle.is_running());
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    /// Panics when asked about a startup failure.
    struct PanickingPolicy;

    impl ErrorPolicy for PanickingPolicy {
        fn on_startup_error(&self, _error: &LifecycleError) -> ErrorAction {
            panic!("policy exploded");
        }
        fn on_worker_error(&self, _: &WorkerError, _: &WorkerErrorContext) -> ErrorAction {
            ErrorAction::Wait
        }
        fn restart_delay(&self, _: u32) -> Duration {
            Duration::ZERO
        }
        fn allow_degraded_mode(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_panic_inside_a_reload_releases_the_coordinator() {
        let created = Arc::new(AtomicUsize::new(0));
        let lifecycle = ServerLifecycle::new(
            Arc::new(PanicOnSecondCreate(created.clone())),
            Arc::new(PanickingPolicy),
        );
        let hmr = HmrCoordinator::new(lifecycle.clone(), Bus::new(16));
        lifecycle.start().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), hmr.schedule_reload())
            .await
            .expect("reload resolves")
            .unwrap_err();
        assert!(err.to_string().contains("policy exploded"), "{err}");
        assert_eq!(lifecycle.state(), LifecycleState::Failed);
        assert!(!hmr.is_reloading());
        assert!(!hmr.is_pending());

        tokio::time::timeout(Duration::from_secs(5), hmr.schedule_reload())
            .await
            .expect("later reload does not hang")
            .unwrap();
        assert!(lifecycle.is_running());
    }
}
