//! # Server lifecycle state machine.
//!
//! [`ServerLifecycle`] owns the one running server instance of the process. It
//! creates instances through a [`ServerFactory`], replaces them on reload and
//! asks the [`ErrorPolicy`] what to do when creating or starting one fails.
//!
//! ## Guards
//! | call       | allowed from                    | otherwise                  |
//! |------------|---------------------------------|----------------------------|
//! | `start()`  | idle, failed                    | `InvalidState`             |
//! | `reload()` | running, failed                 | `InvalidState`             |
//! | `stop()`   | running, failed, reloading      | no-op from idle/stopped, `InvalidState` else |
//!
//! A guard violation returns before any state change. A startup failure is not
//! an error of the call: the lifecycle moves to `failed`, the policy decides and
//! the call returns `Ok(())`.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::LifecycleError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::{ErrorAction, ErrorPolicy};
use crate::pool::ServerHealthReport;
use crate::server::Terminate;
use crate::subscribers::panic_message;
use crate::worker::WorkerEnv;

/// State of the server lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing started yet.
    Idle,
    /// First start in progress.
    Starting,
    /// Server instance is up.
    Running,
    /// Old instance stopped, new one being started.
    Reloading,
    /// Shutdown in progress.
    Stopping,
    /// Terminal.
    Stopped,
    /// Last start or reload failed.
    Failed,
}

impl LifecycleState {
    /// Returns the snake_case name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Reloading => "reloading",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    fn can_start(self) -> bool {
        matches!(self, LifecycleState::Idle | LifecycleState::Failed)
    }

    fn can_reload(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Failed)
    }

    fn can_stop(self) -> bool {
        matches!(
            self,
            LifecycleState::Running | LifecycleState::Failed | LifecycleState::Reloading
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running server: the thing the lifecycle starts, stops and replaces.
#[async_trait]
pub trait ServerInstance: Send + Sync + 'static {
    /// Brings the instance up. Called once, right after creation.
    async fn start(&self) -> anyhow::Result<()>;

    /// Tears the instance down. Errors are logged by the lifecycle, never propagated.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Health of the instance, when it has a notion of one.
    fn health_report(&self) -> Option<ServerHealthReport> {
        None
    }

    /// Restarts the workers parked in `error`; returns how many were restarted.
    async fn restart_failed_workers(&self) -> usize {
        0
    }
}

/// Creates fresh server instances (one per start or reload).
#[async_trait]
pub trait ServerFactory: Send + Sync + 'static {
    /// Builds a new, not yet started, instance.
    async fn create(&self) -> anyhow::Result<Box<dyn ServerInstance>>;
}

/// Callback invoked on every lifecycle transition with `(from, to)`.
pub type LifecycleListener = Arc<dyn Fn(LifecycleState, LifecycleState) + Send + Sync>;

/// Callback invoked on every startup failure with the error and whether it was handled
/// (`false` only when the policy decided to exit).
pub type LifecycleErrorListener = Arc<dyn Fn(&LifecycleError, bool) + Send + Sync>;

type Transitions = Vec<(LifecycleState, LifecycleState)>;

enum Settled {
    Running,
    Failed(LifecycleError),
    Stale(LifecycleState, Option<Arc<dyn ServerInstance>>),
}

struct Core {
    state: LifecycleState,
    server: Option<Arc<dyn ServerInstance>>,
    retry: Option<CancellationToken>,
    last_error: Option<LifecycleError>,
}

impl Core {
    fn transition(&mut self, to: LifecycleState, changes: &mut Transitions) {
        if self.state != to {
            changes.push((self.state, to));
            self.state = to;
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(token) = self.retry.take() {
            token.cancel();
        }
    }
}

struct Inner {
    factory: Arc<dyn ServerFactory>,
    policy: Arc<dyn ErrorPolicy>,
    bus: Bus,
    terminate: Arc<dyn Terminate>,
    core: Mutex<Core>,
    listeners: Mutex<Vec<LifecycleListener>>,
    error_listeners: Mutex<Vec<LifecycleErrorListener>>,
}

/// Start/stop/reload state machine around one server instance.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ServerLifecycle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLifecycle")
            .field("state", &self.state())
            .finish()
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerLifecycle {
    /// Creates an idle lifecycle with a private bus and [`ProcessExit`](crate::server::ProcessExit).
    pub fn new(factory: Arc<dyn ServerFactory>, policy: Arc<dyn ErrorPolicy>) -> Self {
        Self::with_env(factory, WorkerEnv::new(policy))
    }

    /// Creates an idle lifecycle sharing the policy, bus and exit hook of `env`.
    pub fn with_env(factory: Arc<dyn ServerFactory>, env: WorkerEnv) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                policy: env.policy,
                bus: env.bus,
                terminate: env.terminate,
                core: Mutex::new(Core {
                    state: LifecycleState::Idle,
                    server: None,
                    retry: None,
                    last_error: None,
                }),
                listeners: Mutex::new(Vec::new()),
                error_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Whether the server instance is up.
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Whether `start()` is allowed now.
    pub fn can_start(&self) -> bool {
        self.state().can_start()
    }

    /// Whether `reload()` is allowed now.
    pub fn can_reload(&self) -> bool {
        self.state().can_reload()
    }

    /// Whether `stop()` would do anything now.
    pub fn can_stop(&self) -> bool {
        self.state().can_stop()
    }

    /// The running server instance, if any.
    pub fn server(&self) -> Option<Arc<dyn ServerInstance>> {
        self.lock().server.clone()
    }

    /// Error of the last failed start or reload; cleared once a server runs.
    pub fn last_error(&self) -> Option<LifecycleError> {
        self.lock().last_error.clone()
    }

    /// Health of the running server instance, if it reports one.
    pub fn health_report(&self) -> Option<ServerHealthReport> {
        self.server().and_then(|s| s.health_report())
    }

    /// Restarts the failed workers of the running instance.
    pub async fn restart_failed_workers(&self) -> usize {
        match self.server() {
            Some(server) => server.restart_failed_workers().await,
            None => 0,
        }
    }

    /// Registers a transition listener.
    pub fn on_state_change(&self, listener: LifecycleListener) {
        guard(&self.inner.listeners).push(listener);
    }

    /// Registers a startup failure listener.
    pub fn on_error(&self, listener: LifecycleErrorListener) {
        guard(&self.inner.error_listeners).push(listener);
    }

    /// Creates and starts the server instance.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut changes = Transitions::new();
        {
            let mut core = self.lock();
            if !core.state.can_start() {
                return Err(LifecycleError::InvalidState {
                    state: core.state,
                    expected: "idle, failed".into(),
                });
            }
            core.cancel_retry();
            core.transition(LifecycleState::Starting, &mut changes);
        }
        self.emit(changes);

        debug!("starting server");
        let launched = self.launch().await;
        self.settle(LifecycleState::Starting, launched).await;
        Ok(())
    }

    /// Stops the current instance and starts a fresh one.
    pub async fn reload(&self) -> Result<(), LifecycleError> {
        let mut changes = Transitions::new();
        let old = {
            let mut core = self.lock();
            if !core.state.can_reload() {
                return Err(LifecycleError::InvalidState {
                    state: core.state,
                    expected: "running, failed".into(),
                });
            }
            core.cancel_retry();
            core.transition(LifecycleState::Reloading, &mut changes);
            core.server.take()
        };
        self.emit(changes);

        info!("reloading server");
        if let Some(old) = old {
            if let Err(err) = stop_instance(old.as_ref()).await {
                warn!(error = %err, "previous server failed to stop cleanly");
            }
        }
        let launched = self.launch().await;
        self.settle(LifecycleState::Reloading, launched).await;
        Ok(())
    }

    /// Stops the server. No-op from idle or stopped; always ends in stopped otherwise.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut changes = Transitions::new();
        let server = {
            let mut core = self.lock();
            match core.state {
                LifecycleState::Idle | LifecycleState::Stopped => return Ok(()),
                state if state.can_stop() => {}
                state => {
                    return Err(LifecycleError::InvalidState {
                        state,
                        expected: "running, failed, reloading".into(),
                    });
                }
            }
            core.cancel_retry();
            core.transition(LifecycleState::Stopping, &mut changes);
            core.server.take()
        };
        self.emit(changes);

        debug!("stopping server");
        if let Some(server) = server {
            if let Err(err) = stop_instance(server.as_ref()).await {
                error!(error = %err, "server failed to stop cleanly");
            }
        }

        let mut changes = Transitions::new();
        self.lock().transition(LifecycleState::Stopped, &mut changes);
        self.emit(changes);
        info!("server stopped");
        Ok(())
    }

    /// Creates and starts one instance. A panic in the factory or the instance
    /// counts as a startup failure.
    async fn launch(&self) -> Result<Arc<dyn ServerInstance>, LifecycleError> {
        match AssertUnwindSafe(self.create_and_start()).catch_unwind().await {
            Ok(launched) => launched,
            Err(panic) => {
                let info = panic_message(panic.as_ref());
                error!(info = %info, "server startup panicked");
                Err(LifecycleError::Server(Arc::new(anyhow::anyhow!(
                    "server startup panicked: {info}"
                ))))
            }
        }
    }

    /// A half started instance is stopped on failure.
    async fn create_and_start(&self) -> Result<Arc<dyn ServerInstance>, LifecycleError> {
        let server: Arc<dyn ServerInstance> = self
            .inner
            .factory
            .create()
            .await
            .map_err(|e| LifecycleError::Server(Arc::new(e)))?
            .into();
        if let Err(err) = server.start().await {
            if let Err(stop_err) = stop_instance(server.as_ref()).await {
                debug!(error = %stop_err, "failed server did not stop cleanly");
            }
            return Err(LifecycleError::Server(Arc::new(err)));
        }
        Ok(server)
    }

    /// Applies the outcome of `launch()` if the lifecycle is still in `expected`.
    ///
    /// A `stop()` that ran meanwhile wins: the new instance is stopped again.
    async fn settle(
        &self,
        expected: LifecycleState,
        launched: Result<Arc<dyn ServerInstance>, LifecycleError>,
    ) {
        let mut changes = Transitions::new();
        let outcome = {
            let mut core = self.lock();
            if core.state != expected {
                Settled::Stale(core.state, launched.ok())
            } else {
                match launched {
                    Ok(server) => {
                        core.server = Some(server);
                        core.last_error = None;
                        core.transition(LifecycleState::Running, &mut changes);
                        Settled::Running
                    }
                    Err(err) => {
                        core.last_error = Some(err.clone());
                        core.transition(LifecycleState::Failed, &mut changes);
                        Settled::Failed(err)
                    }
                }
            }
        };
        self.emit(changes);

        match outcome {
            Settled::Running => info!("server running"),
            Settled::Failed(err) => self.handle_startup_error(err),
            Settled::Stale(current, Some(server)) => {
                debug!(state = %current, "lifecycle moved on during {expected}, dropping new server");
                if let Err(err) = stop_instance(server.as_ref()).await {
                    debug!(error = %err, "dropped server did not stop cleanly");
                }
            }
            Settled::Stale(_, None) => {}
        }
    }

    fn handle_startup_error(&self, err: LifecycleError) {
        let action = self.inner.policy.on_startup_error(&err);
        let handled = !matches!(action, ErrorAction::Exit { .. });
        self.inner.bus.publish(
            Event::new(EventKind::StartupFailed)
                .with_reason(err.to_string())
                .with_action(action.as_label())
                .with_handled(handled),
        );
        let listeners = guard(&self.inner.error_listeners).clone();
        for listener in &listeners {
            listener(&err, handled);
        }

        match action {
            ErrorAction::Exit { code } => {
                error!(error = %err, code, "server startup failed, exiting process");
                self.inner.terminate.exit(code);
            }
            ErrorAction::Restart { delay } => self.schedule_retry(delay),
            ErrorAction::Wait => {
                error!(error = %err, "server startup failed, waiting for a fix");
            }
            ErrorAction::Ignore => {
                warn!(error = %err, "server startup error ignored");
            }
        }
    }

    fn schedule_retry(&self, delay: Duration) {
        let token = CancellationToken::new();
        {
            let mut core = self.lock();
            if core.state != LifecycleState::Failed {
                return;
            }
            core.cancel_retry();
            core.retry = Some(token.clone());
        }

        info!(delay_ms = delay.as_millis() as u64, "scheduling server start retry");
        let lifecycle = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = time::sleep(delay) => lifecycle.retry().await,
            }
        });
    }

    async fn retry(&self) {
        {
            let mut core = self.lock();
            if core.state != LifecycleState::Failed {
                return;
            }
            core.retry = None;
        }
        if let Err(err) = self.start().await {
            debug!(error = %err, "server start retry rejected");
        }
    }

    fn emit(&self, changes: Transitions) {
        if changes.is_empty() {
            return;
        }
        let listeners = guard(&self.inner.listeners).clone();
        for (from, to) in changes {
            trace!(%from, %to, "lifecycle transition");
            self.inner.bus.publish(
                Event::new(EventKind::LifecycleChanged).with_transition(from.as_str(), to.as_str()),
            );
            for listener in &listeners {
                listener(from, to);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        guard(&self.inner.core)
    }
}

/// Stops an instance; a panic becomes an error.
async fn stop_instance(server: &dyn ServerInstance) -> anyhow::Result<()> {
    AssertUnwindSafe(server.stop())
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "server stop panicked: {}",
                panic_message(panic.as_ref())
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::WorkerError;
    use crate::policies::{InteractivePolicy, UnattendedPolicy, WorkerErrorContext};
    use crate::server::RecordExit;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicUsize,
        failures_left: AtomicUsize,
    }

    struct FakeServer {
        counters: Arc<Counters>,
        fail: bool,
        start_delay: Duration,
    }

    #[async_trait]
    impl ServerInstance for FakeServer {
        async fn start(&self) -> anyhow::Result<()> {
            time::sleep(self.start_delay).await;
            if self.fail {
                anyhow::bail!("port already in use");
            }
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory {
        counters: Arc<Counters>,
        start_delay: Duration,
    }

    #[async_trait]
    impl ServerFactory for FakeFactory {
        async fn create(&self) -> anyhow::Result<Box<dyn ServerInstance>> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .counters
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(Box::new(FakeServer {
                counters: self.counters.clone(),
                fail,
                start_delay: self.start_delay,
            }))
        }
    }

    struct RetryPolicy;

    impl ErrorPolicy for RetryPolicy {
        fn on_startup_error(&self, _error: &LifecycleError) -> ErrorAction {
            ErrorAction::Restart {
                delay: Duration::from_secs(1),
            }
        }
        fn on_worker_error(&self, _: &WorkerError, _: &WorkerErrorContext) -> ErrorAction {
            ErrorAction::Wait
        }
        fn restart_delay(&self, _: u32) -> Duration {
            Duration::from_secs(1)
        }
        fn allow_degraded_mode(&self) -> bool {
            true
        }
    }

    fn lifecycle_on(
        bus: Bus,
        policy: Arc<dyn ErrorPolicy>,
        failures: usize,
        start_delay: Duration,
    ) -> (ServerLifecycle, Arc<Counters>, Arc<RecordExit>) {
        let counters = Arc::new(Counters::default());
        counters.failures_left.store(failures, Ordering::SeqCst);
        let exit = Arc::new(RecordExit::new());
        let env = WorkerEnv::new(policy)
            .with_bus(bus)
            .with_terminate(exit.clone());
        let factory = Arc::new(FakeFactory {
            counters: counters.clone(),
            start_delay,
        });
        (ServerLifecycle::with_env(factory, env), counters, exit)
    }

    fn lifecycle(
        policy: Arc<dyn ErrorPolicy>,
        failures: usize,
        start_delay: Duration,
    ) -> (ServerLifecycle, Arc<Counters>, Arc<RecordExit>) {
        lifecycle_on(Bus::default(), policy, failures, start_delay)
    }

    #[tokio::test]
    async fn test_guards_follow_the_state_table() {
        let (lc, counters, _) = lifecycle(Arc::new(InteractivePolicy::default()), 0, Duration::ZERO);

        assert!(lc.stop().await.is_ok());
        assert_eq!(lc.state(), LifecycleState::Idle);
        assert!(matches!(
            lc.reload().await,
            Err(LifecycleError::InvalidState { state: LifecycleState::Idle, .. })
        ));

        lc.start().await.unwrap();
        assert!(lc.is_running());
        assert!(lc.start().await.is_err());

        lc.reload().await.unwrap();
        assert!(lc.is_running());
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);

        lc.stop().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Stopped);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 2);
        assert!(lc.stop().await.is_ok());
        assert!(lc.reload().await.is_err());
        assert!(lc.start().await.is_err());
    }

    #[tokio::test]
    async fn test_transitions_are_reported_in_order() {
        let (lc, _, _) = lifecycle(Arc::new(InteractivePolicy::default()), 0, Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        lc.on_state_change(Arc::new(move |from, to| sink.lock().unwrap().push((from, to))));

        lc.start().await.unwrap();
        lc.reload().await.unwrap();
        lc.stop().await.unwrap();

        use LifecycleState::*;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Idle, Starting),
                (Starting, Running),
                (Running, Reloading),
                (Reloading, Running),
                (Running, Stopping),
                (Stopping, Stopped),
            ]
        );
    }

    #[tokio::test]
    async fn test_unattended_startup_failure_exits() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let (lc, counters, exit) =
            lifecycle_on(bus, Arc::new(UnattendedPolicy::default()), 1, Duration::ZERO);

        lc.start().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Failed);
        assert_eq!(exit.codes(), vec![1]);
        // The half started instance is torn down.
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);

        let failed = loop {
            let ev = rx.recv().await.unwrap();
            if ev.kind == EventKind::StartupFailed {
                break ev;
            }
        };
        assert_eq!(failed.handled, Some(false));
        assert_eq!(failed.action, Some("exit"));
    }

    #[tokio::test]
    async fn test_interactive_startup_failure_waits_for_reload() {
        let (lc, _, exit) = lifecycle(Arc::new(InteractivePolicy::default()), 1, Duration::ZERO);
        let handled = Arc::new(Mutex::new(Vec::new()));
        let sink = handled.clone();
        lc.on_error(Arc::new(move |_, h| sink.lock().unwrap().push(h)));

        lc.start().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Failed);
        assert!(exit.codes().is_empty());
        assert_eq!(*handled.lock().unwrap(), vec![true]);

        assert!(lc.can_reload());
        lc.reload().await.unwrap();
        assert!(lc.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_action_retries_while_failed() {
        let (lc, counters, _) = lifecycle(Arc::new(RetryPolicy), 1, Duration::ZERO);
        lc.start().await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Failed);

        time::sleep(Duration::from_millis(1100)).await;
        assert!(lc.is_running());
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let (lc, counters, _) = lifecycle(Arc::new(RetryPolicy), 1, Duration::ZERO);
        lc.start().await.unwrap();
        lc.stop().await.unwrap();

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lc.state(), LifecycleState::Stopped);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_reload_wins() {
        let (lc, counters, _) =
            lifecycle(Arc::new(InteractivePolicy::default()), 0, Duration::from_secs(2));
        lc.start().await.unwrap();

        let reloading = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.reload().await })
        };
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(lc.state(), LifecycleState::Reloading);

        lc.stop().await.unwrap();
        reloading.await.unwrap().unwrap();
        assert_eq!(lc.state(), LifecycleState::Stopped);
        assert!(lc.server().is_none());
        // First instance on reload, second one once the reload noticed the stop.
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 2);
    }

    /// Panics on its second `create()`.
    struct PanicOnSecondCreate {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl ServerFactory for PanicOnSecondCreate {
        async fn create(&self) -> anyhow::Result<Box<dyn ServerInstance>> {
            if self.counters.created.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("factory exploded");
            }
            Ok(Box::new(FakeServer {
                counters: self.counters.clone(),
                fail: false,
                start_delay: Duration::ZERO,
            }))
        }
    }

    #[tokio::test]
    async fn test_factory_panic_fails_the_reload() {
        let counters = Arc::new(Counters::default());
        let factory = Arc::new(PanicOnSecondCreate {
            counters: counters.clone(),
        });
        let env = WorkerEnv::new(Arc::new(InteractivePolicy::default()))
            .with_terminate(Arc::new(RecordExit::new()));
        let lc = ServerLifecycle::with_env(factory, env);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        lc.on_error(Arc::new(move |err, _| sink.lock().unwrap().push(err.to_string())));

        lc.start().await.unwrap();
        assert!(lc.is_running());

        time::timeout(Duration::from_secs(5), lc.reload())
            .await
            .expect("reload returns after a panic")
            .unwrap();
        assert_eq!(lc.state(), LifecycleState::Failed);
        assert!(lc.server().is_none());
        let errors = errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("factory exploded"), "{errors:?}");
        assert_eq!(lc.last_error().map(|e| e.as_label()), Some("lifecycle_server_error"));

        time::timeout(Duration::from_secs(5), lc.reload())
            .await
            .expect("later reload does not hang")
            .unwrap();
        assert!(lc.is_running());
        assert!(lc.last_error().is_none());
        assert_eq!(counters.created.load(Ordering::SeqCst), 3);
    }
}
