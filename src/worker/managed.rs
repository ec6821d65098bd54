//! # Managed worker: supervision of a single worker unit.
//!
//! [`ManagedWorker`] owns one slot of a pool. It spawns a unit through the
//! injected [`WorkerSpawner`], waits for its `ready` message, correlates task
//! results, detects crashes and asks the [`ErrorPolicy`] what to do about them.
//!
//! ## Crash handling
//! ```text
//! crash ─► counters++ (stability reset first) ─► reject pending run() calls
//!       ─► terminate old unit (background) ─► policy.on_worker_error(err, ctx)
//!             ├─ Restart{delay} ─► restarting ──timer──► idle ─► start()
//!             ├─ Exit{code}     ─► Terminate::exit(code)
//!             ├─ Wait           ─► stay in error (manual retry)
//!             └─ Ignore         ─► log
//! ```
//!
//! ## Rules
//! - `start()` is idempotent: concurrent callers share one in-flight start.
//! - `run()` never hangs: a crash or `stop()` settles every pending task with
//!   [`RunError::WorkerShutdown`].
//! - `stop()` cancels an armed restart timer; a restart never fires after stop.
//! - Every unit gets an epoch; messages and exits from an older unit are ignored.
//! - State listeners run after the internal lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{Config, WorkerSettings};
use crate::error::{RunError, WorkerError};
use crate::events::{Bus, Event, EventKind};
use crate::policies::{ErrorAction, ErrorPolicy, WorkerErrorContext};
use crate::protocol::{Host, JobTask, ServerMessage, TaskResult, WorkerMessage};
use crate::server::{ProcessExit, Terminate};
use crate::worker::unit::{ExitFuture, UnitMessage};
use crate::worker::{WorkerConfig, WorkerContext, WorkerSpawner, WorkerState, WorkerUnit};

/// Callback invoked on every state transition with `(from, to)`.
pub type StateListener = Arc<dyn Fn(WorkerState, WorkerState) + Send + Sync>;

type StartFuture = Shared<BoxFuture<'static, Result<(), WorkerError>>>;
type PendingTask = oneshot::Sender<Result<TaskResult, RunError>>;
type Transitions = Vec<(WorkerState, WorkerState)>;

/// Shared collaborators of the workers of one runtime.
#[derive(Clone)]
pub struct WorkerEnv {
    /// Failure policy.
    pub policy: Arc<dyn ErrorPolicy>,
    /// Startup/stop timeouts.
    pub settings: WorkerSettings,
    /// Event bus.
    pub bus: Bus,
    /// Process termination hook for `Exit` decisions.
    pub terminate: Arc<dyn Terminate>,
}

impl WorkerEnv {
    /// Creates an environment with default timeouts, a private bus and [`ProcessExit`].
    pub fn new(policy: Arc<dyn ErrorPolicy>) -> Self {
        Self {
            policy,
            settings: WorkerSettings::default(),
            bus: Bus::default(),
            terminate: Arc::new(ProcessExit),
        }
    }

    /// Creates an environment from the runtime configuration.
    pub fn from_config(cfg: &Config, bus: Bus) -> Self {
        Self {
            policy: cfg.error_policy(),
            settings: cfg.worker_settings(),
            bus,
            terminate: Arc::new(ProcessExit),
        }
    }

    /// Replaces the timeouts.
    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the event bus.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = bus;
        self
    }

    /// Replaces the termination hook.
    pub fn with_terminate(mut self, terminate: Arc<dyn Terminate>) -> Self {
        self.terminate = terminate;
        self
    }
}

struct UnitHandle {
    sender: mpsc::UnboundedSender<ServerMessage>,
    exit: ExitFuture,
    kill: Box<dyn Fn() + Send + Sync>,
}

struct Core {
    state: WorkerState,
    ctx: WorkerContext,
    ready_at: Option<Instant>,
    hosts: Option<Vec<Host>>,
    epoch: u64,
    unit: Option<UnitHandle>,
    pending: HashMap<Uuid, PendingTask>,
    ready_waiter: Option<oneshot::Sender<Result<(), WorkerError>>>,
    starting: Option<StartFuture>,
    restart: Option<CancellationToken>,
}

impl Core {
    fn transition(&mut self, to: WorkerState, changes: &mut Transitions) {
        let from = self.state;
        if from == WorkerState::Starting {
            self.starting = None;
        }
        self.state = to;
        changes.push((from, to));
    }

    fn drain_pending(&mut self) -> Vec<PendingTask> {
        self.pending.drain().map(|(_, tx)| tx).collect()
    }
}

struct Inner {
    config: WorkerConfig,
    spawner: Arc<dyn WorkerSpawner>,
    env: WorkerEnv,
    core: Mutex<Core>,
    listeners: Mutex<Vec<StateListener>>,
}

/// Supervisor of one worker unit.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ManagedWorker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ManagedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedWorker")
            .field("id", &self.inner.config.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedWorker {
    /// Creates an idle worker for the given slot.
    pub fn new(config: WorkerConfig, spawner: Arc<dyn WorkerSpawner>, env: WorkerEnv) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                spawner,
                env,
                core: Mutex::new(Core {
                    state: WorkerState::Idle,
                    ctx: WorkerContext::default(),
                    ready_at: None,
                    hosts: None,
                    epoch: 0,
                    unit: None,
                    pending: HashMap::new(),
                    ready_waiter: None,
                    starting: None,
                    restart: None,
                }),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Worker id.
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Slot configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    /// True in the `ready` state.
    pub fn is_healthy(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    /// Copy of the failure counters.
    pub fn context(&self) -> WorkerContext {
        self.lock().ctx.clone()
    }

    /// Hosts advertised by the current unit.
    pub fn hosts(&self) -> Option<Vec<Host>> {
        self.lock().hosts.clone()
    }

    /// Number of `run()` calls waiting for a result.
    pub fn pending_task_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Clears the consecutive failure count and the last error.
    ///
    /// Called when a reload signals that the code may have been fixed.
    pub fn reset_failure_count(&self) {
        let mut core = self.lock();
        core.ctx.consecutive_failures = 0;
        core.ctx.last_error = None;
    }

    /// Registers a state transition listener.
    pub fn on_state_change(&self, listener: StateListener) {
        self.listeners().push(listener);
    }

    /// Drops every registered listener.
    pub fn clear_listeners(&self) {
        self.listeners().clear();
    }

    /// Starts the worker and waits until it reports `ready`.
    ///
    /// Returns immediately when already ready and joins an in-flight start.
    /// Allowed from `idle` and `error` only.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut changes = Transitions::new();
        let (fut, launch) = {
            let mut core = self.lock();
            if core.state == WorkerState::Ready {
                return Ok(());
            }
            if let Some(fut) = core.starting.clone() {
                (fut, None)
            } else {
                if !matches!(core.state, WorkerState::Idle | WorkerState::Error) {
                    return Err(WorkerError::InvalidState {
                        state: core.state,
                        expected: "idle, error".into(),
                    });
                }
                core.transition(WorkerState::Starting, &mut changes);

                let (tx, rx) = oneshot::channel();
                let worker = self.id().to_string();
                let fut = async move {
                    rx.await
                        .unwrap_or(Err(WorkerError::ShuttingDown { worker }))
                }
                .boxed()
                .shared();
                core.starting = Some(fut.clone());
                (fut, Some(tx))
            }
        };
        self.emit(changes);

        if let Some(tx) = launch {
            let worker = self.clone();
            tokio::spawn(async move {
                let result = worker.do_start().await;
                let _ = tx.send(result);
            });
        }
        fut.await
    }

    /// Stops the worker; always ends in `stopped`.
    ///
    /// Cancels a scheduled restart, rejects pending tasks, asks the unit to stop
    /// and force-terminates it after the stop timeout.
    pub async fn stop(&self) {
        let mut changes = Transitions::new();
        let (unit, pending, waiter) = {
            let mut core = self.lock();
            if let Some(timer) = core.restart.take() {
                timer.cancel();
            }
            if matches!(core.state, WorkerState::Stopping | WorkerState::Stopped) {
                return;
            }
            core.transition(WorkerState::Stopping, &mut changes);
            core.epoch += 1;
            (core.unit.take(), core.drain_pending(), core.ready_waiter.take())
        };
        self.emit(changes);

        self.reject(pending, "worker stopped");
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(WorkerError::ShuttingDown {
                worker: self.id().to_string(),
            }));
        }
        if let Some(unit) = unit {
            let code = shutdown_unit(self.id(), unit, self.inner.env.settings.stop_timeout).await;
            debug!(worker = %self.id(), code, "worker unit exited");
        }

        let mut changes = Transitions::new();
        {
            let mut core = self.lock();
            core.ready_at = None;
            core.hosts = None;
            core.transition(WorkerState::Stopped, &mut changes);
        }
        self.emit(changes);
    }

    /// Runs a task on the worker and waits for its correlated result.
    ///
    /// Allowed in the `ready` state only. Results of concurrent calls may arrive
    /// in any order.
    pub async fn run(&self, task: JobTask) -> Result<TaskResult, RunError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut core = self.lock();
            let sender = match (&core.state, &core.unit) {
                (WorkerState::Ready, Some(unit)) => unit.sender.clone(),
                (state, _) => {
                    return Err(RunError::NotReady {
                        worker: self.id().to_string(),
                        state: *state,
                    });
                }
            };
            core.pending.insert(id, tx);
            if sender.send(ServerMessage::Task { id, task }).is_err() {
                core.pending.remove(&id);
                return Err(self.shutdown_error("worker channel closed"));
            }
        }
        rx.await
            .unwrap_or_else(|_| Err(self.shutdown_error("task dropped")))
    }

    async fn do_start(self) -> Result<(), WorkerError> {
        let unit = match self.inner.spawner.spawn(&self.inner.config).await {
            Ok(unit) => unit,
            Err(err) => {
                self.handle_error(err.clone(), None);
                return Err(err);
            }
        };
        let WorkerUnit {
            sender,
            receiver,
            exit,
            kill,
        } = unit;

        let (ready_tx, ready_rx) = oneshot::channel();
        let epoch = {
            let mut core = self.lock();
            if core.state != WorkerState::Starting {
                drop(core);
                kill();
                return Err(WorkerError::ShuttingDown {
                    worker: self.id().to_string(),
                });
            }
            core.epoch += 1;
            core.unit = Some(UnitHandle {
                sender,
                exit: exit.clone(),
                kill,
            });
            core.ready_waiter = Some(ready_tx);
            core.epoch
        };
        tokio::spawn(self.clone().listen(epoch, receiver, exit));

        let timeout = self.inner.env.settings.startup_timeout;
        match time::timeout(timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::ShuttingDown {
                worker: self.id().to_string(),
            }),
            Err(_) => {
                let err = WorkerError::StartupTimeout {
                    worker: self.id().to_string(),
                    timeout,
                };
                self.handle_error(err.clone(), Some(epoch));
                Err(err)
            }
        }
    }

    async fn listen(
        self,
        epoch: u64,
        mut receiver: mpsc::UnboundedReceiver<UnitMessage>,
        mut exit: ExitFuture,
    ) {
        loop {
            tokio::select! {
                biased;
                msg = receiver.recv() => match msg {
                    Some(msg) => self.on_message(epoch, msg),
                    None => {
                        let code = exit.clone().await;
                        self.on_exit(epoch, code);
                        return;
                    }
                },
                code = &mut exit => {
                    while let Ok(msg) = receiver.try_recv() {
                        self.on_message(epoch, msg);
                    }
                    self.on_exit(epoch, code);
                    return;
                }
            }
        }
    }

    fn on_message(&self, epoch: u64, msg: UnitMessage) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(error) => {
                let worker = self.id().to_string();
                self.handle_error(WorkerError::Protocol { worker, error }, Some(epoch));
                return;
            }
        };
        match msg {
            WorkerMessage::Ready { hosts } => self.on_ready(epoch, hosts),
            WorkerMessage::Error(error) => self.handle_error(
                WorkerError::Reported {
                    worker: self.id().to_string(),
                    error,
                },
                Some(epoch),
            ),
            WorkerMessage::Task { id, result } => {
                let waiter = self.lock().pending.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(result));
                    }
                    None => debug!(worker = %self.id(), %id, "result for unknown task"),
                }
            }
        }
    }

    fn on_ready(&self, epoch: u64, hosts: Option<Vec<Host>>) {
        let mut changes = Transitions::new();
        let waiter = {
            let mut core = self.lock();
            if core.epoch != epoch || core.state != WorkerState::Starting {
                return;
            }
            core.ready_at = Some(Instant::now());
            core.ctx.last_stable = Some(Utc::now());
            core.hosts = hosts.clone();
            core.transition(WorkerState::Ready, &mut changes);
            core.ready_waiter.take()
        };
        self.emit(changes);

        debug!(worker = %self.id(), "worker ready");
        let mut ev = Event::new(EventKind::WorkerReady)
            .with_source(self.id())
            .with_pool(self.inner.config.pool.as_str());
        if let Some(hosts) = hosts.filter(|h| !h.is_empty()) {
            let urls: Vec<&str> = hosts.iter().map(|h| h.url.as_str()).collect();
            ev = ev.with_reason(urls.join(","));
        }
        self.inner.env.bus.publish(ev);

        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_exit(&self, epoch: u64, code: i32) {
        {
            let core = self.lock();
            if core.epoch != epoch
                || matches!(core.state, WorkerState::Stopping | WorkerState::Stopped)
            {
                return;
            }
        }
        self.handle_error(
            WorkerError::UnexpectedExit {
                worker: self.id().to_string(),
                code,
            },
            Some(epoch),
        );
    }

    /// Records a failure of the current unit and applies the policy decision.
    ///
    /// `epoch = None` is used for spawn failures, where no unit exists yet.
    fn handle_error(&self, error: WorkerError, epoch: Option<u64>) {
        let mut changes = Transitions::new();
        let (ctx, unit, pending, waiter) = {
            let mut core = self.lock();
            if matches!(core.state, WorkerState::Stopping | WorkerState::Stopped) {
                return;
            }
            if let Some(epoch) = epoch {
                if core.epoch != epoch || core.unit.is_none() {
                    return;
                }
            }

            let since_stable = match (core.state, core.ready_at) {
                (WorkerState::Ready, Some(at)) => Some(at.elapsed()),
                _ => None,
            };
            if let (Some(window), Some(elapsed)) =
                (self.inner.env.policy.stability_window(), since_stable)
            {
                if elapsed > window {
                    core.ctx.consecutive_failures = 0;
                }
            }
            core.ctx.consecutive_failures += 1;
            core.ctx.total_failures += 1;
            core.ctx.last_error = Some(error.clone());
            core.ready_at = None;
            core.hosts = None;
            core.epoch += 1;
            core.transition(WorkerState::Error, &mut changes);

            let ctx = WorkerErrorContext {
                worker_id: self.id().to_string(),
                worker_kind: self.inner.config.kind,
                consecutive_failures: core.ctx.consecutive_failures,
                total_failures: core.ctx.total_failures,
                since_stable,
            };
            (ctx, core.unit.take(), core.drain_pending(), core.ready_waiter.take())
        };
        self.emit(changes);

        self.reject(pending, &error.to_string());
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(error.clone()));
        }
        if let Some(unit) = unit {
            let id = self.id().to_string();
            let stop_timeout = self.inner.env.settings.stop_timeout;
            tokio::spawn(async move {
                shutdown_unit(&id, unit, stop_timeout).await;
            });
        }

        let action = self.inner.env.policy.on_worker_error(&error, &ctx);
        self.inner.env.bus.publish(
            Event::new(EventKind::WorkerFailed)
                .with_source(self.id())
                .with_pool(self.inner.config.pool.as_str())
                .with_reason(error.to_string())
                .with_failures(ctx.consecutive_failures)
                .with_action(action.as_label()),
        );

        match action {
            ErrorAction::Restart { delay } => self.schedule_restart(delay, ctx.consecutive_failures),
            ErrorAction::Exit { code } => {
                error!(worker = %self.id(), %error, code, "worker failed, exiting process");
                self.inner.env.terminate.exit(code);
            }
            ErrorAction::Wait => {
                info!(worker = %self.id(), %error, failures = ctx.consecutive_failures, "worker failed, waiting for a fix");
            }
            ErrorAction::Ignore => {
                warn!(worker = %self.id(), %error, "worker error ignored");
            }
        }
    }

    fn schedule_restart(&self, delay: Duration, failures: u32) {
        let token = CancellationToken::new();
        let mut changes = Transitions::new();
        {
            let mut core = self.lock();
            if core.state != WorkerState::Error {
                return;
            }
            core.transition(WorkerState::Restarting, &mut changes);
            if let Some(old) = core.restart.replace(token.clone()) {
                old.cancel();
            }
        }
        self.emit(changes);

        info!(worker = %self.id(), delay_ms = delay.as_millis() as u64, failures, "scheduling worker restart");
        self.inner.env.bus.publish(
            Event::new(EventKind::RestartScheduled)
                .with_source(self.id())
                .with_pool(self.inner.config.pool.as_str())
                .with_delay(delay)
                .with_failures(failures),
        );

        let worker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = time::sleep(delay) => worker.fire_restart().await,
            }
        });
    }

    async fn fire_restart(&self) {
        let mut changes = Transitions::new();
        {
            let mut core = self.lock();
            if core.state != WorkerState::Restarting {
                return;
            }
            core.restart = None;
            core.transition(WorkerState::Idle, &mut changes);
        }
        self.emit(changes);

        if let Err(err) = self.start().await {
            debug!(worker = %self.id(), error = %err, "restart attempt failed");
        }
    }

    fn reject(&self, pending: Vec<PendingTask>, reason: &str) {
        if pending.is_empty() {
            return;
        }
        debug!(worker = %self.id(), count = pending.len(), reason, "rejecting pending tasks");
        for tx in pending {
            let _ = tx.send(Err(self.shutdown_error(reason)));
        }
    }

    fn shutdown_error(&self, reason: &str) -> RunError {
        RunError::WorkerShutdown {
            worker: self.id().to_string(),
            reason: reason.to_string(),
        }
    }

    fn emit(&self, changes: Transitions) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<StateListener> = self.listeners().clone();
        for (from, to) in changes {
            trace!(worker = %self.id(), %from, %to, "worker state transition");
            self.inner.env.bus.publish(
                Event::new(EventKind::WorkerStateChanged)
                    .with_source(self.id())
                    .with_pool(self.inner.config.pool.as_str())
                    .with_transition(from.as_str(), to.as_str()),
            );
            for listener in &listeners {
                listener(from, to);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<StateListener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Asks a unit to stop, then kills it after `stop_timeout`. Returns the exit code.
async fn shutdown_unit(worker: &str, unit: UnitHandle, stop_timeout: Duration) -> i32 {
    let UnitHandle { sender, exit, kill } = unit;
    let _ = sender.send(ServerMessage::Stop);
    drop(sender);

    match time::timeout(stop_timeout, exit.clone()).await {
        Ok(code) => code,
        Err(_) => {
            warn!(worker, ?stop_timeout, "worker unit did not exit in time, forcing termination");
            kill();
            exit.await
        }
    }
}
