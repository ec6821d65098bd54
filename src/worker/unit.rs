//! # Worker units.
//!
//! A worker unit is an isolated execution context (thread or process) that
//! talks to its supervisor only through the message protocol. The supervisor
//! side of a unit is a [`WorkerUnit`]; the unit's own side is a [`WorkerPort`].
//!
//! [`WorkerSpawner`] is the seam between supervision and the concrete isolation
//! technology:
//!
//! | Spawner                                      | Unit runs on                                  | Force termination          |
//! |----------------------------------------------|-----------------------------------------------|----------------------------|
//! | [`ThreadSpawner`](super::ThreadSpawner)      | a dedicated OS thread with its own runtime    | detach the thread          |
//! | [`ProcessSpawner`](super::ProcessSpawner)    | a child process, JSON frames over stdio       | kill the process           |
//! | [`TaskSpawner`](super::TaskSpawner)          | a task of the supervisor's runtime            | abort the task             |
//!
//! Messages travel as `Result<WorkerMessage, ProtocolError>`: in-process ports
//! only ever send `Ok`, a process unit turns undecodable frames into `Err`.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ProtocolError, WorkerError};
use crate::protocol::{ErrorOrigin, Host, ServerMessage, TaskResult, ThreadError, WorkerMessage};
use crate::subscribers::panic_message;
use crate::worker::WorkerConfig;

/// Resolves with the unit's exit code once it terminated.
pub type ExitFuture = Shared<BoxFuture<'static, i32>>;

/// Entry function of an in-process worker unit.
pub type EntryFn = Arc<dyn Fn(WorkerPort) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One message received from a unit, or the reason it could not be decoded.
pub type UnitMessage = Result<WorkerMessage, ProtocolError>;

/// Supervisor-side handle of a running worker unit.
pub struct WorkerUnit {
    /// Messages to the unit.
    pub sender: mpsc::UnboundedSender<ServerMessage>,
    /// Messages from the unit.
    pub receiver: mpsc::UnboundedReceiver<UnitMessage>,
    /// Completes with the exit code.
    pub exit: ExitFuture,
    /// Forces termination; `exit` completes shortly after.
    pub kill: Box<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for WorkerUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerUnit").finish_non_exhaustive()
    }
}

/// Creates worker units for [`ManagedWorker`](crate::ManagedWorker)s.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Spawns a unit for the given slot.
    ///
    /// Returning `Err` counts as a worker failure and goes through the error policy.
    async fn spawn(&self, config: &WorkerConfig) -> Result<WorkerUnit, WorkerError>;
}

/// Sending half of a unit's channel to its supervisor.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<UnitMessage>,
}

impl Outbox {
    /// Sends a message; returns `false` once the supervisor dropped its end.
    pub fn send(&self, msg: WorkerMessage) -> bool {
        self.tx.send(Ok(msg)).is_ok()
    }
}

/// Worker-side end of a unit's channel pair.
pub struct WorkerPort {
    config: WorkerConfig,
    outbox: Outbox,
    receiver: mpsc::UnboundedReceiver<ServerMessage>,
}

impl WorkerPort {
    /// Creates a connected port and the matching supervisor-side channel ends.
    pub fn pair(
        config: WorkerConfig,
    ) -> (
        WorkerPort,
        mpsc::UnboundedSender<ServerMessage>,
        mpsc::UnboundedReceiver<UnitMessage>,
    ) {
        let (to_worker, from_server) = mpsc::unbounded_channel();
        let (to_server, from_worker) = mpsc::unbounded_channel();
        let port = WorkerPort {
            config,
            outbox: Outbox { tx: to_server },
            receiver: from_server,
        };
        (port, to_worker, from_worker)
    }

    /// The slot this unit serves.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Announces readiness.
    pub fn ready(&self, hosts: Option<Vec<Host>>) {
        self.outbox.send(WorkerMessage::Ready { hosts });
    }

    /// Reports an error to the supervisor.
    pub fn error(&self, error: ThreadError) {
        self.outbox.send(WorkerMessage::Error(error));
    }

    /// Answers a task.
    pub fn reply(&self, id: Uuid, result: TaskResult) {
        self.outbox.send(WorkerMessage::Task { id, result });
    }

    /// Clone of the outgoing channel, for answering tasks from spawned tasks.
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Next supervisor message; `None` once the supervisor dropped its end.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }
}

/// Named entry functions shared by the in-process spawners.
#[derive(Clone, Default)]
pub(crate) struct Entries {
    entries: HashMap<String, EntryFn>,
}

impl Entries {
    pub(crate) fn insert<F, Fut>(&mut self, entry: impl Into<String>, f: F)
    where
        F: Fn(WorkerPort) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries
            .insert(entry.into(), Arc::new(move |port| f(port).boxed()));
    }

    pub(crate) fn insert_fn(&mut self, entry: impl Into<String>, f: EntryFn) {
        self.entries.insert(entry.into(), f);
    }

    pub(crate) fn get(&self, config: &WorkerConfig) -> Result<EntryFn, WorkerError> {
        self.entries
            .get(&config.entry)
            .cloned()
            .ok_or_else(|| WorkerError::Spawn {
                worker: config.id.clone(),
                message: format!("no entry registered for {:?}", config.entry),
            })
    }
}

/// Maps the outcome of an entry function to an exit code.
///
/// `0` for `Ok`, `1` otherwise. Errors and panics are reported as an `error`
/// message first, so the supervisor sees the cause before the exit.
pub(crate) fn exit_code(
    worker: &str,
    outcome: Result<anyhow::Result<()>, Box<dyn Any + Send>>,
    outbox: &Outbox,
) -> i32 {
    match outcome {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            outbox.send(WorkerMessage::Error(ThreadError::from_anyhow(
                &err,
                ErrorOrigin::Runtime,
            )));
            1
        }
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            outbox.send(WorkerMessage::Error(
                ThreadError::new(format!("worker unit {worker} panicked: {detail}"))
                    .with_name("Panic"),
            ));
            1
        }
    }
}
