//! In-process spawners: one OS thread per unit, or one runtime task per unit.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::WorkerError;
use crate::protocol::{ErrorOrigin, ThreadError, WorkerMessage};
use crate::worker::WorkerConfig;
use crate::worker::unit::{EntryFn, Entries, WorkerPort, WorkerSpawner, WorkerUnit, exit_code};

/// Runs every unit on a dedicated OS thread with its own current-thread runtime.
///
/// Blocking or CPU-bound work inside a unit never stalls the supervisor. Killing
/// a unit drops its entry future at the next await point and resolves `exit`
/// with `1` right away; a unit stuck in blocking code is detached and its thread
/// ends whenever that code returns.
///
/// Exit codes: `0` when the entry returns `Ok`, `1` when it returns `Err`,
/// panics or is killed.
#[derive(Clone, Default)]
pub struct ThreadSpawner {
    entries: Entries,
}

impl ThreadSpawner {
    /// Creates an empty spawner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry function under `entry`.
    pub fn with_entry<F, Fut>(mut self, entry: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkerPort) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries.insert(entry, f);
        self
    }

    /// Registers a pre-boxed entry function.
    pub fn with_entry_fn(mut self, entry: impl Into<String>, f: EntryFn) -> Self {
        self.entries.insert_fn(entry, f);
        self
    }
}

#[async_trait]
impl WorkerSpawner for ThreadSpawner {
    async fn spawn(&self, config: &WorkerConfig) -> Result<WorkerUnit, WorkerError> {
        let entry = self.entries.get(config)?;
        let (port, sender, receiver) = WorkerPort::pair(config.clone());
        let outbox = port.outbox();
        let (code_tx, code_rx) = oneshot::channel();
        let killed = CancellationToken::new();
        let token = killed.clone();
        let id = config.id.clone();

        std::thread::Builder::new()
            .name(format!("workvisor-{id}"))
            .spawn(move || {
                let code = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt.block_on(async {
                        tokio::select! {
                            outcome = AssertUnwindSafe(entry(port)).catch_unwind() => {
                                exit_code(&id, outcome, &outbox)
                            }
                            _ = token.cancelled() => 1,
                        }
                    }),
                    Err(err) => {
                        outbox.send(WorkerMessage::Error(
                            ThreadError::new(format!("cannot build worker runtime: {err}"))
                                .with_origin(ErrorOrigin::Bootstrap),
                        ));
                        1
                    }
                };
                debug!(worker = %id, code, "worker thread finished");
                let _ = code_tx.send(code);
            })
            .map_err(|err| WorkerError::Spawn {
                worker: config.id.clone(),
                message: err.to_string(),
            })?;

        let exit_token = killed.clone();
        let exit = async move {
            tokio::select! {
                code = code_rx => code.unwrap_or(1),
                _ = exit_token.cancelled() => 1,
            }
        }
        .boxed()
        .shared();

        Ok(WorkerUnit {
            sender,
            receiver,
            exit,
            kill: Box::new(move || killed.cancel()),
        })
    }
}

/// Runs every unit as a task of the supervisor's own runtime.
///
/// Units share the supervisor's scheduler, so they must not block. Suited to
/// lightweight cooperative units and to tests driving paused time; use
/// [`ThreadSpawner`] or [`ProcessSpawner`](super::ProcessSpawner) for isolation.
#[derive(Clone, Default)]
pub struct TaskSpawner {
    entries: Entries,
}

impl TaskSpawner {
    /// Creates an empty spawner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry function under `entry`.
    pub fn with_entry<F, Fut>(mut self, entry: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkerPort) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries.insert(entry, f);
        self
    }

    /// Registers a pre-boxed entry function.
    pub fn with_entry_fn(mut self, entry: impl Into<String>, f: EntryFn) -> Self {
        self.entries.insert_fn(entry, f);
        self
    }
}

#[async_trait]
impl WorkerSpawner for TaskSpawner {
    async fn spawn(&self, config: &WorkerConfig) -> Result<WorkerUnit, WorkerError> {
        let entry = self.entries.get(config)?;
        let (port, sender, receiver) = WorkerPort::pair(config.clone());
        let outbox = port.outbox();
        let handle = tokio::spawn(AssertUnwindSafe(entry(port)).catch_unwind());
        let abort = handle.abort_handle();
        let id = config.id.clone();

        let exit = async move {
            match handle.await {
                Ok(outcome) => exit_code(&id, outcome, &outbox),
                Err(_) => 1,
            }
        }
        .boxed()
        .shared();

        Ok(WorkerUnit {
            sender,
            receiver,
            exit,
            kill: Box::new(move || abort.abort()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::protocol::ServerMessage;
    use crate::worker::WorkerKind;

    fn config(entry: &str) -> WorkerConfig {
        WorkerConfig {
            id: "t-1".into(),
            pool: "t".into(),
            index: 0,
            kind: WorkerKind::JobRunner,
            entry: entry.into(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_unknown_entry_fails_to_spawn() {
        let err = ThreadSpawner::new().spawn(&config("missing")).await.unwrap_err();
        assert_eq!(err.as_label(), "worker_spawn_failed");
        let err = TaskSpawner::new().spawn(&config("missing")).await.unwrap_err();
        assert_eq!(err.as_label(), "worker_spawn_failed");
    }

    #[tokio::test]
    async fn test_error_exit_is_reported_then_exits_with_one() {
        let spawner = ThreadSpawner::new().with_entry("fail", |port: WorkerPort| async move {
            port.ready(None);
            anyhow::bail!("boom")
        });
        let mut unit = spawner.spawn(&config("fail")).await.unwrap();
        assert_eq!(unit.exit.clone().await, 1);
        assert_eq!(unit.receiver.recv().await, Some(Ok(WorkerMessage::Ready { hosts: None })));
        match unit.receiver.recv().await {
            Some(Ok(WorkerMessage::Error(e))) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let spawner = TaskSpawner::new().with_entry("panic", |port: WorkerPort| async move {
            if port.config().index == 0 {
                panic!("bad state");
            }
            Ok(())
        });
        let mut unit = spawner.spawn(&config("panic")).await.unwrap();
        assert_eq!(unit.exit.clone().await, 1);
        match unit.receiver.recv().await {
            Some(Ok(WorkerMessage::Error(e))) => {
                assert_eq!(e.name.as_deref(), Some("Panic"));
                assert!(e.message.contains("bad state"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_kill_terminates_a_stuck_unit() {
        for spawner in [
            Arc::new(ThreadSpawner::new().with_entry("stuck", |_port: WorkerPort| async move {
                std::future::pending::<()>().await;
                Ok(())
            })) as Arc<dyn WorkerSpawner>,
            Arc::new(TaskSpawner::new().with_entry("stuck", |_port: WorkerPort| async move {
                std::future::pending::<()>().await;
                Ok(())
            })),
        ] {
            let unit = spawner.spawn(&config("stuck")).await.unwrap();
            (unit.kill)();
            assert_eq!(unit.exit.clone().await, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_kill_detaches_a_blocking_thread() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let spawner = ThreadSpawner::new().with_entry("busy", move |port: WorkerPort| {
            let flag = flag.clone();
            async move {
                port.ready(None);
                while !flag.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(())
            }
        });
        let mut unit = spawner.spawn(&config("busy")).await.unwrap();
        assert_eq!(unit.receiver.recv().await, Some(Ok(WorkerMessage::Ready { hosts: None })));

        (unit.kill)();
        let code = tokio::time::timeout(Duration::from_secs(1), unit.exit.clone()).await;
        assert_eq!(code, Ok(1));
        done.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_clean_return_exits_with_zero() {
        let spawner = ThreadSpawner::new().with_entry("echo", |mut port: WorkerPort| async move {
            while let Some(msg) = port.recv().await {
                if msg == ServerMessage::Stop {
                    break;
                }
            }
            Ok(())
        });
        let unit = spawner.spawn(&config("echo")).await.unwrap();
        unit.sender.send(ServerMessage::Stop).unwrap();
        assert_eq!(unit.exit.clone().await, 0);
    }
}
