//! Child-process worker units.
//!
//! The supervisor and the child exchange protocol frames as JSON lines: supervisor
//! messages on the child's stdin, worker messages on its stdout. Stderr is
//! inherited. The child learns which slot it serves from the [`WORKER_CONFIG_ENV`]
//! environment variable and typically hands control to [`serve_stdio`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProtocolError, WorkerError};
use crate::protocol::{
    ErrorOrigin, ServerMessage, ThreadError, WorkerMessage, decode_server, decode_worker,
    encode_server, encode_worker,
};
use crate::worker::WorkerConfig;
use crate::worker::unit::{EntryFn, UnitMessage, WorkerPort, WorkerSpawner, WorkerUnit, exit_code};

/// Environment variable carrying the JSON-encoded [`WorkerConfig`] of a child unit.
pub const WORKER_CONFIG_ENV: &str = "WORKVISOR_WORKER";

#[derive(Clone, Debug)]
struct CommandSpec {
    program: String,
    args: Vec<String>,
}

/// Runs every unit as a child process.
///
/// Each entry maps to a command line. Killing a unit kills the process; the
/// exit code is the child's, or `1` when it was terminated by a signal.
/// Undecodable output lines reach the supervisor as [`ProtocolError`]s.
#[derive(Clone, Debug, Default)]
pub struct ProcessSpawner {
    commands: HashMap<String, CommandSpec>,
}

impl ProcessSpawner {
    /// Creates an empty spawner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the command started for `entry`.
    pub fn with_command<I, S>(mut self, entry: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.insert(
            entry.into(),
            CommandSpec {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
        );
        self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, config: &WorkerConfig) -> Result<WorkerUnit, WorkerError> {
        let spawn_error = |message: String| WorkerError::Spawn {
            worker: config.id.clone(),
            message,
        };
        let spec = self
            .commands
            .get(&config.entry)
            .ok_or_else(|| spawn_error(format!("no command registered for {:?}", config.entry)))?;
        let payload = serde_json::to_string(config).map_err(|e| spawn_error(e.to_string()))?;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .env(WORKER_CONFIG_ENV, payload)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(format!("{}: {e}", spec.program)))?;
        let stdin = child.stdin.take().ok_or_else(|| spawn_error("stdin not captured".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_error("stdout not captured".into()))?;

        let (sender, mut outgoing) = mpsc::unbounded_channel::<ServerMessage>();
        let (incoming, receiver) = mpsc::unbounded_channel::<UnitMessage>();
        let id = config.id.clone();

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = outgoing.recv().await {
                let line = match encode_server(&msg) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(worker = %id, error = %err, "cannot encode message for worker");
                        continue;
                    }
                };
                if write_line(&mut stdin, &line).await.is_err() {
                    break;
                }
            }
        });

        let id = config.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let msg = match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => decode_worker(line.trim()),
                    Ok(None) => break,
                    Err(err) => Err(ProtocolError::Malformed(err.to_string())),
                };
                let broken = msg.is_err();
                if incoming.send(msg).is_err() || broken {
                    break;
                }
            }
            debug!(worker = %id, "worker output closed");
        });

        let (code_tx, code_rx) = oneshot::channel();
        let killed = CancellationToken::new();
        let token = killed.clone();
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code()).unwrap_or(1);
            let _ = code_tx.send(code);
        });

        Ok(WorkerUnit {
            sender,
            receiver,
            exit: async move { code_rx.await.unwrap_or(1) }.boxed().shared(),
            kill: Box::new(move || killed.cancel()),
        })
    }
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

/// Serves a unit over stdio inside a child started by [`ProcessSpawner`].
///
/// Returns the exit code the child should terminate with. Call
/// `std::process::exit` with it rather than returning from `main`, since a
/// pending stdin read keeps the runtime from shutting down. Stdout carries
/// protocol frames only; logs belong on stderr.
pub async fn serve_stdio(entry: EntryFn) -> i32 {
    let mut stdout = tokio::io::stdout();
    let config = std::env::var(WORKER_CONFIG_ENV)
        .map_err(|e| format!("{WORKER_CONFIG_ENV}: {e}"))
        .and_then(|raw| serde_json::from_str::<WorkerConfig>(&raw).map_err(|e| e.to_string()));
    let config = match config {
        Ok(config) => config,
        Err(message) => {
            let msg = WorkerMessage::Error(
                ThreadError::new(format!("invalid worker config: {message}"))
                    .with_origin(ErrorOrigin::Bootstrap)
                    .with_fatal(true),
            );
            if let Ok(line) = encode_worker(&msg) {
                let _ = write_line(&mut stdout, &line).await;
            }
            return 1;
        }
    };

    let id = config.id.clone();
    let (port, to_worker, mut from_worker) = WorkerPort::pair(config);
    let outbox = port.outbox();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match decode_server(line.trim()) {
                Ok(msg) => {
                    if to_worker.send(msg).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "dropping undecodable supervisor frame"),
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(msg) = from_worker.recv().await {
            let Ok(msg) = msg else { continue };
            match encode_worker(&msg) {
                Ok(line) => {
                    if write_line(&mut stdout, &line).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "cannot encode worker message"),
            }
        }
    });

    let outcome = AssertUnwindSafe(entry(port)).catch_unwind().await;
    let code = exit_code(&id, outcome, &outbox);
    drop(outbox);
    let _ = writer.await;
    code
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::protocol::{JobTask, TaskResult};
    use crate::server::RecordExit;
    use crate::worker::testing::ParkPolicy;
    use crate::worker::{ManagedWorker, WorkerEnv, WorkerKind, WorkerState};

    fn config(entry: &str) -> WorkerConfig {
        WorkerConfig {
            id: "proc-1".into(),
            pool: "proc".into(),
            index: 0,
            kind: WorkerKind::JobRunner,
            entry: entry.into(),
            data: json!({}),
        }
    }

    fn sh(entry: &str, script: &str) -> ProcessSpawner {
        ProcessSpawner::new().with_command(entry, "sh", ["-c", script])
    }

    const READY: &str = r#"printf '%s\n' '{"type":"ready","data":null}'"#;

    #[tokio::test]
    async fn test_unknown_entry_fails_to_spawn() {
        let err = ProcessSpawner::new().spawn(&config("missing")).await.unwrap_err();
        assert_eq!(err.as_label(), "worker_spawn_failed");
    }

    #[tokio::test]
    async fn test_answers_a_task_over_stdio() {
        let script = format!(
            r#"{READY}
read line
id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
printf '{{"type":"task","data":{{"id":"%s","task":{{"type":"success","result":{{"ok":true}}}}}}}}\n' "$id"
read line
exit 0"#
        );
        let mut unit = sh("echo", &script).spawn(&config("echo")).await.unwrap();
        assert_eq!(unit.receiver.recv().await, Some(Ok(WorkerMessage::Ready { hosts: None })));

        let id = uuid::Uuid::new_v4();
        let task = JobTask {
            job_id: "1".into(),
            job_name: "noop".into(),
            data: json!({}),
        };
        unit.sender.send(ServerMessage::Task { id, task }).unwrap();
        assert_eq!(
            unit.receiver.recv().await,
            Some(Ok(WorkerMessage::Task {
                id,
                result: TaskResult::Success {
                    result: Some(json!({"ok": true}))
                }
            }))
        );

        unit.sender.send(ServerMessage::Stop).unwrap();
        assert_eq!(unit.exit.clone().await, 0);
    }

    #[tokio::test]
    async fn test_kill_terminates_the_child() {
        let unit = sh("sleepy", "sleep 30").spawn(&config("sleepy")).await.unwrap();
        (unit.kill)();
        let code = tokio::time::timeout(Duration::from_secs(5), unit.exit.clone()).await;
        assert_eq!(code, Ok(1));
    }

    #[tokio::test]
    async fn test_unknown_frame_is_a_protocol_failure() {
        let script = format!(
            r#"{READY}
printf '%s\n' '{{"type":"ping","data":null}}'
sleep 30"#
        );
        let worker = ManagedWorker::new(
            config("chatty"),
            Arc::new(sh("chatty", &script)),
            WorkerEnv::new(Arc::new(ParkPolicy { degraded: false }))
                .with_terminate(Arc::new(RecordExit::new())),
        );
        worker.start().await.unwrap();

        for _ in 0..500 {
            if worker.state() == WorkerState::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(worker.state(), WorkerState::Error);
        let last = worker.context().last_error.unwrap();
        assert_eq!(last.as_label(), "worker_protocol_error");
        assert!(matches!(
            last,
            WorkerError::Protocol {
                error: ProtocolError::UnknownKind(ref kind),
                ..
            } if kind == "ping"
        ));
        worker.stop().await;
    }
}
