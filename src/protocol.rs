//! # Supervisor ⇄ worker message protocol.
//!
//! Exactly four message kinds cross a worker channel:
//!
//! | Kind    | Direction            | Payload                                  |
//! |---------|----------------------|------------------------------------------|
//! | `ready` | worker → supervisor  | optional advertised hosts                |
//! | `error` | worker → supervisor  | [`ThreadError`]                          |
//! | `task`  | both                 | correlation id + [`JobTask`] / [`TaskResult`] |
//! | `stop`  | supervisor → worker  | none                                     |
//!
//! The direction is encoded in the types: [`ServerMessage`] is what the supervisor
//! sends, [`WorkerMessage`] is what a worker sends back. In-process worker units
//! exchange these values directly; process based units frame them as JSON
//! `{"type": ..., "data": ...}` objects with [`encode_server`]/[`decode_worker`] and
//! their mirror functions. Decoding rejects unknown kinds and kinds sent from the
//! wrong side.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Kind tag of a protocol frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Worker finished booting.
    Ready,
    /// Worker reports a failure.
    Error,
    /// Task request or task result.
    Task,
    /// Graceful stop request.
    Stop,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ready => "ready",
            MessageKind::Error => "error",
            MessageKind::Task => "task",
            MessageKind::Stop => "stop",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "ready" => Ok(MessageKind::Ready),
            "error" => Ok(MessageKind::Error),
            "task" => Ok(MessageKind::Task),
            "stop" => Ok(MessageKind::Stop),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }
}

/// Where a worker error originated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    /// Before the worker runtime was constructed.
    Bootstrap,
    /// While the worker was starting (before `ready`).
    Start,
    /// After `ready`.
    #[default]
    Runtime,
}

/// Error payload of the `error` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadError {
    /// Error message.
    pub message: String,
    /// Error class name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Backtrace or error chain, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Where the error happened.
    pub origin: ErrorOrigin,
    /// Whether the worker considers itself unusable.
    pub fatal: bool,
}

impl ThreadError {
    /// Creates a fatal runtime error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
            origin: ErrorOrigin::Runtime,
            fatal: true,
        }
    }

    /// Builds an error payload from an `anyhow` error, keeping its cause chain as the stack.
    pub fn from_anyhow(error: &anyhow::Error, origin: ErrorOrigin) -> Self {
        let chain: Vec<String> = error.chain().skip(1).map(|c| c.to_string()).collect();
        Self {
            message: error.to_string(),
            name: None,
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
            origin,
            fatal: true,
        }
    }

    /// Sets the error class name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the origin.
    pub fn with_origin(mut self, origin: ErrorOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Sets the fatal flag.
    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Endpoint advertised by a worker in its `ready` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Transport type (e.g. `http`, `ws`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Listen URL.
    pub url: String,
}

/// Job execution request sent to a job runner worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTask {
    /// Queue job id (also the checkpoint key).
    pub job_id: String,
    /// Registered job name.
    pub job_name: String,
    /// Raw job input.
    pub data: Value,
}

/// Outcome of a [`JobTask`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResult {
    /// The job produced its output.
    Success {
        /// Encoded job output.
        #[serde(default)]
        result: Option<Value>,
    },
    /// The job failed; the broker may redeliver it.
    Error {
        /// Error message.
        error: String,
    },
    /// The job failed and must not be redelivered.
    UnrecoverableError {
        /// Error message.
        error: String,
    },
    /// No job with the requested name is registered in the worker.
    JobNotFound,
    /// The queue record for the job id no longer exists.
    QueueJobNotFound,
}

impl TaskResult {
    /// Returns the wire tag of the result.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskResult::Success { .. } => "success",
            TaskResult::Error { .. } => "error",
            TaskResult::UnrecoverableError { .. } => "unrecoverable_error",
            TaskResult::JobNotFound => "job_not_found",
            TaskResult::QueueJobNotFound => "queue_job_not_found",
        }
    }

    /// True for [`TaskResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }
}

/// Message sent by the supervisor to a worker.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Run a task; the worker answers with [`WorkerMessage::Task`] carrying the same id.
    Task {
        /// Correlation id.
        id: Uuid,
        /// Task body.
        task: JobTask,
    },
    /// Finish in-flight work and exit.
    Stop,
}

impl ServerMessage {
    /// Kind tag of the message.
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::Task { .. } => MessageKind::Task,
            ServerMessage::Stop => MessageKind::Stop,
        }
    }
}

/// Message sent by a worker to the supervisor.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMessage {
    /// Worker is ready to serve.
    Ready {
        /// Endpoints the worker listens on, if any.
        hosts: Option<Vec<Host>>,
    },
    /// Worker failed.
    Error(ThreadError),
    /// Result of a task previously sent with the same id.
    Task {
        /// Correlation id.
        id: Uuid,
        /// Task outcome.
        result: TaskResult,
    },
}

impl WorkerMessage {
    /// Kind tag of the message.
    pub fn kind(&self) -> MessageKind {
        match self {
            WorkerMessage::Ready { .. } => MessageKind::Ready,
            WorkerMessage::Error(_) => MessageKind::Error,
            WorkerMessage::Task { .. } => MessageKind::Task,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize, Deserialize)]
struct ReadyData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hosts: Option<Vec<Host>>,
}

#[derive(Serialize, Deserialize)]
struct TaskData<T> {
    id: Uuid,
    task: T,
}

fn parse_frame(raw: &str) -> Result<(MessageKind, Value), ProtocolError> {
    let frame: Frame =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok((MessageKind::parse(&frame.kind)?, frame.data))
}

fn data<T: serde::de::DeserializeOwned>(kind: MessageKind, v: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(v).map_err(|e| ProtocolError::Malformed(format!("{}: {e}", kind.as_str())))
}

fn write_frame(kind: MessageKind, data: Value) -> Result<String, ProtocolError> {
    let frame = Frame {
        kind: kind.as_str().to_string(),
        data,
    };
    serde_json::to_string(&frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn to_value<T: Serialize>(v: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(v).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Encodes a supervisor message as a JSON frame.
pub fn encode_server(msg: &ServerMessage) -> Result<String, ProtocolError> {
    match msg {
        ServerMessage::Task { id, task } => {
            write_frame(MessageKind::Task, to_value(&TaskData { id: *id, task })?)
        }
        ServerMessage::Stop => write_frame(MessageKind::Stop, Value::Null),
    }
}

/// Decodes a frame received by a worker.
pub fn decode_server(raw: &str) -> Result<ServerMessage, ProtocolError> {
    let (kind, v) = parse_frame(raw)?;
    match kind {
        MessageKind::Task => {
            let d: TaskData<JobTask> = data(kind, v)?;
            Ok(ServerMessage::Task { id: d.id, task: d.task })
        }
        MessageKind::Stop => Ok(ServerMessage::Stop),
        MessageKind::Ready | MessageKind::Error => Err(ProtocolError::UnexpectedDirection {
            kind: kind.as_str(),
            from: "supervisor",
        }),
    }
}

/// Encodes a worker message as a JSON frame.
pub fn encode_worker(msg: &WorkerMessage) -> Result<String, ProtocolError> {
    match msg {
        WorkerMessage::Ready { hosts } => write_frame(
            MessageKind::Ready,
            to_value(&ReadyData {
                hosts: hosts.clone(),
            })?,
        ),
        WorkerMessage::Error(err) => write_frame(MessageKind::Error, to_value(err)?),
        WorkerMessage::Task { id, result } => {
            write_frame(MessageKind::Task, to_value(&TaskData { id: *id, task: result })?)
        }
    }
}

/// Decodes a frame received by the supervisor.
pub fn decode_worker(raw: &str) -> Result<WorkerMessage, ProtocolError> {
    let (kind, v) = parse_frame(raw)?;
    match kind {
        MessageKind::Ready => {
            let d: ReadyData = if v.is_null() {
                ReadyData { hosts: None }
            } else {
                data(kind, v)?
            };
            Ok(WorkerMessage::Ready { hosts: d.hosts })
        }
        MessageKind::Error => Ok(WorkerMessage::Error(data(kind, v)?)),
        MessageKind::Task => {
            let d: TaskData<TaskResult> = data(kind, v)?;
            Ok(WorkerMessage::Task {
                id: d.id,
                result: d.task,
            })
        }
        MessageKind::Stop => Err(ProtocolError::UnexpectedDirection {
            kind: kind.as_str(),
            from: "worker",
        }),
    }
}
