//! Error types used by the workvisor runtime, its workers and the job engine.
//!
//! Each failure domain gets its own enum:
//!
//! - [`WorkerError`]: a worker unit failed to spawn, start, or stay alive.
//! - [`RunError`]: a task could not be dispatched to (or completed by) a worker.
//! - [`PoolError`]: pool registry misuse.
//! - [`LifecycleError`]: server lifecycle guard violations and inner server errors.
//! - [`ProtocolError`]: malformed or unexpected supervisor/worker frames.
//! - [`DefinitionError`]: invalid job/step definitions, raised at construction time.
//! - [`JobError`]: failures of a single job run.
//! - [`StoreError`]: checkpoint store failures.
//! - [`RuntimeError`]: supervisor run failures (startup guard, shutdown grace).
//!
//! All of them provide `as_label` (stable snake_case label for logs/metrics).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ThreadError;
use crate::server::LifecycleState;
use crate::worker::WorkerState;

/// # Errors produced by a supervised worker unit.
///
/// Cloneable so that a single failure can be handed to every waiter
/// (concurrent `start()` callers, the error policy, event subscribers).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// The worker unit could not be spawned at all.
    #[error("worker {worker} failed to spawn: {message}")]
    Spawn {
        /// Worker id.
        worker: String,
        /// Spawner-provided reason.
        message: String,
    },

    /// The worker did not send `ready` within the startup window.
    #[error("worker {worker} did not become ready within {timeout:?}")]
    StartupTimeout {
        /// Worker id.
        worker: String,
        /// The configured startup timeout.
        timeout: Duration,
    },

    /// The worker unit exited while it was expected to be running.
    #[error("worker {worker} exited unexpectedly with code {code}")]
    UnexpectedExit {
        /// Worker id.
        worker: String,
        /// Exit code reported by the unit.
        code: i32,
    },

    /// The worker reported an error through the `error` message.
    #[error("worker {worker} reported an error: {error}")]
    Reported {
        /// Worker id.
        worker: String,
        /// Error payload sent by the worker.
        error: ThreadError,
    },

    /// The worker violated the message protocol.
    #[error("worker {worker} protocol violation: {error}")]
    Protocol {
        /// Worker id.
        worker: String,
        /// Details of the violation.
        error: ProtocolError,
    },

    /// An operation was attempted from a state that does not allow it.
    #[error("invalid worker state: {state}, expected one of: {expected}")]
    InvalidState {
        /// Current state.
        state: WorkerState,
        /// Comma separated list of allowed states.
        expected: String,
    },

    /// The worker was stopped while the operation was in flight.
    #[error("worker {worker} is shutting down")]
    ShuttingDown {
        /// Worker id.
        worker: String,
    },
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::Spawn { .. } => "worker_spawn_failed",
            WorkerError::StartupTimeout { .. } => "worker_startup_timeout",
            WorkerError::UnexpectedExit { .. } => "worker_unexpected_exit",
            WorkerError::Reported { .. } => "worker_reported_error",
            WorkerError::Protocol { .. } => "worker_protocol_error",
            WorkerError::InvalidState { .. } => "worker_invalid_state",
            WorkerError::ShuttingDown { .. } => "worker_shutting_down",
        }
    }

    /// Whether the worker itself flagged this error as fatal.
    ///
    /// Timeouts and non-zero exits are always fatal for the unit that produced them.
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Reported { error, .. } => error.fatal,
            WorkerError::UnexpectedExit { code, .. } => *code != 0,
            WorkerError::StartupTimeout { .. } | WorkerError::Spawn { .. } => true,
            _ => false,
        }
    }
}

/// # Errors returned by task dispatch (`ManagedWorker::run`, `JobRunnersPool::run`).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    /// The worker is not in the `ready` state.
    #[error("worker {worker} is not ready to run tasks (state: {state})")]
    NotReady {
        /// Worker id.
        worker: String,
        /// Current state.
        state: WorkerState,
    },

    /// No worker of the pool is currently ready.
    #[error("no healthy job runner workers available in pool {pool}")]
    NoHealthyWorkers {
        /// Pool name.
        pool: String,
    },

    /// The worker was torn down (stopped or crashed) while the task was pending.
    ///
    /// Distinguishes "infrastructure torn down under me" from a task failure.
    #[error("worker {worker} shut down while the task was pending: {reason}")]
    WorkerShutdown {
        /// Worker id.
        worker: String,
        /// What tore the worker down.
        reason: String,
    },
}

impl RunError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunError::NotReady { .. } => "run_worker_not_ready",
            RunError::NoHealthyWorkers { .. } => "run_no_healthy_workers",
            RunError::WorkerShutdown { .. } => "run_worker_shutdown",
        }
    }

    /// True when the task never reached completion because the worker went away.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RunError::WorkerShutdown { .. })
    }
}

/// # Errors produced by the pool registry.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A pool with this name is already registered.
    #[error("pool for {name:?} already exists")]
    DuplicatePool {
        /// Pool name.
        name: String,
    },
}

impl PoolError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::DuplicatePool { .. } => "pool_duplicate",
        }
    }
}

/// # Errors produced by the server lifecycle.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum LifecycleError {
    /// A guard rejected the call; no state change happened.
    #[error("invalid lifecycle state: {state}, expected one of: {expected}")]
    InvalidState {
        /// Current state.
        state: LifecycleState,
        /// Comma separated list of allowed states.
        expected: String,
    },

    /// The server factory or server instance failed.
    #[error("server error: {0}")]
    Server(Arc<anyhow::Error>),
}

impl LifecycleError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            LifecycleError::InvalidState { .. } => "lifecycle_invalid_state",
            LifecycleError::Server(_) => "lifecycle_server_error",
        }
    }
}

/// # Errors produced while decoding supervisor/worker frames.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame carried a message kind outside the closed protocol.
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),

    /// The frame could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A known message arrived on the wrong side of the channel.
    #[error("unexpected {kind} message from {from}")]
    UnexpectedDirection {
        /// Message kind.
        kind: &'static str,
        /// Which side sent it.
        from: &'static str,
    },
}

impl ProtocolError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProtocolError::UnknownKind(_) => "protocol_unknown_kind",
            ProtocolError::Malformed(_) => "protocol_malformed",
            ProtocolError::UnexpectedDirection { .. } => "protocol_unexpected_direction",
        }
    }
}

/// # Errors raised while building a job or step definition.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// A step requires a field that no earlier step (nor the job input) guarantees.
    #[error("job {job:?} step {step} ({label}) requires field {field:?} which is not produced before it")]
    UnsatisfiedInput {
        /// Job name.
        job: String,
        /// Step index.
        step: usize,
        /// Step label (or index based name).
        label: String,
        /// Missing field.
        field: String,
    },

    /// `steps()` was called with fewer than two steps.
    #[error("job {job:?}: a parallel group needs at least 2 steps, got {count}")]
    ParallelGroupTooSmall {
        /// Job name.
        job: String,
        /// Number of steps passed.
        count: usize,
    },

    /// Two members of one parallel group produce the same field.
    #[error("job {job:?}: parallel steps {first} and {second} both produce field {field:?}")]
    ConflictingParallelOutput {
        /// Job name.
        job: String,
        /// First step index.
        first: usize,
        /// Second step index.
        second: usize,
        /// Field produced by both.
        field: String,
    },

    /// The identity return mapping cannot satisfy the declared output.
    #[error("job {job:?}: output field {field:?} is not produced by any step; provide a return handler")]
    UnsatisfiedOutput {
        /// Job name.
        job: String,
        /// Missing output field.
        field: String,
    },

    /// The job has no steps.
    #[error("job {job:?} has no steps")]
    Empty {
        /// Job name.
        job: String,
    },

    /// A job with this name is already registered.
    #[error("job {job:?} is already registered")]
    DuplicateJob {
        /// Job name.
        job: String,
    },
}

impl DefinitionError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DefinitionError::UnsatisfiedInput { .. } => "definition_unsatisfied_input",
            DefinitionError::ParallelGroupTooSmall { .. } => "definition_parallel_group_too_small",
            DefinitionError::ConflictingParallelOutput { .. } => "definition_conflicting_parallel_output",
            DefinitionError::UnsatisfiedOutput { .. } => "definition_unsatisfied_output",
            DefinitionError::Empty { .. } => "definition_empty",
            DefinitionError::DuplicateJob { .. } => "definition_duplicate_job",
        }
    }
}

/// # Errors raised while decoding or encoding a payload against a schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct SchemaError {
    /// Dotted path of the offending value (`$` for the root).
    pub path: String,
    /// What was wrong with it.
    pub message: String,
}

impl SchemaError {
    /// Creates a new schema error.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// # Errors produced by a single job run.
///
/// Some are retryable by the surrounding queue broker (`StepFailed`, `Hook`,
/// `Checkpoint`), others must not be redelivered (see [`JobError::is_unrecoverable`]).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// The job input failed to decode against the job's input schema.
    #[error("job {job:?} input is invalid: {error}")]
    InputValidation {
        /// Job name.
        job: String,
        /// Decode failure.
        error: SchemaError,
    },

    /// A step's input failed to decode from the accumulated result.
    #[error("job {job:?} step [{index}] input is invalid: {error}")]
    StepInput {
        /// Job name.
        job: String,
        /// Step index.
        index: usize,
        /// Decode failure.
        error: SchemaError,
    },

    /// A step handler failed.
    #[error("error during step [{index}] ({label}) of job {job:?}: {error}")]
    StepFailed {
        /// Job name.
        job: String,
        /// Step index.
        index: usize,
        /// Step label (or index based name).
        label: String,
        /// The handler error.
        error: Arc<anyhow::Error>,
    },

    /// The job must not be retried (explicit `on_error` veto or unrecoverable abort).
    #[error("job {job:?} failed (unrecoverable): {reason}")]
    Unrecoverable {
        /// Job name.
        job: String,
        /// Why.
        reason: String,
        /// The step failure that was vetoed, if any.
        cause: Option<Box<JobError>>,
    },

    /// The run was cancelled at a step boundary.
    #[error("job {job:?} cancelled")]
    Cancelled {
        /// Job name.
        job: String,
    },

    /// A lifecycle hook (`data`, `before_each`, `after_each`, `return`) failed.
    #[error("job {job:?} hook {hook} failed: {error}")]
    Hook {
        /// Job name.
        job: String,
        /// Hook name.
        hook: &'static str,
        /// The hook error.
        error: Arc<anyhow::Error>,
    },

    /// The final result failed to encode against the output schema.
    #[error("job {job:?} output is invalid: {error}")]
    Output {
        /// Job name.
        job: String,
        /// Encode failure.
        error: SchemaError,
    },

    /// Persisting a checkpoint failed.
    #[error("job {job:?} checkpoint failed: {error}")]
    Checkpoint {
        /// Job name.
        job: String,
        /// Store failure.
        error: StoreError,
    },

    /// A step declared a dependency that was never provided.
    #[error("job {job:?} step [{index}] requires missing dependency {dependency}")]
    MissingDependency {
        /// Job name.
        job: String,
        /// Step index.
        index: usize,
        /// Dependency type name.
        dependency: &'static str,
    },
}

impl JobError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            JobError::InputValidation { .. } => "job_input_invalid",
            JobError::StepInput { .. } => "job_step_input_invalid",
            JobError::StepFailed { .. } => "job_step_failed",
            JobError::Unrecoverable { .. } => "job_unrecoverable",
            JobError::Cancelled { .. } => "job_cancelled",
            JobError::Hook { .. } => "job_hook_failed",
            JobError::Output { .. } => "job_output_invalid",
            JobError::Checkpoint { .. } => "job_checkpoint_failed",
            JobError::MissingDependency { .. } => "job_missing_dependency",
        }
    }

    /// Whether the queue broker must not redeliver the job.
    ///
    /// Validation failures are caller errors and are never retried.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            JobError::Unrecoverable { .. }
                | JobError::Cancelled { .. }
                | JobError::InputValidation { .. }
                | JobError::StepInput { .. }
                | JobError::Output { .. }
                | JobError::MissingDependency { .. }
        )
    }
}

/// # Errors produced by a checkpoint store.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The queued job record does not exist (removed from the queue).
    #[error("job run {0:?} not found")]
    NotFound(String),

    /// Backend failure.
    #[error("checkpoint store failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "store_not_found",
            StoreError::Backend(_) => "store_backend",
        }
    }
}

/// # Errors returned by [`Supervisor::run`](crate::Supervisor::run).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// The server lifecycle refused to start.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The server did not stop within the grace period.
    #[error("grace period {grace:?} exceeded while stopping (state: {state})")]
    GraceExceeded {
        /// Configured grace.
        grace: Duration,
        /// Lifecycle state when the grace ran out.
        state: LifecycleState,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Lifecycle(_) => "runtime_lifecycle",
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecoverable_classification() {
        let cancelled = JobError::Cancelled { job: "j".into() };
        assert!(cancelled.is_unrecoverable());

        let failed = JobError::StepFailed {
            job: "j".into(),
            index: 2,
            label: "parse".into(),
            error: Arc::new(anyhow::anyhow!("boom")),
        };
        assert!(!failed.is_unrecoverable());
        assert_eq!(failed.as_label(), "job_step_failed");
        assert!(failed.to_string().contains("step [2]"));
    }

    #[test]
    fn test_worker_error_fatality() {
        let exit = WorkerError::UnexpectedExit {
            worker: "w-1".into(),
            code: 0,
        };
        assert!(!exit.is_fatal());

        let timeout = WorkerError::StartupTimeout {
            worker: "w-1".into(),
            timeout: Duration::from_secs(15),
        };
        assert!(timeout.is_fatal());
        assert_eq!(timeout.as_label(), "worker_startup_timeout");
    }
}
