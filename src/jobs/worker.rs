//! # Job runner worker units.
//!
//! [`JobWorkerRuntime`] is the entry function of the units of a job pool. It
//! owns a [`JobRegistry`] and a [`JobRunner`] and answers every `task` message
//! with a [`TaskResult`]:
//!
//! | Outcome                                   | Result                  |
//! |-------------------------------------------|-------------------------|
//! | job name not registered                   | `job_not_found`         |
//! | run id unknown to the checkpoint store    | `queue_job_not_found`   |
//! | job produced its output                   | `success`               |
//! | unrecoverable job error                   | `unrecoverable_error`   |
//! | any other failure                         | `error`                 |
//!
//! Tasks run concurrently, so results may be sent out of order. On `stop` (or
//! when the supervisor drops the channel) every in-flight run is cancelled at
//! its next step boundary and the unit exits once all of them answered.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{DefinitionError, StoreError};
use crate::jobs::job::Job;
use crate::jobs::runner::{JobRunner, RunOptions};
use crate::jobs::signal::JobSignal;
use crate::protocol::{JobTask, ServerMessage, TaskResult, WorkerMessage};
use crate::worker::{EntryFn, WorkerPort};

/// Job definitions known to a worker, by name.
#[derive(Clone, Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<Job>>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `job`; names are unique.
    pub fn register(&mut self, job: Job) -> Result<(), DefinitionError> {
        if self.jobs.contains_key(job.name()) {
            return Err(DefinitionError::DuplicateJob {
                job: job.name().to_string(),
            });
        }
        self.jobs.insert(job.name().to_string(), Arc::new(job));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, job: Job) -> Result<Self, DefinitionError> {
        self.register(job)?;
        Ok(self)
    }

    /// Job registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Job>> {
        self.jobs.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Jobs whose options route them to `pool`.
    pub fn jobs_for_pool(&self, pool: &str) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self
            .jobs
            .values()
            .filter(|job| job.options().pool == pool)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name().cmp(b.name()));
        jobs
    }

    /// Number of registered jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Main loop of a job runner unit. Cheap to clone.
#[derive(Clone)]
pub struct JobWorkerRuntime {
    registry: Arc<JobRegistry>,
    runner: JobRunner,
}

impl JobWorkerRuntime {
    /// Runtime serving the jobs of `registry`.
    pub fn new(registry: JobRegistry, runner: JobRunner) -> Self {
        Self {
            registry: Arc::new(registry),
            runner,
        }
    }

    /// Registered jobs.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Entry function for [`ThreadSpawner::with_entry_fn`](crate::worker::ThreadSpawner::with_entry_fn).
    pub fn entry(&self) -> EntryFn {
        let runtime = self.clone();
        Arc::new(move |port| runtime.clone().serve(port).boxed())
    }

    /// Announces readiness and serves tasks until stopped.
    pub async fn serve(self, mut port: WorkerPort) -> anyhow::Result<()> {
        let worker = port.config().id.clone();
        let outbox = port.outbox();
        let signal = JobSignal::new();
        let mut inflight = JoinSet::new();

        port.ready(None);
        info!(worker = %worker, jobs = self.registry.len(), "job runner ready");

        loop {
            tokio::select! {
                msg = port.recv() => match msg {
                    Some(ServerMessage::Task { id, task }) => {
                        let runtime = self.clone();
                        let outbox = outbox.clone();
                        let signal = signal.child();
                        inflight.spawn(async move {
                            let job = task.job_name.clone();
                            let result = AssertUnwindSafe(runtime.handle(task, signal))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| TaskResult::Error {
                                    error: format!("job {job:?} panicked"),
                                });
                            outbox.send(WorkerMessage::Task { id, result });
                        });
                    }
                    Some(ServerMessage::Stop) | None => break,
                },
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }

        debug!(worker = %worker, inflight = inflight.len(), "job runner stopping");
        signal.cancel();
        while inflight.join_next().await.is_some() {}
        Ok(())
    }

    /// Runs one task to its result.
    pub async fn handle(&self, task: JobTask, signal: JobSignal) -> TaskResult {
        let Some(job) = self.registry.get(&task.job_name) else {
            warn!(job = %task.job_name, "job not registered in this worker");
            return TaskResult::JobNotFound;
        };

        let mut options = RunOptions::new()
            .with_signal(signal)
            .with_run_id(task.job_id.clone());
        if let Some(store) = self.runner.store() {
            match store.load(&task.job_id).await {
                Ok(Some(checkpoint)) => {
                    debug!(job = %task.job_name, run = %task.job_id, step = checkpoint.step_index, "resuming job");
                    options = options.resume(checkpoint);
                }
                Ok(None) => {}
                Err(StoreError::NotFound(_)) => {
                    warn!(job = %task.job_name, run = %task.job_id, "job run not found in queue (may have been removed)");
                    return TaskResult::QueueJobNotFound;
                }
                Err(err) => {
                    return TaskResult::Error {
                        error: err.to_string(),
                    };
                }
            }
        }

        match self.runner.run_job(&job, task.data, options).await {
            Ok(result) => TaskResult::Success {
                result: Some(result),
            },
            Err(err) if err.is_unrecoverable() => TaskResult::UnrecoverableError {
                error: err.to_string(),
            },
            Err(err) => TaskResult::Error {
                error: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::jobs::checkpoint::MemoryCheckpointStore;
    use crate::jobs::job::JobOptions;
    use crate::jobs::schema::{FieldKind, ObjectSchema};
    use crate::jobs::step::JobStep;
    use crate::worker::{UnitMessage, WorkerConfig, WorkerKind};

    fn double() -> Job {
        let step = JobStep::new(|_, input, _| async move {
            Ok(json!({ "out": input["n"].as_i64().unwrap_or(0) * 2 }))
        })
        .input(ObjectSchema::new().field("n", FieldKind::Integer))
        .output(ObjectSchema::new().field("out", FieldKind::Integer));
        Job::builder(
            "double",
            ObjectSchema::new().field("n", FieldKind::Integer),
            ObjectSchema::new().field("out", FieldKind::Integer),
        )
        .options(JobOptions::on_pool("math"))
        .step(step)
        .finish()
        .unwrap()
    }

    fn slow() -> Job {
        let step = JobStep::new(|ctx, _, _| async move {
            ctx.signal().cancelled().await;
            Ok(json!({}))
        });
        let tail = JobStep::new(|_, _, _| async { Ok(json!({})) });
        Job::builder("slow", ObjectSchema::new(), ObjectSchema::new())
            .step(step)
            .step(tail)
            .finish()
            .unwrap()
    }

    fn task(job: &str, run: &str, data: serde_json::Value) -> JobTask {
        JobTask {
            job_id: run.into(),
            job_name: job.into(),
            data,
        }
    }

    fn port() -> (WorkerPort, mpsc::UnboundedSender<ServerMessage>, mpsc::UnboundedReceiver<UnitMessage>) {
        WorkerPort::pair(WorkerConfig {
            id: "jobs-1".into(),
            pool: "jobs".into(),
            index: 0,
            kind: WorkerKind::JobRunner,
            entry: "jobs".into(),
            data: json!({}),
        })
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = JobRegistry::new().with(double()).unwrap().with(slow()).unwrap();
        assert_eq!(
            registry.register(double()),
            Err(DefinitionError::DuplicateJob { job: "double".into() })
        );
        assert_eq!(registry.names(), vec!["double", "slow"]);
        assert_eq!(registry.jobs_for_pool("math").len(), 1);
        assert_eq!(registry.jobs_for_pool("jobs")[0].name(), "slow");
    }

    #[tokio::test]
    async fn test_task_results_cover_every_outcome() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.enqueue("1");
        store.enqueue("2");
        let runtime = JobWorkerRuntime::new(
            JobRegistry::new().with(double()).unwrap(),
            JobRunner::new().with_store(store.clone()),
        );
        let signal = JobSignal::new();

        let ok = runtime.handle(task("double", "1", json!({"n": 21})), signal.child()).await;
        assert_eq!(ok, TaskResult::Success { result: Some(json!({"out": 42})) });
        assert_eq!(store.get("1").unwrap().step_index, 1);

        let missing = runtime.handle(task("triple", "1", json!({})), signal.child()).await;
        assert_eq!(missing, TaskResult::JobNotFound);

        let removed = runtime.handle(task("double", "9", json!({"n": 1})), signal.child()).await;
        assert_eq!(removed, TaskResult::QueueJobNotFound);

        let invalid = runtime.handle(task("double", "2", json!({"n": "x"})), signal.child()).await;
        assert_eq!(invalid.as_label(), "unrecoverable_error");
    }

    #[tokio::test]
    async fn test_serve_answers_by_id_and_stops_inflight_runs() {
        let runtime = JobWorkerRuntime::new(
            JobRegistry::new().with(double()).unwrap().with(slow()).unwrap(),
            JobRunner::new(),
        );
        let (port, to_worker, mut from_worker) = port();
        let unit = tokio::spawn(runtime.serve(port));

        assert!(matches!(from_worker.recv().await, Some(Ok(WorkerMessage::Ready { hosts: None }))));

        let (slow_id, fast_id) = (Uuid::new_v4(), Uuid::new_v4());
        to_worker
            .send(ServerMessage::Task { id: slow_id, task: task("slow", "a", json!({})) })
            .unwrap();
        to_worker
            .send(ServerMessage::Task { id: fast_id, task: task("double", "b", json!({"n": 2})) })
            .unwrap();

        match from_worker.recv().await {
            Some(Ok(WorkerMessage::Task { id, result })) => {
                assert_eq!(id, fast_id);
                assert_eq!(result, TaskResult::Success { result: Some(json!({"out": 4})) });
            }
            other => panic!("unexpected message: {other:?}"),
        }

        to_worker.send(ServerMessage::Stop).unwrap();
        match tokio::time::timeout(Duration::from_secs(5), from_worker.recv()).await {
            Ok(Some(Ok(WorkerMessage::Task { id, result }))) => {
                assert_eq!(id, slow_id);
                assert_eq!(result.as_label(), "unrecoverable_error");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(unit.await.unwrap().is_ok());
    }
}
