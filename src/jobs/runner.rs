//! # Job runner.
//!
//! [`JobRunner::run_job`] executes the steps of a [`Job`] against one payload.
//!
//! ## Per step
//! ```text
//! aborted? ─► Unrecoverable / Cancelled
//! condition false ─► empty entry, checkpoint, next step
//! before_each ─► decode input from {input ⊕ result} ─► handler ─► encode output
//!   ─► merge into result ─► entry ─► after_each ─► checkpoint
//! ```
//! A parallel group runs its members concurrently against one snapshot,
//! merges their outputs in index order and writes a single checkpoint whose
//! next index is the end of the group.
//!
//! ## Failures
//! Handler and hook failures are logged with the step index and offered to
//! the job's `on_error` hook; a `false` answer turns them into
//! [`JobError::Unrecoverable`]. Input validation and missing dependencies fail
//! the run directly.
//!
//! ## Resuming
//! [`RunOptions::resume`] restores a checkpoint: the accumulated result is
//! rebuilt from the stored step entries and execution continues at the stored
//! index, so a resumed run ends with the same output and step data as an
//! uninterrupted one.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::JobError;
use crate::events::{Bus, Event, EventKind};
use crate::jobs::checkpoint::{CheckpointStore, JobRunCheckpoint, StepResultEntry};
use crate::jobs::job::{HookContext, Job, StepInfo};
use crate::jobs::resources::Resources;
use crate::jobs::signal::JobSignal;
use crate::jobs::step::StepContext;

/// Per-run options.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Abort signal, checked at every step boundary.
    pub signal: JobSignal,
    /// Key under which checkpoints are saved; no checkpoints without one.
    pub run_id: Option<String>,
    /// Result accumulated by an earlier attempt.
    pub result: Map<String, Value>,
    /// Step entries of an earlier attempt.
    pub step_results: Vec<Option<StepResultEntry>>,
    /// First step to execute.
    pub current_step_index: usize,
    /// Encoded user progress of an earlier attempt.
    pub progress: Option<Value>,
}

impl RunOptions {
    /// Fresh run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `signal` for cancellation.
    pub fn with_signal(mut self, signal: JobSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Saves checkpoints under `run_id`.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Continues from `checkpoint`.
    pub fn resume(mut self, checkpoint: JobRunCheckpoint) -> Self {
        self.result = checkpoint.result;
        self.step_results = checkpoint.step_results;
        self.current_step_index = checkpoint.step_index;
        self.progress = Some(checkpoint.progress);
        self
    }
}

/// Executes jobs. Cheap to clone.
#[derive(Clone, Default)]
pub struct JobRunner {
    resources: Resources,
    store: Option<Arc<dyn CheckpointStore>>,
    bus: Option<Bus>,
}

impl JobRunner {
    /// Runner without resources, store or events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared services for step handlers.
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Persists a checkpoint after every step of runs that have a run id.
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publishes step and job events.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Checkpoint store, if configured.
    pub fn store(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.store.as_ref()
    }

    /// Runs `job` on `data` and returns the encoded job output.
    pub async fn run_job(&self, job: &Job, data: Value, options: RunOptions) -> Result<Value, JobError> {
        let name = job.shared_name();
        let outcome = self.execute(job, data, options).await;
        match &outcome {
            Ok(_) => {
                debug!(job = %name, "job completed");
                self.publish(Event::new(EventKind::JobCompleted).with_source(name));
            }
            Err(err) => {
                self.publish(
                    Event::new(EventKind::JobFailed)
                        .with_source(name)
                        .with_reason(err.to_string())
                        .with_handled(!err.is_unrecoverable()),
                );
            }
        }
        outcome
    }

    async fn execute(&self, job: &Job, data: Value, options: RunOptions) -> Result<Value, JobError> {
        let name = job.shared_name();
        let input = job
            .input_schema()
            .decode(&data)
            .map_err(|error| JobError::InputValidation {
                job: name.to_string(),
                error,
            })?;
        let progress = decode_progress(job, options.progress.as_ref())?;

        let job_data = match job.data_hook() {
            Some(hook) => hook(self.resources.clone(), input.clone())
                .await
                .map_err(|e| JobError::Hook {
                    job: name.to_string(),
                    hook: "data",
                    error: Arc::new(e),
                })?,
            None => Value::Null,
        };

        let steps = job.steps().len();
        let mut step_results: Vec<Option<StepResultEntry>> = vec![None; steps];
        for (slot, prior) in step_results.iter_mut().zip(options.step_results) {
            *slot = prior;
        }
        let start = options.current_step_index.min(steps);
        let mut result = options.result;
        for entry in step_results[..start].iter().flatten() {
            result.extend(entry.data.clone());
        }

        let mut run = Run {
            runner: self,
            job,
            name,
            input,
            data: job_data,
            result,
            step_results,
            progress: Arc::new(Mutex::new(progress)),
            signal: options.signal,
            run_id: options.run_id,
        };

        let mut index = start;
        while index < steps {
            run.check_signal()?;
            index = match job.group_end(index) {
                Some(end) => run.run_group(index, end).await?,
                None => run.run_sequential(index).await?,
            };
        }
        run.finish().await
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }
}

fn decode_progress(job: &Job, raw: Option<&Value>) -> Result<Map<String, Value>, JobError> {
    let raw = match raw {
        Some(raw) if !raw.is_null() => raw,
        _ => return Ok(Map::new()),
    };
    let decoded = match job.progress_schema() {
        Some(schema) => schema.decode(raw).map_err(|error| JobError::InputValidation {
            job: job.name().to_string(),
            error,
        })?,
        None => raw.clone(),
    };
    Ok(decoded.as_object().cloned().unwrap_or_default())
}

/// Output of one executed step.
struct StepOutput {
    data: Map<String, Value>,
    started_at: DateTime<Utc>,
}

/// Mutable state of one run.
struct Run<'a> {
    runner: &'a JobRunner,
    job: &'a Job,
    name: Arc<str>,
    input: Value,
    data: Value,
    result: Map<String, Value>,
    step_results: Vec<Option<StepResultEntry>>,
    progress: Arc<Mutex<Map<String, Value>>>,
    signal: JobSignal,
    run_id: Option<String>,
}

impl Run<'_> {
    fn check_signal(&self) -> Result<(), JobError> {
        if !self.signal.is_aborted() {
            return Ok(());
        }
        Err(match self.signal.unrecoverable_reason() {
            Some(reason) => JobError::Unrecoverable {
                job: self.name.to_string(),
                reason,
                cause: None,
            },
            None => JobError::Cancelled {
                job: self.name.to_string(),
            },
        })
    }

    fn hook_context(&self) -> HookContext {
        HookContext {
            job: self.name.clone(),
            input: self.input.clone(),
            data: self.data.clone(),
            result: self.result.clone(),
            resources: self.runner.resources.clone(),
        }
    }

    fn step_info(&self, index: usize) -> StepInfo {
        StepInfo {
            index,
            label: self.job.steps()[index].display_label(index),
        }
    }

    /// Runs one sequential step; returns the next index.
    async fn run_sequential(&mut self, index: usize) -> Result<usize, JobError> {
        let ctx = self.hook_context();
        if let Some(condition) = self.job.condition(index) {
            if !condition(&ctx) {
                debug!(job = %self.name, step = index, "job step skipped");
                self.step_results[index] = Some(StepResultEntry::skipped());
                self.runner.publish(
                    Event::new(EventKind::JobStepSkipped)
                        .with_source(self.name.clone())
                        .with_step(index)
                        .with_reason(self.job.steps()[index].display_label(index)),
                );
                self.persist(index + 1, index).await?;
                return Ok(index + 1);
            }
        }

        let snapshot = ctx.snapshot();
        let output = match self.execute_step(index, &ctx, &snapshot).await {
            Ok(output) => output,
            Err(err) => return Err(self.fail(index, err).await),
        };
        self.complete(index, output);
        if let Err(err) = self.after_each(index).await {
            return Err(self.fail(index, err).await);
        }
        self.persist(index + 1, index).await?;
        Ok(index + 1)
    }

    /// Runs the members `start..end` of one parallel group; returns `end`.
    async fn run_group(&mut self, start: usize, end: usize) -> Result<usize, JobError> {
        let ctx = self.hook_context();
        let snapshot = ctx.snapshot();
        debug!(job = %self.name, from = start, to = end - 1, "running parallel steps");

        let outcomes = {
            let this = &*self;
            join_all((start..end).map(|i| this.execute_step(i, &ctx, &snapshot))).await
        };
        let mut outputs = Vec::with_capacity(outcomes.len());
        for (index, outcome) in (start..end).zip(outcomes) {
            match outcome {
                Ok(output) => outputs.push((index, output)),
                Err(err) => return Err(self.fail(index, err).await),
            }
        }

        for (index, output) in outputs {
            self.complete(index, output);
        }
        for index in start..end {
            if let Err(err) = self.after_each(index).await {
                return Err(self.fail(index, err).await);
            }
        }
        self.persist(end, end - 1).await?;
        Ok(end)
    }

    /// `before_each`, input decoding, handler and output encoding of one step.
    async fn execute_step(
        &self,
        index: usize,
        ctx: &HookContext,
        snapshot: &Value,
    ) -> Result<StepOutput, JobError> {
        let step = &self.job.steps()[index];
        let label = step.display_label(index);
        let required = self.job.dependencies().iter().chain(step.dependencies());
        if let Some(missing) = self.runner.resources.first_missing(required) {
            return Err(JobError::MissingDependency {
                job: self.name.to_string(),
                index,
                dependency: missing.name(),
            });
        }

        let input = step
            .input_schema()
            .decode(snapshot)
            .map_err(|error| JobError::StepInput {
                job: self.name.to_string(),
                index,
                error,
            })?;

        let started_at = Utc::now();
        debug!(job = %self.name, step = %label, index, "executing job step");
        if let Some(hook) = self.job.before_each_hook() {
            hook(ctx.clone(), self.step_info(index))
                .await
                .map_err(|e| self.hook_error("before_each", e))?;
        }

        let step_ctx = StepContext::new(
            self.name.clone(),
            index,
            label.as_str().into(),
            self.runner.resources.clone(),
            self.signal.clone(),
            self.progress.clone(),
        );
        let produced = step
            .call(step_ctx, input, self.data.clone())
            .await
            .map_err(|e| self.step_error(index, &label, e))?;
        let produced = if produced.is_null() {
            Value::Object(Map::new())
        } else {
            produced
        };

        let encoded = step
            .output_schema()
            .encode(&produced)
            .map_err(|e| self.step_error(index, &label, anyhow::Error::new(e)))?;
        let data = match encoded {
            Value::Object(data) => data,
            other => {
                return Err(self.step_error(
                    index,
                    &label,
                    anyhow::anyhow!("step output must be an object, got {other}"),
                ));
            }
        };
        Ok(StepOutput { data, started_at })
    }

    fn complete(&mut self, index: usize, output: StepOutput) {
        self.result
            .extend(output.data.iter().map(|(k, v)| (k.clone(), v.clone())));
        let entry = StepResultEntry::completed(output.data, output.started_at);
        debug!(job = %self.name, step = index, duration_ms = entry.duration, "completed job step");
        self.runner.publish(
            Event::new(EventKind::JobStepCompleted)
                .with_source(self.name.clone())
                .with_step(index)
                .with_reason(self.job.steps()[index].display_label(index))
                .with_delay(Duration::from_millis(entry.duration)),
        );
        self.step_results[index] = Some(entry);
    }

    async fn after_each(&self, index: usize) -> Result<(), JobError> {
        match self.job.after_each_hook() {
            Some(hook) => hook(self.hook_context(), self.step_info(index))
                .await
                .map_err(|e| self.hook_error("after_each", e)),
            None => Ok(()),
        }
    }

    /// Logs a step failure and lets `on_error` veto any retry.
    async fn fail(&self, index: usize, err: JobError) -> JobError {
        if !matches!(err, JobError::StepFailed { .. } | JobError::Hook { .. }) {
            return err;
        }
        error!(job = %self.name, step = index, error = %err, "job step failed");

        let Some(hook) = self.job.error_hook() else {
            return err;
        };
        let allow_retry = hook(self.hook_context(), self.step_info(index), err.clone()).await;
        if allow_retry {
            return err;
        }
        JobError::Unrecoverable {
            job: self.name.to_string(),
            reason: "job failed (unrecoverable)".into(),
            cause: Some(Box::new(err)),
        }
    }

    async fn persist(&self, next: usize, last: usize) -> Result<(), JobError> {
        let (Some(store), Some(run_id)) = (self.runner.store.as_ref(), self.run_id.as_deref()) else {
            return Ok(());
        };
        let checkpoint = JobRunCheckpoint {
            step_index: next,
            step_label: Some(self.job.steps()[last].display_label(last)),
            result: self.result.clone(),
            step_results: self.step_results.clone(),
            progress: self.encoded_progress(),
        };
        store
            .save(run_id, &checkpoint)
            .await
            .map_err(|error| JobError::Checkpoint {
                job: self.name.to_string(),
                error,
            })
    }

    fn encoded_progress(&self) -> Value {
        let progress = Value::Object(
            self.progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );
        match self.job.progress_schema() {
            Some(schema) => schema.encode(&progress).unwrap_or_else(|err| {
                warn!(job = %self.name, error = %err, "progress does not match its schema, stored as is");
                progress
            }),
            None => progress,
        }
    }

    async fn finish(&self) -> Result<Value, JobError> {
        let ctx = self.hook_context();
        let output = match self.job.return_hook() {
            Some(hook) => hook(ctx).await.map_err(|e| self.hook_error("return", e))?,
            None => Value::Object(ctx.result),
        };
        self.job
            .output_schema()
            .encode(&output)
            .map_err(|error| JobError::Output {
                job: self.name.to_string(),
                error,
            })
    }

    fn step_error(&self, index: usize, label: &str, error: anyhow::Error) -> JobError {
        JobError::StepFailed {
            job: self.name.to_string(),
            index,
            label: label.to_string(),
            error: Arc::new(error),
        }
    }

    fn hook_error(&self, hook: &'static str, error: anyhow::Error) -> JobError {
        JobError::Hook {
            job: self.name.to_string(),
            hook,
            error: Arc::new(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::json;

    use crate::jobs::checkpoint::MemoryCheckpointStore;
    use crate::jobs::schema::{FieldKind, ObjectSchema};
    use crate::jobs::step::JobStep;

    fn num(fields: &[&str]) -> ObjectSchema {
        fields
            .iter()
            .fold(ObjectSchema::new(), |s, f| s.field(*f, FieldKind::Number))
    }

    fn get(input: &Value, key: &str) -> i64 {
        input[key].as_i64().unwrap_or_default()
    }

    /// `A: a = seed + 1`, `B: b = a + 10 ∥ C: c = seed + a`, `D: done = b + c`.
    fn pipeline(crash_in_c: Option<Arc<AtomicBool>>) -> Job {
        let a = JobStep::new(|_, input, _| async move { Ok(json!({ "a": get(&input, "seed") + 1 })) })
            .label("A")
            .input(num(&["seed"]))
            .output(num(&["a"]));
        let b = JobStep::new(|_, input, _| async move { Ok(json!({ "b": get(&input, "a") + 10 })) })
            .label("B")
            .input(num(&["a"]))
            .output(num(&["b"]));
        let c = JobStep::new(move |_, input, _| {
            let crash = crash_in_c.clone();
            async move {
                if let Some(crash) = crash {
                    if crash.swap(false, Ordering::SeqCst) {
                        anyhow::bail!("worker died");
                    }
                }
                Ok(json!({ "c": get(&input, "seed") + get(&input, "a") }))
            }
        })
        .label("C")
        .input(num(&["seed", "a"]))
        .output(num(&["c"]));
        let d = JobStep::new(|_, input, _| async move { Ok(json!({ "done": get(&input, "b") + get(&input, "c") })) })
            .label("D")
            .input(num(&["b", "c"]))
            .output(num(&["done"]));

        Job::builder("pipeline", num(&["seed"]), num(&["done"]))
            .step(a)
            .steps([b, c])
            .step(d)
            .finish()
            .unwrap()
    }

    fn data_of(results: &[Option<StepResultEntry>]) -> Vec<Option<Map<String, Value>>> {
        results.iter().map(|e| e.as_ref().map(|e| e.data.clone())).collect()
    }

    #[tokio::test]
    async fn test_pipeline_computes_done() {
        let bus = Bus::new(64);
        let mut rx = bus.subscribe();
        let runner = JobRunner::new().with_bus(bus);
        let out = runner
            .run_job(&pipeline(None), json!({"seed": 1}), RunOptions::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"done": 15}));

        let mut steps = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            match ev.kind {
                EventKind::JobStepCompleted => steps.push(ev.step),
                EventKind::JobCompleted => assert_eq!(ev.source.as_deref(), Some("pipeline")),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(steps.len(), 4);
        assert_eq!(steps.first(), Some(&Some(0)));
        assert_eq!(steps.last(), Some(&Some(3)));
    }

    #[tokio::test]
    async fn test_invalid_input_fails_fast() {
        let err = JobRunner::new()
            .run_job(&pipeline(None), json!({"seed": "one"}), RunOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InputValidation { .. }));
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn test_resumed_run_matches_single_pass() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let runner = JobRunner::new().with_store(store.clone());

        store.enqueue("single");
        let single = runner
            .run_job(&pipeline(None), json!({"seed": 1}), RunOptions::new().with_run_id("single"))
            .await
            .unwrap();
        let single_results = store.get("single").unwrap().step_results;

        store.enqueue("twice");
        let crash = Arc::new(AtomicBool::new(true));
        let job = pipeline(Some(crash.clone()));
        let err = runner
            .run_job(&job, json!({"seed": 1}), RunOptions::new().with_run_id("twice"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::StepFailed { index: 2, .. }));

        let checkpoint = store.get("twice").unwrap();
        assert_eq!(checkpoint.step_index, 1);
        assert_eq!(checkpoint.step_label.as_deref(), Some("A"));

        let resumed = runner
            .run_job(
                &job,
                json!({"seed": 1}),
                RunOptions::new().with_run_id("twice").resume(checkpoint),
            )
            .await
            .unwrap();
        assert_eq!(resumed, single);
        let twice_results = store.get("twice").unwrap().step_results;
        assert_eq!(data_of(&twice_results), data_of(&single_results));
    }

    #[tokio::test]
    async fn test_resume_mid_group_runs_remaining_members() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let b = JobStep::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!({"b": 1})) }
        })
        .output(num(&["b"]));
        let c = JobStep::new(|_, _, _| async { Ok(json!({"c": 2})) }).output(num(&["c"]));
        let job = Job::builder("group", ObjectSchema::new(), num(&["b", "c"]))
            .steps([b, c])
            .finish()
            .unwrap();

        let mut b_data = Map::new();
        b_data.insert("b".into(), json!(1));
        let checkpoint = JobRunCheckpoint {
            step_index: 1,
            step_label: None,
            result: Map::new(),
            step_results: vec![Some(StepResultEntry::completed(b_data, Utc::now())), None],
            progress: Value::Null,
        };
        let out = JobRunner::new()
            .run_job(&job, json!({}), RunOptions::new().resume(checkpoint))
            .await
            .unwrap();
        assert_eq!(out, json!({"b": 1, "c": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_false_condition_skips_handler() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let skipped = JobStep::new(move |_, _, _| {
            flag.store(true, Ordering::SeqCst);
            async { Ok(json!({"x": 100})) }
        })
        .output(num(&["x"]));
        let after = JobStep::new(|_, input, _| async move {
            Ok(json!({ "seen_x": input.get("x").is_some(), "n": get(&input, "n") }))
        });
        let store = Arc::new(MemoryCheckpointStore::new());
        store.enqueue("run");
        let job = Job::builder("cond", num(&["n"]), ObjectSchema::new())
            .step_when(skipped, |ctx| ctx.input["n"].as_i64() == Some(0))
            .step(after)
            .finish()
            .unwrap();

        let out = JobRunner::new()
            .with_store(store.clone())
            .run_job(&job, json!({"n": 5}), RunOptions::new().with_run_id("run"))
            .await
            .unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(out, json!({}));

        let results = store.get("run").unwrap().step_results;
        let first = results[0].as_ref().unwrap();
        assert!(first.skipped);
        assert!(first.data.is_empty());
        assert_eq!(results[1].as_ref().unwrap().data["seen_x"], false);
    }

    #[tokio::test]
    async fn test_on_error_false_marks_unrecoverable() {
        let boom = JobStep::new(|_, _, _| async { anyhow::bail!("bad data") }).label("parse");
        let job = Job::builder("strict", ObjectSchema::new(), ObjectSchema::new())
            .step(boom)
            .finish()
            .unwrap()
            .on_error(|_, step, _| async move { step.label != "parse" });

        let err = JobRunner::new()
            .run_job(&job, json!({}), RunOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());
        match err {
            JobError::Unrecoverable { cause: Some(cause), .. } => {
                assert!(matches!(*cause, JobError::StepFailed { index: 0, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_is_checked_between_steps() {
        let signal = JobSignal::new();
        let trigger = signal.clone();
        let first = JobStep::new(move |_, _, _| {
            trigger.abort_unrecoverable("record removed");
            async { Ok(json!({})) }
        });
        let second = JobStep::new(|_, _, _| async { anyhow::bail!("must not run") });
        let job = Job::builder("abort", ObjectSchema::new(), ObjectSchema::new())
            .step(first)
            .step(second)
            .finish()
            .unwrap();

        let err = JobRunner::new()
            .run_job(&job, json!({}), RunOptions::new().with_signal(signal))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Unrecoverable { ref reason, cause: None, .. } if reason == "record removed"));

        let cancelled = JobSignal::new();
        cancelled.cancel();
        let err = JobRunner::new()
            .run_job(&job, json!({}), RunOptions::new().with_signal(cancelled))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_hooks_data_and_progress() {
        struct Rate(i64);

        let order = Arc::new(Mutex::new(Vec::new()));
        let (before, after) = (order.clone(), order.clone());
        let step = JobStep::new(|ctx: StepContext, input, data| async move {
            let rate = ctx.require::<Rate>()?;
            ctx.set_progress("stage", json!("priced"));
            Ok(json!({ "price": get(&input, "qty") * rate.0 + data["fee"].as_i64().unwrap_or(0) }))
        })
        .requires::<Rate>()
        .output(num(&["price"]));

        let job = Job::builder("price", num(&["qty"]), num(&["total"]))
            .progress(ObjectSchema::new().optional("stage", FieldKind::String))
            .data(|_, _| async { Ok(json!({"fee": 5})) })
            .step(step)
            .returns(|ctx| async move { Ok(json!({ "total": ctx.result["price"] })) })
            .unwrap()
            .before_each(move |_, s| {
                before.lock().unwrap().push(format!("before {}", s.index));
                async { Ok(()) }
            })
            .after_each(move |ctx, s| {
                after.lock().unwrap().push(format!("after {} {}", s.index, ctx.result["price"]));
                async { Ok(()) }
            });

        let store = Arc::new(MemoryCheckpointStore::new());
        store.enqueue("p");
        let runner = JobRunner::new()
            .with_resources(Resources::new().with(Rate(3)))
            .with_store(store.clone());
        let out = runner
            .run_job(&job, json!({"qty": 2}), RunOptions::new().with_run_id("p"))
            .await
            .unwrap();
        assert_eq!(out, json!({"total": 11}));
        assert_eq!(*order.lock().unwrap(), vec!["before 0", "after 0 11"]);
        assert_eq!(store.get("p").unwrap().progress, json!({"stage": "priced"}));

        let err = JobRunner::new()
            .run_job(&job, json!({"qty": 2}), RunOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::MissingDependency { index: 0, .. }));
    }
}
