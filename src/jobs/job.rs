//! # Job definitions.
//!
//! A [`Job`] is built once at startup through a [`JobBuilder`] and never
//! changes afterwards.
//!
//! ```text
//! Job::builder(name, input, output)
//!     .step(a)                 sequential step
//!     .step_when(b, cond)      sequential step, skipped when cond is false
//!     .steps([c, d])           parallel group (>= 2 steps, no conditions)
//!     .returns(handler)        ─► Job   (or .finish() for the identity mapping)
//! Job
//!     .before_each(..) .after_each(..) .on_error(..)
//! ```
//!
//! Every structural rule is checked while the definition is built: a step may
//! only require fields that the job input or an earlier unconditional step
//! guarantees, members of a parallel group may not produce the same field, and
//! the identity return mapping must cover the declared output.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DefinitionError, JobError};
use crate::jobs::resources::{Dependency, Resources};
use crate::jobs::schema::Schema;
use crate::jobs::step::JobStep;

/// Run condition of a sequential step.
pub type Condition = Arc<dyn Fn(&HookContext) -> bool + Send + Sync>;

/// Derives auxiliary job data once per run from the resources and the decoded input.
pub type DataHook =
    Arc<dyn Fn(Resources, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// `before_each` / `after_each` hook.
pub type StepHook =
    Arc<dyn Fn(HookContext, StepInfo) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// `on_error` hook; returning `false` forbids any retry of the job.
pub type ErrorHook =
    Arc<dyn Fn(HookContext, StepInfo, JobError) -> BoxFuture<'static, bool> + Send + Sync>;

/// Maps the accumulated result to the job output.
pub type ReturnHook =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Read-only view handed to conditions and hooks.
#[derive(Clone, Debug)]
pub struct HookContext {
    /// Job name.
    pub job: Arc<str>,
    /// Decoded job input.
    pub input: Value,
    /// Output of the `data` hook (`null` without one).
    pub data: Value,
    /// Snapshot of the accumulated result.
    pub result: Map<String, Value>,
    /// Shared services.
    pub resources: Resources,
}

impl HookContext {
    /// Job input overlaid with the accumulated result, as seen by step inputs.
    pub fn snapshot(&self) -> Value {
        let mut merged = self.input.as_object().cloned().unwrap_or_default();
        merged.extend(self.result.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(merged)
    }
}

/// Step a hook is called for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepInfo {
    /// Step index.
    pub index: usize,
    /// Step label (or 1-based position).
    pub label: String,
}

/// Retry backoff of the job queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobBackoffKind {
    /// Same delay for every attempt.
    Fixed,
    /// Delay doubles per attempt.
    Exponential,
}

/// Queue-side retry backoff.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobBackoff {
    /// Growth of the delay.
    pub kind: JobBackoffKind,
    /// Base delay, in milliseconds on the wire.
    #[serde(with = "crate::config::duration_ms")]
    pub delay: Duration,
    /// Random spread in `0.0..=1.0`.
    pub jitter: Option<f64>,
}

/// Queue metadata of a job. The runner does not interpret it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Name of the worker pool the job runs on.
    pub pool: String,
    /// Delivery attempts before the queue gives up.
    pub attempts: u32,
    /// Delay between attempts.
    pub backoff: Option<JobBackoff>,
    /// Maximum concurrent runs; `None` shares the pool capacity evenly.
    pub concurrency: Option<usize>,
    /// Remove the queue record once the job finished.
    pub oneoff: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            pool: "jobs".into(),
            attempts: 1,
            backoff: None,
            concurrency: None,
            oneoff: false,
        }
    }
}

impl JobOptions {
    /// Options for a job running on `pool`.
    pub fn on_pool(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            ..Self::default()
        }
    }

    /// Sets the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Sets the retry backoff.
    pub fn with_backoff(mut self, backoff: JobBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Caps concurrent runs.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Marks the job as one-off.
    pub fn oneoff(mut self) -> Self {
        self.oneoff = true;
        self
    }
}

/// Public description of one step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinitionInfo {
    /// Step label (or 1-based position).
    pub label: String,
    /// Whether the step has a run condition.
    pub conditional: bool,
    /// Parallel group id, for group members.
    pub parallel_group: Option<usize>,
}

/// Public description of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDefinitionInfo {
    /// Job name.
    pub name: String,
    /// Queue metadata.
    pub options: JobOptions,
    /// Steps in order.
    pub steps: Vec<StepDefinitionInfo>,
}

/// Fields guaranteed to exist in the step snapshot at some point of the definition.
#[derive(Clone, Debug, Default)]
struct Available {
    guaranteed: HashSet<String>,
    open: bool,
}

impl Available {
    fn from_schema(schema: &dyn Schema) -> Self {
        let mut available = Self::default();
        available.produce(schema, true);
        available
    }

    fn produce(&mut self, schema: &dyn Schema, guaranteed: bool) {
        match schema.fields() {
            Some(fields) if guaranteed => self.guaranteed.extend(
                fields
                    .iter()
                    .filter(|f| f.required)
                    .map(|f| f.name.clone()),
            ),
            Some(_) => {}
            None => self.open = true,
        }
    }

    fn first_missing(&self, schema: &dyn Schema) -> Option<String> {
        if self.open {
            return None;
        }
        schema
            .fields()?
            .iter()
            .find(|f| f.required && !self.guaranteed.contains(&f.name))
            .map(|f| f.name.clone())
    }
}

/// Accumulates a job definition. See the module docs.
pub struct JobBuilder {
    name: Arc<str>,
    options: JobOptions,
    input: Arc<dyn Schema>,
    output: Arc<dyn Schema>,
    progress: Option<Arc<dyn Schema>>,
    dependencies: Vec<Dependency>,
    data: Option<DataHook>,
    steps: Vec<JobStep>,
    groups: HashMap<usize, usize>,
    conditions: HashMap<usize, Condition>,
    next_group: usize,
    available: Available,
    error: Option<DefinitionError>,
}

impl JobBuilder {
    fn new(name: Arc<str>, input: Arc<dyn Schema>, output: Arc<dyn Schema>) -> Self {
        let available = Available::from_schema(input.as_ref());
        Self {
            name,
            options: JobOptions::default(),
            input,
            output,
            progress: None,
            dependencies: Vec::new(),
            data: None,
            steps: Vec::new(),
            groups: HashMap::new(),
            conditions: HashMap::new(),
            next_group: 0,
            available,
            error: None,
        }
    }

    /// Queue metadata.
    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Schema of the user progress object persisted with every checkpoint.
    pub fn progress(mut self, schema: impl Schema) -> Self {
        self.progress = Some(Arc::new(schema));
        self
    }

    /// Declares a dependency shared by every step.
    pub fn requires<T: std::any::Any + Send + Sync>(mut self) -> Self {
        self.dependencies.push(Dependency::of::<T>());
        self
    }

    /// Derives auxiliary data once per run; it is passed to every step handler.
    pub fn data<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Resources, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.data = Some(Arc::new(move |resources, input| hook(resources, input).boxed()));
        self
    }

    /// Appends a sequential step.
    pub fn step(self, step: JobStep) -> Self {
        self.push_step(step, None)
    }

    /// Appends a sequential step that only runs when `condition` holds.
    ///
    /// Fields produced by a conditional step are not guaranteed for later steps.
    pub fn step_when(
        self,
        step: JobStep,
        condition: impl Fn(&HookContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.push_step(step, Some(Arc::new(condition)))
    }

    /// Appends a parallel group. Members read the same snapshot and cannot be skipped.
    pub fn steps(mut self, steps: impl IntoIterator<Item = JobStep>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let steps: Vec<JobStep> = steps.into_iter().collect();
        if steps.len() < 2 {
            self.error = Some(DefinitionError::ParallelGroupTooSmall {
                job: self.name.to_string(),
                count: steps.len(),
            });
            return self;
        }

        let first = self.steps.len();
        for (offset, step) in steps.iter().enumerate() {
            if let Err(err) = self.check_input(first + offset, step) {
                self.error = Some(err);
                return self;
            }
        }
        if let Err(err) = self.check_group_outputs(first, &steps) {
            self.error = Some(err);
            return self;
        }

        let group = self.next_group;
        self.next_group += 1;
        for step in steps {
            self.available.produce(step.output_schema(), true);
            self.groups.insert(self.steps.len(), group);
            self.steps.push(step);
        }
        self
    }

    /// Finalizes the definition with a custom output mapping.
    pub fn returns<F, Fut>(self, handler: F) -> Result<Job, DefinitionError>
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: ReturnHook = Arc::new(move |ctx| handler(ctx).boxed());
        self.build(Some(handler))
    }

    /// Finalizes the definition; the accumulated result is the output.
    pub fn finish(self) -> Result<Job, DefinitionError> {
        self.build(None)
    }

    fn build(self, returns: Option<ReturnHook>) -> Result<Job, DefinitionError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty {
                job: self.name.to_string(),
            });
        }
        if returns.is_none() {
            if let Some(field) = self.available.first_missing(self.output.as_ref()) {
                return Err(DefinitionError::UnsatisfiedOutput {
                    job: self.name.to_string(),
                    field,
                });
            }
        }

        Ok(Job {
            name: self.name,
            options: self.options,
            input: self.input,
            output: self.output,
            progress: self.progress,
            dependencies: self.dependencies,
            data: self.data,
            steps: self.steps,
            groups: self.groups,
            conditions: self.conditions,
            returns,
            before_each: None,
            after_each: None,
            on_error: None,
        })
    }

    fn push_step(mut self, step: JobStep, condition: Option<Condition>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let index = self.steps.len();
        if let Err(err) = self.check_input(index, &step) {
            self.error = Some(err);
            return self;
        }
        self.available
            .produce(step.output_schema(), condition.is_none());
        if let Some(condition) = condition {
            self.conditions.insert(index, condition);
        }
        self.steps.push(step);
        self
    }

    fn check_input(&self, index: usize, step: &JobStep) -> Result<(), DefinitionError> {
        match self.available.first_missing(step.input_schema()) {
            Some(field) => Err(DefinitionError::UnsatisfiedInput {
                job: self.name.to_string(),
                step: index,
                label: step.display_label(index),
                field,
            }),
            None => Ok(()),
        }
    }

    fn check_group_outputs(&self, first: usize, steps: &[JobStep]) -> Result<(), DefinitionError> {
        let mut owners: HashMap<&str, usize> = HashMap::new();
        for (offset, step) in steps.iter().enumerate() {
            let Some(fields) = step.output_schema().fields() else {
                continue;
            };
            for field in fields {
                if let Some(owner) = owners.insert(field.name.as_str(), first + offset) {
                    return Err(DefinitionError::ConflictingParallelOutput {
                        job: self.name.to_string(),
                        first: owner,
                        second: first + offset,
                        field: field.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Immutable job definition. Cheap to clone.
#[derive(Clone)]
pub struct Job {
    name: Arc<str>,
    options: JobOptions,
    input: Arc<dyn Schema>,
    output: Arc<dyn Schema>,
    progress: Option<Arc<dyn Schema>>,
    dependencies: Vec<Dependency>,
    data: Option<DataHook>,
    steps: Vec<JobStep>,
    groups: HashMap<usize, usize>,
    conditions: HashMap<usize, Condition>,
    returns: Option<ReturnHook>,
    before_each: Option<StepHook>,
    after_each: Option<StepHook>,
    on_error: Option<ErrorHook>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("steps", &self.steps.len())
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Starts a definition with the job input and output schemas.
    pub fn builder(name: impl Into<Arc<str>>, input: impl Schema, output: impl Schema) -> JobBuilder {
        JobBuilder::new(name.into(), Arc::new(input), Arc::new(output))
    }

    /// Runs before every executed step (not for skipped ones).
    pub fn before_each<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext, StepInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before_each = Some(Arc::new(move |ctx, step| hook(ctx, step).boxed()));
        self
    }

    /// Runs after every executed step, with the result including that step's output.
    pub fn after_each<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext, StepInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after_each = Some(Arc::new(move |ctx, step| hook(ctx, step).boxed()));
        self
    }

    /// Decides whether a failed step may be retried by the queue (`false` = never).
    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext, StepInfo, JobError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |ctx, step, err| hook(ctx, step, err).boxed()));
        self
    }

    /// Job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    /// Queue metadata.
    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Steps in order.
    pub fn steps(&self) -> &[JobStep] {
        &self.steps
    }

    /// Input schema.
    pub fn input_schema(&self) -> &dyn Schema {
        self.input.as_ref()
    }

    /// Output schema.
    pub fn output_schema(&self) -> &dyn Schema {
        self.output.as_ref()
    }

    /// Progress schema, if declared.
    pub fn progress_schema(&self) -> Option<&dyn Schema> {
        self.progress.as_deref()
    }

    /// Dependencies shared by every step.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Parallel group id per member step index.
    pub fn parallel_group_by_step_index(&self) -> &HashMap<usize, usize> {
        &self.groups
    }

    /// Whether the step at `index` has a run condition.
    pub fn is_conditional(&self, index: usize) -> bool {
        self.conditions.contains_key(&index)
    }

    /// Public description of the definition.
    pub fn info(&self) -> JobDefinitionInfo {
        JobDefinitionInfo {
            name: self.name.to_string(),
            options: self.options.clone(),
            steps: self
                .steps
                .iter()
                .enumerate()
                .map(|(i, step)| StepDefinitionInfo {
                    label: step.display_label(i),
                    conditional: self.is_conditional(i),
                    parallel_group: self.groups.get(&i).copied(),
                })
                .collect(),
        }
    }

    pub(crate) fn condition(&self, index: usize) -> Option<&Condition> {
        self.conditions.get(&index)
    }

    /// End (exclusive) of the run of steps sharing the group of `index`.
    pub(crate) fn group_end(&self, index: usize) -> Option<usize> {
        let group = self.groups.get(&index)?;
        let mut end = index + 1;
        while self.groups.get(&end) == Some(group) {
            end += 1;
        }
        Some(end)
    }

    pub(crate) fn data_hook(&self) -> Option<&DataHook> {
        self.data.as_ref()
    }

    pub(crate) fn return_hook(&self) -> Option<&ReturnHook> {
        self.returns.as_ref()
    }

    pub(crate) fn before_each_hook(&self) -> Option<&StepHook> {
        self.before_each.as_ref()
    }

    pub(crate) fn after_each_hook(&self) -> Option<&StepHook> {
        self.after_each.as_ref()
    }

    pub(crate) fn error_hook(&self) -> Option<&ErrorHook> {
        self.on_error.as_ref()
    }
}
