//! # Job steps.
//!
//! A [`JobStep`] is one unit of a job: an input schema (read from the job
//! input overlaid with everything produced so far), an output schema (merged
//! into the accumulated result), its declared dependencies and the handler.
//! Steps have no side effects of their own; everything happens inside the
//! handler.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::jobs::resources::{Dependency, Resources};
use crate::jobs::schema::{AnyObject, Schema};
use crate::jobs::signal::JobSignal;

/// Boxed step handler: `(context, decoded input, job data) -> output`.
pub type StepHandler =
    Arc<dyn Fn(StepContext, Value, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Immutable step definition. Cheap to clone.
#[derive(Clone)]
pub struct JobStep {
    label: Option<Arc<str>>,
    input: Arc<dyn Schema>,
    output: Arc<dyn Schema>,
    dependencies: Vec<Dependency>,
    handler: StepHandler,
}

impl fmt::Debug for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStep")
            .field("label", &self.label)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl JobStep {
    /// Creates a step with open input and output shapes.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(StepContext, Value, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            label: None,
            input: Arc::new(AnyObject),
            output: Arc::new(AnyObject),
            dependencies: Vec::new(),
            handler: Arc::new(move |ctx, input, data| handler(ctx, input, data).boxed()),
        }
    }

    /// Names the step in logs, events and checkpoints.
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Schema the step input is decoded with.
    pub fn input(mut self, schema: impl Schema) -> Self {
        self.input = Arc::new(schema);
        self
    }

    /// Schema the step output is encoded with.
    pub fn output(mut self, schema: impl Schema) -> Self {
        self.output = Arc::new(schema);
        self
    }

    /// Declares a dependency on the resource of type `T`.
    pub fn requires<T: Any + Send + Sync>(mut self) -> Self {
        self.dependencies.push(Dependency::of::<T>());
        self
    }

    /// Explicit label, if any.
    pub fn label_str(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Label, falling back to the 1-based position in the job.
    pub fn display_label(&self, index: usize) -> String {
        match &self.label {
            Some(label) => label.to_string(),
            None => (index + 1).to_string(),
        }
    }

    /// Input schema.
    pub fn input_schema(&self) -> &dyn Schema {
        self.input.as_ref()
    }

    /// Output schema.
    pub fn output_schema(&self) -> &dyn Schema {
        self.output.as_ref()
    }

    /// Declared dependencies.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub(crate) fn call(&self, ctx: StepContext, input: Value, data: Value) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.handler)(ctx, input, data)
    }
}

/// What a step handler sees besides its input.
#[derive(Clone, Debug)]
pub struct StepContext {
    job: Arc<str>,
    index: usize,
    label: Arc<str>,
    resources: Resources,
    signal: JobSignal,
    progress: Arc<Mutex<Map<String, Value>>>,
}

impl StepContext {
    pub(crate) fn new(
        job: Arc<str>,
        index: usize,
        label: Arc<str>,
        resources: Resources,
        signal: JobSignal,
        progress: Arc<Mutex<Map<String, Value>>>,
    ) -> Self {
        Self {
            job,
            index,
            label,
            resources,
            signal,
            progress,
        }
    }

    /// Job name.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Step index in the job.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Step label (or 1-based position).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Abort signal of the run.
    pub fn signal(&self) -> &JobSignal {
        &self.signal
    }

    /// Resource of type `T`, if provided.
    pub fn resource<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources.get::<T>()
    }

    /// Resource of type `T`, or an error naming the missing type.
    pub fn require<T: Any + Send + Sync>(&self) -> anyhow::Result<Arc<T>> {
        self.resources
            .get::<T>()
            .ok_or_else(|| anyhow::anyhow!("resource {} not provided", std::any::type_name::<T>()))
    }

    /// Records user progress; persisted with the next checkpoint.
    pub fn set_progress(&self, key: impl Into<String>, value: Value) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Current user progress.
    pub fn progress(&self) -> Map<String, Value> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
