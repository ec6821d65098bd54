//! Step-based jobs with checkpointed, resumable execution.
//!
//! ## Contents
//! - [`Schema`], [`ObjectSchema`], [`AnyObject`] payload shapes
//! - [`JobStep`], [`StepContext`] one unit of work and what its handler sees
//! - [`Job`], [`JobBuilder`], [`JobOptions`] immutable job definitions
//! - [`JobRunner`], [`RunOptions`] step execution with hooks, conditions and parallel groups
//! - [`JobRunCheckpoint`], [`StepResultEntry`], [`CheckpointStore`] resumption state
//! - [`JobSignal`] cooperative cancellation
//! - [`Resources`], [`Dependency`] services injected into step handlers
//! - [`JobRegistry`], [`JobWorkerRuntime`] the worker unit side of a job pool
//!
//! ## Example
//! ```no_run
//! use serde_json::json;
//! use workvisor::jobs::{FieldKind, Job, JobRunner, JobStep, ObjectSchema, RunOptions};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let add = JobStep::new(|_, input, _| async move {
//!     Ok(json!({ "sum": input["a"].as_i64().unwrap_or(0) + input["b"].as_i64().unwrap_or(0) }))
//! })
//! .input(ObjectSchema::new().field("a", FieldKind::Integer).field("b", FieldKind::Integer))
//! .output(ObjectSchema::new().field("sum", FieldKind::Integer));
//!
//! let job = Job::builder(
//!     "add",
//!     ObjectSchema::new().field("a", FieldKind::Integer).field("b", FieldKind::Integer),
//!     ObjectSchema::new().field("sum", FieldKind::Integer),
//! )
//! .step(add)
//! .finish()?;
//!
//! let out = JobRunner::new()
//!     .run_job(&job, json!({"a": 1, "b": 2}), RunOptions::new())
//!     .await?;
//! assert_eq!(out, json!({"sum": 3}));
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod job;
mod resources;
mod runner;
mod schema;
mod signal;
mod step;
mod worker;

pub use checkpoint::{CheckpointStore, JobRunCheckpoint, MemoryCheckpointStore, StepResultEntry};
pub use job::{
    Condition, DataHook, ErrorHook, HookContext, Job, JobBackoff, JobBackoffKind, JobBuilder,
    JobDefinitionInfo, JobOptions, ReturnHook, StepDefinitionInfo, StepHook, StepInfo,
};
pub use resources::{Dependency, Resources};
pub use runner::{JobRunner, RunOptions};
pub use schema::{AnyObject, Field, FieldKind, ObjectSchema, Schema};
pub use signal::JobSignal;
pub use step::{JobStep, StepContext, StepHandler};
pub use worker::{JobRegistry, JobWorkerRuntime};
