//! # Checkpoints.
//!
//! A [`JobRunCheckpoint`] is written after every step. Together with the
//! original job input it is everything a fresh runner needs to continue a run
//! exactly where the previous one stopped.
//!
//! The durable store is owned by the queue broker integration; the runner
//! only calls [`CheckpointStore::save`] and [`CheckpointStore::load`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Outcome of one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResultEntry {
    /// Encoded step output; empty for a skipped step.
    pub data: Map<String, Value>,
    /// Whether the step condition was false.
    #[serde(default)]
    pub skipped: bool,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// When the step finished.
    pub completed_at: DateTime<Utc>,
    /// Wall time in milliseconds.
    pub duration: u64,
}

impl StepResultEntry {
    pub(crate) fn completed(data: Map<String, Value>, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        Self {
            data,
            skipped: false,
            started_at,
            completed_at,
            duration: (completed_at - started_at).num_milliseconds().max(0) as u64,
        }
    }

    pub(crate) fn skipped() -> Self {
        let now = Utc::now();
        Self {
            data: Map::new(),
            skipped: true,
            started_at: now,
            completed_at: now,
            duration: 0,
        }
    }
}

/// Persisted progress of one job run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunCheckpoint {
    /// Index of the next step to execute.
    pub step_index: usize,
    /// Label of the last finished step.
    pub step_label: Option<String>,
    /// Accumulated result.
    pub result: Map<String, Value>,
    /// One slot per step; `None` until the step completed or was skipped.
    pub step_results: Vec<Option<StepResultEntry>>,
    /// Encoded user progress.
    #[serde(default)]
    pub progress: Value,
}

/// Durable checkpoint storage keyed by job run id.
///
/// Writes for one run id are serialized by the queue broker: only one runner
/// is ever active for a given run.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Replaces the checkpoint of `run_id`.
    async fn save(&self, run_id: &str, checkpoint: &JobRunCheckpoint) -> Result<(), StoreError>;

    /// Checkpoint of `run_id`; `Ok(None)` for a run that has not finished a step yet.
    ///
    /// Fails with [`StoreError::NotFound`] when the run itself is unknown.
    async fn load(&self, run_id: &str) -> Result<Option<JobRunCheckpoint>, StoreError>;
}

/// In-memory store, for tests and single-process setups.
///
/// Runs must be registered with [`MemoryCheckpointStore::enqueue`] before they
/// can be loaded, mirroring a queue record that exists before its first attempt.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Option<JobRunCheckpoint>>>,
}

impl MemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run without progress.
    pub fn enqueue(&self, run_id: impl Into<String>) {
        self.lock().entry(run_id.into()).or_insert(None);
    }

    /// Forgets a run, as a broker does when a record is removed.
    pub fn remove(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    /// Current checkpoint of `run_id`.
    pub fn get(&self, run_id: &str) -> Option<JobRunCheckpoint> {
        self.lock().get(run_id).cloned().flatten()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<JobRunCheckpoint>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, run_id: &str, checkpoint: &JobRunCheckpoint) -> Result<(), StoreError> {
        match self.lock().get_mut(run_id) {
            Some(slot) => {
                *slot = Some(checkpoint.clone());
                Ok(())
            }
            None => Err(StoreError::NotFound(run_id.to_string())),
        }
    }

    async fn load(&self, run_id: &str) -> Result<Option<JobRunCheckpoint>, StoreError> {
        self.lock()
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }
}
