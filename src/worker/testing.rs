//! Test doubles shared by the worker, pool and server test suites.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::error::{LifecycleError, WorkerError};
use crate::policies::{ErrorAction, ErrorPolicy, WorkerErrorContext};
use crate::protocol::{JobTask, ServerMessage, TaskResult};
use crate::worker::{TaskSpawner, WorkerPort};

/// Never restarts, never exits; optionally tolerates degraded pools.
pub(crate) struct ParkPolicy {
    pub degraded: bool,
}

impl ErrorPolicy for ParkPolicy {
    fn on_startup_error(&self, _error: &LifecycleError) -> ErrorAction {
        ErrorAction::Wait
    }

    fn on_worker_error(&self, _error: &WorkerError, _ctx: &WorkerErrorContext) -> ErrorAction {
        ErrorAction::Wait
    }

    fn restart_delay(&self, _consecutive_failures: u32) -> Duration {
        Duration::ZERO
    }

    fn allow_degraded_mode(&self) -> bool {
        self.degraded
    }
}

pub(crate) fn task(name: &str) -> JobTask {
    JobTask {
        job_id: "1".into(),
        job_name: name.into(),
        data: json!({}),
    }
}

/// Replies with the worker id; a `crash` task makes the unit fail.
async fn whoami(mut port: WorkerPort) -> anyhow::Result<()> {
    port.ready(None);
    while let Some(msg) = port.recv().await {
        match msg {
            ServerMessage::Task { task, .. } if task.job_name == "crash" => {
                anyhow::bail!("crash requested")
            }
            ServerMessage::Task { id, .. } => {
                let worker = port.config().id.clone();
                port.reply(
                    id,
                    TaskResult::Success {
                        result: Some(json!({ "worker": worker })),
                    },
                );
            }
            ServerMessage::Stop => break,
        }
    }
    Ok(())
}

/// Spawner with a `whoami` entry.
pub(crate) fn whoami_spawner() -> Arc<TaskSpawner> {
    Arc::new(TaskSpawner::new().with_entry("whoami", whoami))
}
