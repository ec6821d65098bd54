//! # Job Pipeline Example
//!
//! Runs a four step job `A → [B ∥ C] → D` on a pool of two job runner
//! workers, each on its own thread.
//!
//! The second run fails in `C`, leaving a checkpoint after `A`. Running the
//! same job id again resumes from that checkpoint instead of repeating `A`.
//!
//! ## Run
//! ```bash
//! cargo run --example job_pipeline
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};

use workvisor::jobs::{
    CheckpointStore, FieldKind, Job, JobRegistry, JobRunner, JobStep, JobWorkerRuntime,
    MemoryCheckpointStore, ObjectSchema,
};
use workvisor::protocol::JobTask;
use workvisor::{
    DefinitionError, PoolManager, ThreadSpawner, UnattendedPolicy, WorkerEnv, WorkerKind,
    WorkerPoolConfig,
};

fn numbers(fields: &[&str]) -> ObjectSchema {
    fields
        .iter()
        .fold(ObjectSchema::new(), |s, f| s.field(*f, FieldKind::Number))
}

fn num(input: &Value, key: &str) -> i64 {
    input[key].as_i64().unwrap_or_default()
}

fn pipeline(flaky: Arc<AtomicBool>) -> Result<Job, DefinitionError> {
    let a = JobStep::new(|_, input, _| async move {
        println!("  A: seed={}", num(&input, "seed"));
        Ok(json!({ "a": num(&input, "seed") + 1 }))
    })
    .label("A")
    .input(numbers(&["seed"]))
    .output(numbers(&["a"]));

    let b = JobStep::new(|_, input, _| async move { Ok(json!({ "b": num(&input, "a") * 10 })) })
        .label("B")
        .input(numbers(&["a"]))
        .output(numbers(&["b"]));

    let c = JobStep::new(move |_, input, _| {
        let flaky = flaky.clone();
        async move {
            if flaky.swap(false, Ordering::SeqCst) {
                anyhow::bail!("upstream timed out");
            }
            Ok(json!({ "c": num(&input, "a") + num(&input, "seed") }))
        }
    })
    .label("C")
    .input(numbers(&["seed", "a"]))
    .output(numbers(&["c"]));

    let d = JobStep::new(|_, input, _| async move {
        Ok(json!({ "total": num(&input, "b") + num(&input, "c") }))
    })
    .label("D")
    .input(numbers(&["b", "c"]))
    .output(numbers(&["total"]));

    Job::builder("pipeline", numbers(&["seed"]), numbers(&["total"]))
        .step(a)
        .steps([b, c])
        .step(d)
        .finish()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("workvisor=info").init();

    let flaky = Arc::new(AtomicBool::new(false));
    let store = Arc::new(MemoryCheckpointStore::new());
    let registry = JobRegistry::new().with(pipeline(flaky.clone())?)?;
    let runtime = JobWorkerRuntime::new(registry, JobRunner::new().with_store(store.clone()));
    let spawner = Arc::new(ThreadSpawner::new().with_entry_fn("jobs", runtime.entry()));

    let manager = PoolManager::with_spawner(WorkerEnv::new(Arc::new(UnattendedPolicy::default())), spawner);
    let pool = manager.create_pool(WorkerPoolConfig::new("jobs", WorkerKind::JobRunner, "jobs"))?;
    for index in 0..2 {
        pool.add(json!({}), index);
    }
    manager.start_all().await?;
    let jobs = manager
        .job_runners("jobs")
        .ok_or_else(|| anyhow::anyhow!("jobs pool missing"))?;

    let task = |id: &str, seed: i64| JobTask {
        job_id: id.to_string(),
        job_name: "pipeline".to_string(),
        data: json!({ "seed": seed }),
    };

    println!("run-1:");
    store.enqueue("run-1");
    println!("  => {:?}", jobs.run(task("run-1", 2)).await?);

    println!("run-2 (C fails once):");
    store.enqueue("run-2");
    flaky.store(true, Ordering::SeqCst);
    println!("  => {:?}", jobs.run(task("run-2", 5)).await?);
    if let Some(checkpoint) = store.load("run-2").await? {
        println!(
            "  checkpoint: step {} ({:?})",
            checkpoint.step_index, checkpoint.step_label
        );
    }

    println!("run-2 redelivered:");
    println!("  => {:?}", jobs.run(task("run-2", 5)).await?);

    manager.stop_all().await;
    Ok(())
}
