//! # Process Worker Example
//!
//! Runs job runner workers as child processes. The example re-executes its
//! own binary: when [`WORKER_CONFIG_ENV`] is set it acts as the worker unit and
//! serves the job protocol over stdio, otherwise it supervises two children.
//!
//! ## Run
//! ```bash
//! cargo run --example process_worker
//! ```

use std::sync::Arc;

use serde_json::json;

use workvisor::jobs::{
    FieldKind, Job, JobRegistry, JobRunner, JobStep, JobWorkerRuntime, ObjectSchema,
};
use workvisor::protocol::JobTask;
use workvisor::{
    PoolManager, ProcessSpawner, UnattendedPolicy, WORKER_CONFIG_ENV, WorkerEnv, WorkerKind,
    WorkerPoolConfig, serve_stdio,
};

fn runtime() -> anyhow::Result<JobWorkerRuntime> {
    let square = JobStep::new(|_, input, _| async move {
        let n = input["n"].as_i64().unwrap_or_default();
        Ok(json!({ "square": n * n, "pid": std::process::id() }))
    })
    .label("square")
    .input(ObjectSchema::new().field("n", FieldKind::Number))
    .output(ObjectSchema::new().field("square", FieldKind::Number));

    let job = Job::builder(
        "square",
        ObjectSchema::new().field("n", FieldKind::Number),
        ObjectSchema::new().field("square", FieldKind::Number),
    )
    .step(square)
    .finish()?;
    Ok(JobWorkerRuntime::new(JobRegistry::new().with(job)?, JobRunner::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os(WORKER_CONFIG_ENV).is_some() {
        let code = serve_stdio(runtime()?.entry()).await;
        std::process::exit(code);
    }

    tracing_subscriber::fmt()
        .with_env_filter("workvisor=info")
        .with_writer(std::io::stderr)
        .init();

    let exe = std::env::current_exe()?;
    let spawner = ProcessSpawner::new().with_command("square", exe.to_string_lossy(), Vec::<String>::new());
    let manager = PoolManager::with_spawner(
        WorkerEnv::new(Arc::new(UnattendedPolicy::default())),
        Arc::new(spawner),
    );
    let pool = manager.create_pool(WorkerPoolConfig::new("square", WorkerKind::JobRunner, "square"))?;
    for index in 0..2 {
        pool.add(json!({}), index);
    }
    manager.start_all().await?;

    let jobs = manager
        .job_runners("square")
        .ok_or_else(|| anyhow::anyhow!("square pool missing"))?;
    for n in 1..=4 {
        let task = JobTask {
            job_id: format!("square-{n}"),
            job_name: "square".into(),
            data: json!({ "n": n }),
        };
        println!("{n}² => {:?}", jobs.run(task).await?);
    }

    manager.stop_all().await;
    Ok(())
}
