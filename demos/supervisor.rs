//! # Supervisor Example
//!
//! Runs an application pool of two workers under a [`Supervisor`] with the
//! built-in [`LogWriter`] subscriber, hot-reloads it once and shuts down.
//!
//! Press Ctrl-C to stop earlier.
//!
//! ## Run
//! ```bash
//! cargo run --example supervisor
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use workvisor::protocol::{Host, ServerMessage};
use workvisor::{
    Config, LogWriter, PoolServerFactory, Subscribe, Supervisor, ThreadSpawner, WorkerKind,
    WorkerPoolConfig, WorkerPort,
};

/// Pretends to listen on a port derived from its slot.
async fn app(mut port: WorkerPort) -> anyhow::Result<()> {
    let slot = port.config().index;
    tokio::time::sleep(Duration::from_millis(100)).await;
    port.ready(Some(vec![Host {
        kind: "http".into(),
        url: format!("http://127.0.0.1:{}", 8080 + slot),
    }]));
    while let Some(msg) = port.recv().await {
        if msg == ServerMessage::Stop {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("workvisor=info").init();

    let cfg = Config {
        grace: Duration::from_secs(5),
        ..Config::default()
    };
    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let builder = Supervisor::builder(cfg).with_subscribers(subs);

    let spawner = Arc::new(ThreadSpawner::new().with_entry("app", app));
    let factory = PoolServerFactory::new(builder.env(), spawner, |manager| {
        let pool = manager.create_pool(WorkerPoolConfig::new("app", WorkerKind::Application, "app"))?;
        for index in 0..2 {
            pool.add(json!({}), index);
        }
        Ok(())
    });
    let sup = Arc::new(builder.build(factory));

    let controller = {
        let sup = Arc::clone(&sup);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(report) = sup.lifecycle().health_report() {
                println!("health before reload: {:?}", report.overall);
            }
            if let Err(err) = sup.reload().await {
                println!("reload failed: {err}");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            sup.shutdown();
        })
    };

    sup.run().await?;
    controller.abort();
    Ok(())
}
