// Run the engine against an in-memory broker seeded from task files

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use taskqueue_engine::broker::InMemoryBroker;
use taskqueue_engine::{Server, ServerConfig, TaskRegistry};
use tracing::{error, info};

use super::read_task_file;
use crate::handlers::register_builtin;
use crate::output::{print_field, OutputFormat};

/// Priority of seeded jobs
const PUT_PRIORITY: u32 = 1;

/// How often `--until-drained` checks the broker
const DRAIN_POLL: Duration = Duration::from_millis(100);

pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub until_drained: bool,
    pub files: Vec<PathBuf>,
}

pub async fn run(args: RunArgs, output: OutputFormat) -> Result<()> {
    let config = ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let broker = Arc::new(InMemoryBroker::new());
    for path in &args.files {
        let (body, task) = read_task_file(path)?;
        let id = broker.put(body, PUT_PRIORITY);
        info!(job_id = id, task_name = %task.name, file = %path.display(), "Job seeded");
    }

    let registry = Arc::new(TaskRegistry::new());
    register_builtin(&registry);

    info!(
        worker_id = %config.worker.worker_id,
        concurrency = config.worker.concurrency,
        jobs = args.files.len(),
        "Starting task queue"
    );

    let server = Server::new(config, registry, broker.clone());
    server.start().await.context("Failed to start server")?;

    tokio::select! {
        _ = wait_drained(&broker), if args.until_drained => {
            info!("All jobs processed");
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    }

    server.stop().await;

    let stats = broker.stats();
    if output.is_text() {
        print_field("Deleted", &stats.deleted.to_string());
        print_field("Buried", &stats.buried.to_string());
        print_field("Ready", &stats.ready.to_string());
        print_field("Reserved", &stats.reserved.to_string());
    } else {
        output.print_value(&stats)?;
    }

    Ok(())
}

async fn wait_drained(broker: &InMemoryBroker) {
    while !broker.is_drained() {
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_until_drained() {
        let dir = std::env::temp_dir().join(format!("taskqueue-cli-run-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let config = dir.join("config.json");
        std::fs::write(
            &config,
            r#"{"worker": {"concurrency": 2}, "consumer": {"reserve_timeout": 20, "heartbeat_interval": 10}}"#,
        )
        .unwrap();

        let echo = dir.join("echo.json");
        std::fs::write(&echo, r#"{"name":"echo","payload":{"text":"hi"}}"#).unwrap();
        let fail = dir.join("fail.json");
        std::fs::write(&fail, r#"{"name":"fail"}"#).unwrap();

        let args = RunArgs {
            config: Some(config),
            until_drained: true,
            files: vec![echo, fail],
        };
        let result = tokio::time::timeout(Duration::from_secs(5), run(args, OutputFormat::Json)).await;
        std::fs::remove_dir_all(&dir).ok();

        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_task_file() {
        let dir = std::env::temp_dir().join(format!("taskqueue-cli-invalid-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let bad = dir.join("bad.json");
        std::fs::write(&bad, "").unwrap();

        let args = RunArgs {
            config: None,
            until_drained: true,
            files: vec![bad],
        };
        let result = run(args, OutputFormat::Text).await;
        std::fs::remove_dir_all(&dir).ok();

        assert!(result.is_err());
    }
}
