// Built-in task handlers for local runs
//
// - echo: reports its payload back as a progress result
// - sleep: waits {"ms": N} (or a bare number) milliseconds, heartbeating meanwhile
// - fail: always fails, with {"message": "..."} if given

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use taskqueue_engine::task::{Task, TaskError, TaskEventSink};
use taskqueue_engine::TaskRegistry;

/// Interval between heartbeats of a sleeping task
const SLEEP_HEARTBEAT: Duration = Duration::from_secs(1);

/// Register every built-in handler
pub fn register_builtin(registry: &TaskRegistry) {
    registry.register_fn("echo", echo);
    registry.register_fn("sleep", sleep);
    registry.register_fn("fail", fail);
}

async fn echo(task: Arc<Task>, sink: TaskEventSink) -> Result<(), TaskError> {
    let payload: Value = task.decode_payload()?;
    sink.progress(json!({ "echo": payload })).await;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SleepArgs {
    Millis(u64),
    Object { ms: u64 },
}

impl SleepArgs {
    fn duration(&self) -> Duration {
        match self {
            SleepArgs::Millis(ms) | SleepArgs::Object { ms } => Duration::from_millis(*ms),
        }
    }
}

async fn sleep(task: Arc<Task>, sink: TaskEventSink) -> Result<(), TaskError> {
    let args: SleepArgs = task.decode_payload()?;
    let mut remaining = args.duration();

    while remaining > SLEEP_HEARTBEAT {
        tokio::time::sleep(SLEEP_HEARTBEAT).await;
        remaining -= SLEEP_HEARTBEAT;
        sink.heartbeat().await;
    }
    tokio::time::sleep(remaining).await;

    sink.progress(json!({ "slept_ms": args.duration().as_millis() as u64 }))
        .await;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct FailArgs {
    message: Option<String>,
}

async fn fail(task: Arc<Task>, _sink: TaskEventSink) -> Result<(), TaskError> {
    let args: Option<FailArgs> = task.decode_payload()?;
    let message = args
        .and_then(|a| a.message)
        .unwrap_or_else(|| format!("task {} failed", task.id));
    Err(TaskError::Failed(message))
}
