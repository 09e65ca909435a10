//! Bridge between the consumer loop and the worker pool
//!
//! Decoded tasks flow into the pool through [`TaskPayloadHandler`]; task
//! outcomes flow back into the consumer's event channel through
//! [`TaskEventHandler`]. Both directions block when the other side is full,
//! which keeps the reservation rate in step with execution throughput.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::consumer::{HandoffError, TaskPayloadHandler};
use crate::task::{Task, TaskError, TaskEventHandler, TaskProcessEvent};
use crate::worker::{SubmitError, TaskSubmitter};

/// Connects a consumer's payload intake and outcome channel to a worker pool
#[derive(Debug, Clone)]
pub struct Connector {
    submitter: TaskSubmitter,
    events: mpsc::Sender<TaskProcessEvent>,
}

impl Connector {
    pub fn new(submitter: TaskSubmitter, events: mpsc::Sender<TaskProcessEvent>) -> Self {
        Self { submitter, events }
    }

    async fn relay(&self, event: TaskProcessEvent) {
        let (id, kind) = (event.task.id, event.kind);
        if self.events.send(event).await.is_err() {
            warn!(task_id = id, event = %kind, "Consumer event channel closed, dropping event");
        }
    }
}

#[async_trait]
impl TaskPayloadHandler for Connector {
    /// Submit to the pool, retrying for as long as the pool stays saturated
    async fn handle_payload(&self, task: Task) -> Result<(), HandoffError> {
        let mut task = task;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.submitter.submit_timeout(task).await {
                Ok(()) => {
                    debug!(attempts, "Task handed to worker pool");
                    return Ok(());
                }
                Err(SubmitError::Closed(rejected)) => {
                    return Err(HandoffError::Closed(rejected.id));
                }
                Err(e) => {
                    warn!(
                        attempts,
                        timeout_ms = self.submitter.accept_timeout().as_millis() as u64,
                        "Worker pool saturated, retrying handoff"
                    );
                    task = e.into_task();
                }
            }
        }
    }
}

#[async_trait]
impl TaskEventHandler for Connector {
    async fn on_task_result(&self, task: Arc<Task>, result: Value) {
        self.relay(TaskProcessEvent::progress(task, result)).await;
    }

    async fn on_task_success(&self, task: Arc<Task>) {
        self.relay(TaskProcessEvent::success(task)).await;
    }

    async fn on_task_heartbeat(&self, task: Arc<Task>) {
        self.relay(TaskProcessEvent::heartbeat(task)).await;
    }

    async fn on_task_error(&self, task: Arc<Task>, _error: TaskError) {
        // Already logged by the task's event sink
        self.relay(TaskProcessEvent::error(task)).await;
    }
}
