//! Task outcome events

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use super::{Task, TaskError};

/// Kind of outcome event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Intermediate result reported by the handler (no broker action)
    Progress,
    /// Task completed; the job is deleted
    Success,
    /// Task failed; the job is buried
    Error,
    /// Task is alive; the job lease is touched
    Heartbeat,
}

impl TaskEventKind {
    /// Whether this event ends the task's event stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Success => "success",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome event delivered to the consumer loop
#[derive(Debug, Clone)]
pub struct TaskProcessEvent {
    pub kind: TaskEventKind,
    pub task: Arc<Task>,
    /// Free-form result, only set for [`TaskEventKind::Progress`]
    pub result: Option<Value>,
}

impl TaskProcessEvent {
    pub fn progress(task: Arc<Task>, result: Value) -> Self {
        Self {
            kind: TaskEventKind::Progress,
            task,
            result: Some(result),
        }
    }

    pub fn success(task: Arc<Task>) -> Self {
        Self {
            kind: TaskEventKind::Success,
            task,
            result: None,
        }
    }

    pub fn error(task: Arc<Task>) -> Self {
        Self {
            kind: TaskEventKind::Error,
            task,
            result: None,
        }
    }

    pub fn heartbeat(task: Arc<Task>) -> Self {
        Self {
            kind: TaskEventKind::Heartbeat,
            task,
            result: None,
        }
    }
}

/// Receiver of task outcome notifications
///
/// The worker pool reports every task outcome through this trait. The
/// connector implements it to relay outcomes to the consumer loop, where they
/// turn into broker acknowledgments.
#[async_trait]
pub trait TaskEventHandler: Send + Sync {
    /// Handler reported an intermediate result
    async fn on_task_result(&self, task: Arc<Task>, result: Value);

    /// Handler completed successfully
    async fn on_task_success(&self, task: Arc<Task>);

    /// Handler is still working on the task
    async fn on_task_heartbeat(&self, task: Arc<Task>);

    /// Task failed (unknown type, handler error, timeout or panic)
    async fn on_task_error(&self, task: Arc<Task>, error: TaskError);
}

/// Per-task outcome sink handed to a [`TaskHandler`](super::TaskHandler)
///
/// Logs each outcome and forwards it to the pool's [`TaskEventHandler`], if
/// any. The sink is closed by the first terminal event: a second terminal
/// event is dropped, as is any progress or heartbeat reported after it.
#[derive(Clone)]
pub struct TaskEventSink {
    task: Arc<Task>,
    handler: Option<Arc<dyn TaskEventHandler>>,
    closed: Arc<AtomicBool>,
}

impl TaskEventSink {
    /// Create a sink for `task` forwarding to `handler`
    pub fn new(task: Arc<Task>, handler: Option<Arc<dyn TaskEventHandler>>) -> Self {
        Self {
            task,
            handler,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a sink that only logs
    pub fn detached(task: Arc<Task>) -> Self {
        Self::new(task, None)
    }

    /// The task this sink reports for
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Whether a terminal event has been emitted
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Report an intermediate result
    pub async fn progress(&self, result: Value) {
        if self.reject_after_close(TaskEventKind::Progress) {
            return;
        }

        info!(task_id = self.task.id, task_name = %self.task.name, %result, "Task result");

        if let Some(handler) = &self.handler {
            handler.on_task_result(Arc::clone(&self.task), result).await;
        }
    }

    /// Report that the task is still alive (extends the broker lease)
    pub async fn heartbeat(&self) {
        if self.reject_after_close(TaskEventKind::Heartbeat) {
            return;
        }

        info!(task_id = self.task.id, task_name = %self.task.name, "Task heartbeat");

        if let Some(handler) = &self.handler {
            handler.on_task_heartbeat(Arc::clone(&self.task)).await;
        }
    }

    pub(crate) async fn success(&self) {
        if !self.close(TaskEventKind::Success) {
            return;
        }

        info!(task_id = self.task.id, task_name = %self.task.name, "Task success");

        if let Some(handler) = &self.handler {
            handler.on_task_success(Arc::clone(&self.task)).await;
        }
    }

    pub(crate) async fn error(&self, err: TaskError) {
        if !self.close(TaskEventKind::Error) {
            return;
        }

        error!(task_id = self.task.id, task_name = %self.task.name, error = %err, "Task failed");

        if let Some(handler) = &self.handler {
            handler.on_task_error(Arc::clone(&self.task), err).await;
        }
    }

    /// Returns true if this call closed the sink
    fn close(&self, kind: TaskEventKind) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if !first {
            warn!(
                task_id = self.task.id,
                event = %kind,
                "Dropping duplicate terminal event"
            );
        }
        first
    }

    fn reject_after_close(&self, kind: TaskEventKind) -> bool {
        let closed = self.is_closed();
        if closed {
            warn!(
                task_id = self.task.id,
                event = %kind,
                "Dropping event reported after task completion"
            );
        }
        closed
    }
}

impl fmt::Debug for TaskEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEventSink")
            .field("task", &self.task)
            .field("attached", &self.handler.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
