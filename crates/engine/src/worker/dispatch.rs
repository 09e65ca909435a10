//! Per-task dispatch: resolve, execute, report

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tracing::{debug, info, instrument};

use crate::registry::TaskRegistry;
use crate::task::{Task, TaskError, TaskEventHandler, TaskEventSink, TaskHandler};

/// Observer of worker pool lifecycle
///
/// Purely observational; every method defaults to a no-op.
pub trait WorkerEventHandler: Send + Sync {
    /// Pool routines have been spawned
    fn on_start_worker(&self) {}

    /// Pool finished shutting down
    fn on_end_worker(&self) {}

    /// A handler is about to execute `task`
    fn on_pre_task(&self, _task: &Task, _thread_id: usize) {}

    /// A handler finished `task` successfully
    fn on_post_task(&self, _task: &Task, _thread_id: usize) {}

    /// Routine `thread_id` has been idle for a heartbeat interval
    fn on_thread_heartbeat(&self, _thread_id: usize) {}
}

/// State shared by all pool routines
pub(crate) struct Dispatcher {
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) task_events: Option<Arc<dyn TaskEventHandler>>,
    pub(crate) events: Option<Arc<dyn WorkerEventHandler>>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) execution_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Resolve and execute one task, emitting exactly one terminal event
    #[instrument(skip(self, task), fields(task_id = task.id, task_name = %task.name))]
    pub(crate) async fn dispatch(&self, task: Task, thread_id: usize) {
        let task = Arc::new(task);
        let sink = TaskEventSink::new(Arc::clone(&task), self.task_events.clone());

        let mut handler = match self.registry.resolve(&task) {
            Ok(handler) => handler,
            Err(err) => {
                sink.error(err.into()).await;
                return;
            }
        };

        self.on_pre_task(&task, thread_id);

        handler.set_event_sink(sink.clone());
        handler.set_task(Arc::clone(&task));

        match self.execute(handler).await {
            Ok(()) => {
                self.on_post_task(&task, thread_id);
                sink.success().await;
            }
            Err(err) => sink.error(err).await,
        }
    }

    /// Run the handler on its own task so panics and deadlines stay contained
    async fn execute(&self, mut handler: Box<dyn TaskHandler>) -> Result<(), TaskError> {
        let mut execution = tokio::spawn(async move { handler.handle().await });

        let joined = match self.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut execution).await {
                Ok(joined) => joined,
                Err(_) => {
                    execution.abort();
                    return Err(TaskError::Timeout(limit));
                }
            },
            None => execution.await,
        };

        joined.unwrap_or_else(|err| Err(join_error(err)))
    }

    pub(crate) fn on_start_worker(&self) {
        info!("Worker started");
        if let Some(events) = &self.events {
            events.on_start_worker();
        }
    }

    pub(crate) fn on_end_worker(&self) {
        info!("Worker ended");
        if let Some(events) = &self.events {
            events.on_end_worker();
        }
    }

    pub(crate) fn on_thread_heartbeat(&self, thread_id: usize) {
        debug!(
            thread_id,
            interval_ms = self.heartbeat_interval.as_millis() as u64,
            "Task thread heartbeat"
        );
        if let Some(events) = &self.events {
            events.on_thread_heartbeat(thread_id);
        }
    }

    fn on_pre_task(&self, task: &Task, thread_id: usize) {
        info!(thread_id, "Task pre-handler");
        if let Some(events) = &self.events {
            events.on_pre_task(task, thread_id);
        }
    }

    fn on_post_task(&self, task: &Task, thread_id: usize) {
        info!(thread_id, "Task post-handler");
        if let Some(events) = &self.events {
            events.on_post_task(task, thread_id);
        }
    }
}

fn join_error(err: JoinError) -> TaskError {
    if err.is_panic() {
        TaskError::Panicked(panic_message(err.into_panic()))
    } else {
        TaskError::failed("task handler was cancelled")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
