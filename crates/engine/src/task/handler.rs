//! Task handler trait definition

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Task, TaskError, TaskEventSink};

/// A unit of execution resolved by task name
///
/// The registry creates one fresh handler per task, so implementations may
/// keep per-task state in `self` without synchronization. The worker pool
/// binds the task and its outcome sink before calling [`handle`](Self::handle).
///
/// # Example
///
/// ```ignore
/// struct ResizeHandler {
///     task: Option<Arc<Task>>,
///     sink: Option<TaskEventSink>,
/// }
///
/// #[async_trait]
/// impl TaskHandler for ResizeHandler {
///     fn set_task(&mut self, task: Arc<Task>) {
///         self.task = Some(task);
///     }
///
///     fn set_event_sink(&mut self, sink: TaskEventSink) {
///         self.sink = Some(sink);
///     }
///
///     async fn handle(&mut self) -> Result<(), TaskError> {
///         let args: ResizeArgs = self.task.as_ref().unwrap().decode_payload()?;
///         // Resize...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send {
    /// Bind the task to execute
    fn set_task(&mut self, task: Arc<Task>);

    /// Bind the sink used to report progress and heartbeats
    fn set_event_sink(&mut self, sink: TaskEventSink);

    /// Execute the bound task
    ///
    /// # Errors
    ///
    /// Any error becomes an Error outcome and buries the broker job.
    async fn handle(&mut self) -> Result<(), TaskError>;
}

/// Factory producing a fresh handler instance per task
pub type TaskHandlerFactory = Arc<dyn Fn() -> Box<dyn TaskHandler> + Send + Sync>;

/// Boxed future returned by function handlers
pub type TaskHandlerFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

type HandlerFn = Arc<dyn Fn(Arc<Task>, TaskEventSink) -> TaskHandlerFuture + Send + Sync>;

/// Adapts an async function to the [`TaskHandler`] capability
///
/// # Example
///
/// ```ignore
/// let handler = BaseTaskHandler::new(|task, sink| async move {
///     sink.progress(json!({"name": task.name})).await;
///     Ok(())
/// });
/// ```
pub struct BaseTaskHandler {
    func: HandlerFn,
    task: Option<Arc<Task>>,
    sink: Option<TaskEventSink>,
}

impl BaseTaskHandler {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Arc<Task>, TaskEventSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self::from_shared(Self::shared(func))
    }

    fn shared<F, Fut>(func: F) -> HandlerFn
    where
        F: Fn(Arc<Task>, TaskEventSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Arc::new(move |task: Arc<Task>, sink: TaskEventSink| {
            Box::pin(func(task, sink)) as TaskHandlerFuture
        })
    }

    fn from_shared(func: HandlerFn) -> Self {
        Self {
            func,
            task: None,
            sink: None,
        }
    }

    /// Build a factory that creates a new handler around the same function
    pub fn factory<F, Fut>(func: F) -> TaskHandlerFactory
    where
        F: Fn(Arc<Task>, TaskEventSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let func = Self::shared(func);
        Arc::new(move || Box::new(Self::from_shared(Arc::clone(&func))) as Box<dyn TaskHandler>)
    }
}

#[async_trait]
impl TaskHandler for BaseTaskHandler {
    fn set_task(&mut self, task: Arc<Task>) {
        self.task = Some(task);
    }

    fn set_event_sink(&mut self, sink: TaskEventSink) {
        self.sink = Some(sink);
    }

    async fn handle(&mut self) -> Result<(), TaskError> {
        let task = self
            .task
            .clone()
            .ok_or_else(|| TaskError::failed("no task bound to handler"))?;
        let sink = self
            .sink
            .clone()
            .unwrap_or_else(|| TaskEventSink::detached(Arc::clone(&task)));

        (self.func)(task, sink).await
    }
}
