//! Task registry for name-based handler dispatch
//!
//! The registry maps task names to factories that create a fresh
//! [`TaskHandler`] for every task. It is an explicit instance shared by the
//! worker pool, so independent pools (and tests) never see each other's
//! registrations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::task::{BaseTaskHandler, Task, TaskError, TaskEventSink, TaskHandler, TaskHandlerFactory};

/// Registry of task handler factories
///
/// Registration may happen before or while tasks are flowing. Registering a
/// name twice replaces the previous factory.
pub struct TaskRegistry {
    factories: RwLock<HashMap<String, TaskHandlerFactory>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler factory under `name`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let registry = TaskRegistry::new();
    /// registry.register("resize", Arc::new(|| Box::new(ResizeHandler::default()) as Box<dyn TaskHandler>));
    /// ```
    pub fn register(&self, name: impl Into<String>, factory: TaskHandlerFactory) {
        let name = name.into();
        info!(task_name = %name, "Task registered");
        self.factories.write().insert(name, factory);
    }

    /// Register an async function as the handler for `name`
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(Arc<Task>, TaskEventSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.register(name, BaseTaskHandler::factory(func));
    }

    /// Create a new handler for `task`
    ///
    /// The handler is not bound to the task yet.
    pub fn resolve(&self, task: &Task) -> Result<Box<dyn TaskHandler>, RegistryError> {
        let factory = self
            .factories
            .read()
            .get(&task.name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTaskType(task.name.clone()))?;

        debug!(task_id = task.id, task_name = %task.name, "Resolved task handler");

        // Invoke outside the lock so factories may touch the registry
        Ok(factory())
    }

    /// Check if a task name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Get all registered task names (unordered)
    pub fn registered_tasks(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Get the number of registered task names
    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.registered_tasks())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Task name not registered
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn short_registry() -> TaskRegistry {
        let registry = TaskRegistry::new();
        registry.register_fn("short", |_task, _sink| async { Ok(()) });
        registry
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = short_registry();

        assert!(registry.contains("short"));
        assert!(!registry.contains("unknown"));

        let handler = registry.resolve(&Task::new("short", "{}"));
        assert!(handler.is_ok());
    }

    #[test]
    fn test_unknown_task_type() {
        let registry = short_registry();
        let result = registry.resolve(&Task::new("missing", "{}"));

        assert!(matches!(result, Err(RegistryError::UnknownTaskType(name)) if name == "missing"));
    }

    #[test]
    fn test_registered_tasks() {
        let registry = short_registry();
        assert_eq!(registry.registered_tasks(), vec!["short".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_resolve_invokes_factory_each_time() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);

        let registry = TaskRegistry::new();
        registry.register(
            "counted",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(BaseTaskHandler::new(|_task, _sink| async { Ok(()) })) as Box<dyn TaskHandler>
            }),
        );

        let task = Task::new("counted", "");
        registry.resolve(&task).unwrap();
        registry.resolve(&task).unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = TaskRegistry::new();
        registry.register_fn("job", |_task, _sink| async { Err(TaskError::failed("old")) });
        registry.register_fn("job", |_task, _sink| async { Ok(()) });

        let mut handler = registry.resolve(&Task::new("job", "")).unwrap();
        handler.set_task(Arc::new(Task::new("job", "")));

        assert!(handler.handle().await.is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_independent_registries() {
        let first = short_registry();
        let second = TaskRegistry::new();

        assert!(first.contains("short"));
        assert!(second.is_empty());
    }

    #[test]
    fn test_registry_debug() {
        let registry = short_registry();
        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("short"));
    }
}
