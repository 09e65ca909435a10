//! Worker pool for task execution
//!
//! Runs a fixed number of routines pulling from a bounded queue, with
//! heartbeats while idle and a supervisor handling graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::dispatch::{Dispatcher, WorkerEventHandler};
use super::queue::{SubmitError, TaskSubmitter};
use crate::config::{duration_millis, option_duration_millis};
use crate::registry::TaskRegistry;
use crate::task::{Task, TaskEventHandler};

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Worker ID used to correlate logs (generated if not provided)
    pub worker_id: String,

    /// Number of execution routines (and submission queue capacity)
    pub concurrency: usize,

    /// How long a submission may wait before the pool counts as saturated
    #[serde(with = "duration_millis")]
    pub accept_timeout: Duration,

    /// How long shutdown waits for routines to finish
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Idle time after which a routine reports a heartbeat
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Per-task execution deadline (none by default)
    #[serde(with = "option_duration_millis")]
    pub execution_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            accept_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            execution_timeout: None,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of routines
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the accept timeout
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the per-task execution deadline
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Created, routines not spawned yet
    Created,
    /// Routines are accepting tasks
    Running,
    /// Shutdown requested, waiting for routines
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// The pool was stopped and cannot be restarted
    #[error("worker pool has been stopped")]
    AlreadyStopped,

    /// Task submission failed
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Worker pool executing tasks on a fixed set of routines
///
/// # Example
///
/// ```ignore
/// use taskqueue_engine::worker::{WorkerPool, WorkerPoolConfig};
///
/// let registry = Arc::new(TaskRegistry::new());
/// registry.register_fn("echo", |_task, _sink| async { Ok(()) });
///
/// let mut pool = WorkerPool::new(WorkerPoolConfig::new().with_concurrency(4), registry);
/// pool.set_task_event_handler(connector.clone());
///
/// pool.start().await?;
/// pool.submit(Task::new("echo", "{}")).await?;
///
/// // ... later, graceful shutdown
/// pool.stop().await;
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    registry: Arc<TaskRegistry>,
    submitter: TaskSubmitter,
    queue: SharedQueue,
    task_events: Option<Arc<dyn TaskEventHandler>>,
    events: Option<Arc<dyn WorkerEventHandler>>,
    status: RwLock<WorkerPoolStatus>,
    thread_counter: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(config: WorkerPoolConfig, registry: Arc<TaskRegistry>) -> Self {
        let concurrency = config.concurrency.max(1);
        let (tx, rx) = mpsc::channel(concurrency);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            submitter: TaskSubmitter::new(tx, config.accept_timeout),
            config: WorkerPoolConfig {
                concurrency,
                ..config
            },
            registry,
            queue: Arc::new(tokio::sync::Mutex::new(rx)),
            task_events: None,
            events: None,
            status: RwLock::new(WorkerPoolStatus::Created),
            thread_counter: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            supervisor: Mutex::new(None),
        }
    }

    /// Set the receiver of task outcomes
    pub fn set_task_event_handler(&mut self, handler: Arc<dyn TaskEventHandler>) {
        self.task_events = Some(handler);
    }

    /// Set the observer of pool lifecycle events
    pub fn set_event_handler(&mut self, handler: Arc<dyn WorkerEventHandler>) {
        self.events = Some(handler);
    }

    /// Start routines and the shutdown supervisor
    ///
    /// Returns immediately; tasks flow once routines are scheduled.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            match *status {
                WorkerPoolStatus::Created => *status = WorkerPoolStatus::Running,
                WorkerPoolStatus::Running => return Err(WorkerPoolError::AlreadyRunning),
                WorkerPoolStatus::Draining | WorkerPoolStatus::Stopped => {
                    return Err(WorkerPoolError::AlreadyStopped)
                }
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            tasks = ?self.registry.registered_tasks(),
            "Starting worker pool"
        );

        let dispatcher = Arc::new(Dispatcher {
            registry: Arc::clone(&self.registry),
            task_events: self.task_events.clone(),
            events: self.events.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            execution_timeout: self.config.execution_timeout,
        });

        dispatcher.on_start_worker();

        let (stop_tx, stop_rx) = watch::channel(false);
        let routines = (0..self.config.concurrency)
            .map(|_| {
                tokio::spawn(run_routine(
                    Arc::clone(&self.thread_counter),
                    Arc::clone(&dispatcher),
                    Arc::clone(&self.queue),
                    stop_rx.clone(),
                ))
            })
            .collect();

        let supervisor = Supervisor {
            shutdown_rx: self.shutdown_tx.subscribe(),
            stop_tx,
            routines,
            queue: Arc::clone(&self.queue),
            shutdown_timeout: self.config.shutdown_timeout,
            dispatcher,
        };
        *self.supervisor.lock() = Some(tokio::spawn(supervisor.run()));

        Ok(())
    }

    /// Stop the pool and wait for the supervisor to finish
    ///
    /// In-flight handlers are not interrupted. Waiting is bounded by the
    /// shutdown timeout; routines still busy after it are left running and
    /// the pool reports stopped regardless.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn stop(&self) {
        let previous = {
            let mut status = self.status.write();
            let previous = *status;
            match previous {
                WorkerPoolStatus::Running => *status = WorkerPoolStatus::Draining,
                WorkerPoolStatus::Created => *status = WorkerPoolStatus::Stopped,
                WorkerPoolStatus::Draining | WorkerPoolStatus::Stopped => return,
            }
            previous
        };

        if previous == WorkerPoolStatus::Created {
            self.queue.lock().await.close();
            return;
        }

        info!(worker_id = %self.config.worker_id, "Worker stopping");

        let _ = self.shutdown_tx.send(true);

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!("Worker supervisor failed: {}", e);
            }
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
    }

    /// Enqueue a task, waiting while the queue is full
    pub async fn submit(&self, task: Task) -> Result<(), WorkerPoolError> {
        Ok(self.submitter.submit(task).await?)
    }

    /// Handle for submitting tasks from other components
    pub fn submitter(&self) -> TaskSubmitter {
        self.submitter.clone()
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Get the configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Number of tasks waiting for a free routine
    pub fn queued_tasks(&self) -> usize {
        self.submitter.queued()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Wake the supervisor so detached routines wind down
        let _ = self.shutdown_tx.send(true);
    }
}

/// Execution routine: Running -> Executing -> Running until stopped
async fn run_routine(
    counter: Arc<AtomicUsize>,
    dispatcher: Arc<Dispatcher>,
    queue: SharedQueue,
    mut stop_rx: watch::Receiver<bool>,
) {
    let thread_id = counter.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(thread_id, "Task thread started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            task = next_task(&queue) => match task {
                Some(task) => dispatcher.dispatch(task, thread_id).await,
                None => break,
            },
            _ = tokio::time::sleep(dispatcher.heartbeat_interval) => {
                dispatcher.on_thread_heartbeat(thread_id);
            }
        }
    }

    debug!(thread_id, "Task thread ended");
}

async fn next_task(queue: &SharedQueue) -> Option<Task> {
    queue.lock().await.recv().await
}

/// Coordinates shutdown: stop routines, close the queue, wait with a deadline
struct Supervisor {
    shutdown_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
    routines: Vec<JoinHandle<()>>,
    queue: SharedQueue,
    shutdown_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
}

impl Supervisor {
    async fn run(mut self) {
        while !*self.shutdown_rx.borrow_and_update() {
            if self.shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!(count = self.routines.len(), "Task threads stopping");
        let _ = self.stop_tx.send(true);

        let queue = Arc::clone(&self.queue);
        let routines = std::mem::take(&mut self.routines);
        let drained = tokio::time::timeout(self.shutdown_timeout, async move {
            {
                let mut rx = queue.lock().await;
                rx.close();
                while let Ok(task) = rx.try_recv() {
                    warn!(task_id = task.id, task_name = %task.name, "Abandoning queued task");
                }
            }
            futures::future::join_all(routines).await
        })
        .await;

        match drained {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Task thread failed: {}", e);
                    }
                }
            }
            Err(_) => warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Timed out waiting for task threads to close"
            ),
        }

        self.dispatcher.on_end_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskError;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Lifecycle {
        started: AtomicBool,
        ended: AtomicBool,
        heartbeats: AtomicUsize,
    }

    impl WorkerEventHandler for Lifecycle {
        fn on_start_worker(&self) {
            self.started.store(true, Ordering::SeqCst);
        }

        fn on_end_worker(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }

        fn on_thread_heartbeat(&self, _thread_id: usize) {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config() -> WorkerPoolConfig {
        WorkerPoolConfig::new()
            .with_worker_id("test-worker")
            .with_concurrency(2)
            .with_shutdown_timeout(Duration::from_millis(200))
            .with_heartbeat_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.concurrency >= 1);
        assert_eq!(config.accept_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.execution_timeout, None);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new()
            .with_worker_id("w1")
            .with_concurrency(0)
            .with_accept_timeout(Duration::from_secs(1))
            .with_execution_timeout(Duration::from_secs(60));

        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.accept_timeout, Duration::from_secs(1));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_serialization() {
        let config = test_config();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["heartbeat_interval"], 20);
        assert_eq!(json["execution_timeout"], serde_json::Value::Null);

        let parsed: WorkerPoolConfig =
            serde_json::from_str(r#"{"concurrency": 3, "execution_timeout": 1500}"#).unwrap();
        assert_eq!(parsed.concurrency, 3);
        assert_eq!(parsed.execution_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(parsed.shutdown_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let lifecycle = Arc::new(Lifecycle::default());
        let mut pool = WorkerPool::new(test_config(), Arc::new(TaskRegistry::new()));
        pool.set_event_handler(lifecycle.clone());

        assert_eq!(pool.status(), WorkerPoolStatus::Created);
        pool.start().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Running);
        assert!(matches!(pool.start().await, Err(WorkerPoolError::AlreadyRunning)));

        pool.stop().await;
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert!(lifecycle.started.load(Ordering::SeqCst));
        assert!(lifecycle.ended.load(Ordering::SeqCst));

        assert!(matches!(pool.start().await, Err(WorkerPoolError::AlreadyStopped)));
        assert!(pool.submitter().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_routines_heartbeat() {
        let lifecycle = Arc::new(Lifecycle::default());
        let mut pool = WorkerPool::new(test_config(), Arc::new(TaskRegistry::new()));
        pool.set_event_handler(lifecycle.clone());

        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        pool.stop().await;

        assert!(lifecycle.heartbeats.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_submit_blocks_when_full() {
        let pool = WorkerPool::new(test_config(), Arc::new(TaskRegistry::new()));

        // Not started: nothing drains the queue
        pool.submit(Task::new("a", "")).await.unwrap();
        pool.submit(Task::new("b", "")).await.unwrap();
        assert_eq!(pool.queued_tasks(), 2);

        let blocked =
            tokio::time::timeout(Duration::from_millis(30), pool.submit(Task::new("c", ""))).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_tasks_execute_concurrently() {
        let registry = Arc::new(TaskRegistry::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        {
            let running = running.clone();
            let peak = peak.clone();
            registry.register_fn("work", move |_task, _sink| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), TaskError>(())
                }
            });
        }

        let pool = WorkerPool::new(test_config(), registry);
        pool.start().await.unwrap();

        for id in 1..=4 {
            pool.submit(Task::new("work", "").with_id(id)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_bounded_by_shutdown_timeout() {
        let registry = Arc::new(TaskRegistry::new());
        registry.register_fn("stuck", |_task, _sink| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        let pool = WorkerPool::new(test_config(), registry);
        pool.start().await.unwrap();
        pool.submit(Task::new("stuck", "").with_id(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = tokio::time::Instant::now();
        pool.stop().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let pool = WorkerPool::new(test_config(), Arc::new(TaskRegistry::new()));
        pool.stop().await;

        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert!(pool.submitter().is_closed());
    }
}
