//! Consumer lifecycle and the reserve/acknowledge loop

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{ConsumerConfig, ConsumerError, ConsumerEventHandler, TaskPayloadHandler};
use crate::broker::{BrokerConnection, BrokerError, ReservedJob};
use crate::task::{PayloadError, Task, TaskEventKind, TaskProcessEvent};

/// Consumer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Created,
    Running,
    Stopped,
}

/// Reserves jobs from a broker and acknowledges them from outcome events
///
/// # Example
///
/// ```ignore
/// let mut consumer = Consumer::new(ConsumerConfig::default());
/// consumer.set_broker(broker);
/// consumer.set_payload_handler(connector);
///
/// consumer.start()?;
/// // ... later
/// consumer.stop().await;
/// ```
pub struct Consumer {
    config: ConsumerConfig,
    broker: BrokerOps,
    payload_handler: Option<Arc<dyn TaskPayloadHandler>>,
    events: Option<Arc<dyn ConsumerEventHandler>>,
    event_tx: mpsc::Sender<TaskProcessEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TaskProcessEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    status: RwLock<ConsumerStatus>,
}

impl Consumer {
    /// Create a consumer with no broker or payload handler attached
    pub fn new(config: ConsumerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            broker: BrokerOps::default(),
            payload_handler: None,
            events: None,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown_tx,
            handle: Mutex::new(None),
            status: RwLock::new(ConsumerStatus::Created),
        }
    }

    pub fn set_broker(&mut self, broker: Arc<dyn BrokerConnection>) {
        self.broker = BrokerOps { conn: Some(broker) };
    }

    pub fn with_broker(mut self, broker: Arc<dyn BrokerConnection>) -> Self {
        self.set_broker(broker);
        self
    }

    pub fn set_payload_handler(&mut self, handler: Arc<dyn TaskPayloadHandler>) {
        self.payload_handler = Some(handler);
    }

    pub fn set_event_handler(&mut self, handler: Arc<dyn ConsumerEventHandler>) {
        self.events = Some(handler);
    }

    /// Sender side of the outcome-event channel drained by the loop
    pub fn event_sender(&self) -> mpsc::Sender<TaskProcessEvent> {
        self.event_tx.clone()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn status(&self) -> ConsumerStatus {
        *self.status.read()
    }

    /// Spawn the consume loop; returns immediately
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), ConsumerError> {
        if !self.broker.is_configured() {
            return Err(ConsumerError::MissingHandler);
        }
        let intake = self
            .payload_handler
            .clone()
            .ok_or(ConsumerError::MissingPayloadHandler)?;

        let mut status = self.status.write();
        match *status {
            ConsumerStatus::Created => {}
            ConsumerStatus::Running => return Err(ConsumerError::AlreadyRunning),
            ConsumerStatus::Stopped => return Err(ConsumerError::AlreadyStopped),
        }
        let event_rx = self
            .event_rx
            .lock()
            .take()
            .ok_or(ConsumerError::AlreadyStopped)?;

        let consume = ConsumeLoop {
            config: self.config.clone(),
            broker: self.broker.clone(),
            intake,
            events: self.events.clone(),
            event_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        *self.handle.lock() = Some(tokio::spawn(consume.run()));
        *status = ConsumerStatus::Running;

        info!(
            reserve_timeout_ms = self.config.reserve_timeout.as_millis() as u64,
            event_buffer = self.config.event_buffer,
            "Consumer starting"
        );
        Ok(())
    }

    /// Stop the loop, wait for it to exit, then close the broker connection
    ///
    /// Close failures are logged, not returned.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        {
            let mut status = self.status.write();
            if *status == ConsumerStatus::Stopped {
                return;
            }
            *status = ConsumerStatus::Stopped;
        }

        info!("Consumer stopping");
        let _ = self.shutdown_tx.send(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Consume loop failed: {}", e);
            }
        }

        // Never started: the receiver is still ours to close
        let unused_rx = self.event_rx.lock().take();
        if let Some(mut rx) = unused_rx {
            rx.close();
        }

        if let Err(e) = self.broker.close().await {
            error!(error = %e, "Failed to close broker connection");
        }
        info!("Consumer stopped");
    }

    /// Reserve a job; an id of 0 means nothing was reserved
    pub async fn reserve(&self, timeout: Duration) -> Result<ReservedJob, BrokerError> {
        self.broker.reserve(timeout).await
    }

    pub async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError> {
        self.broker.release(id, priority, delay).await
    }

    pub async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        self.broker.delete(id).await
    }

    pub async fn bury(&self, id: u64, priority: u32) -> Result<(), BrokerError> {
        self.broker.bury(id, priority).await
    }

    pub async fn touch(&self, id: u64) -> Result<(), BrokerError> {
        self.broker.touch(id).await
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.broker.close().await
    }
}

/// Logged delegations to an optional broker connection
///
/// Every call is a no-op when no connection is configured.
#[derive(Clone, Default)]
struct BrokerOps {
    conn: Option<Arc<dyn BrokerConnection>>,
}

impl BrokerOps {
    fn is_configured(&self) -> bool {
        self.conn.is_some()
    }

    async fn reserve(&self, timeout: Duration) -> Result<ReservedJob, BrokerError> {
        let Some(conn) = &self.conn else {
            return Ok(ReservedJob {
                id: 0,
                body: Vec::new(),
            });
        };
        let job = conn.reserve(timeout).await?;
        debug!(job_id = job.id, bytes = job.body.len(), "Job reserved");
        Ok(job)
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError> {
        let Some(conn) = &self.conn else { return Ok(()) };
        debug!(job_id = id, priority, delay_ms = delay.as_millis() as u64, "Releasing job");
        conn.release(id, priority, delay).await
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        let Some(conn) = &self.conn else { return Ok(()) };
        debug!(job_id = id, "Deleting job");
        conn.delete(id).await
    }

    async fn bury(&self, id: u64, priority: u32) -> Result<(), BrokerError> {
        let Some(conn) = &self.conn else { return Ok(()) };
        debug!(job_id = id, priority, "Burying job");
        conn.bury(id, priority).await
    }

    async fn touch(&self, id: u64) -> Result<(), BrokerError> {
        let Some(conn) = &self.conn else { return Ok(()) };
        debug!(job_id = id, "Touching job");
        conn.touch(id).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(conn) = &self.conn else { return Ok(()) };
        debug!("Closing broker connection");
        conn.close().await
    }
}

/// State owned by the spawned consume routine
struct ConsumeLoop {
    config: ConsumerConfig,
    broker: BrokerOps,
    intake: Arc<dyn TaskPayloadHandler>,
    events: Option<Arc<dyn ConsumerEventHandler>>,
    event_rx: mpsc::Receiver<TaskProcessEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConsumeLoop {
    async fn run(mut self) {
        info!("Consumer started");
        if let Some(events) = &self.events {
            events.on_start_consume();
        }

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            // Reserve
            let reserved = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                reserved = self.broker.reserve(self.config.reserve_timeout) => reserved,
            };

            if let Some(task) = self.decode(reserved).await {
                if !self.hand_off(task, &mut shutdown_rx).await {
                    break;
                }
            }

            // Multiplex
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                event = self.event_rx.recv() => match event {
                    Some(event) => self.acknowledge(event).await,
                    None => break,
                },
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    debug!("Consumer heartbeat");
                    if let Some(events) = &self.events {
                        events.on_heartbeat();
                    }
                }
            }
        }

        self.event_rx.close();
        let mut dropped = 0usize;
        while self.event_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "Outcome events left unacknowledged at shutdown");
        }

        info!("Consumer ended");
        if let Some(events) = &self.events {
            events.on_end_consume();
        }
    }

    /// Hand a task to the intake, acknowledging outcome events meanwhile
    ///
    /// A saturated pool only frees a slot once its routines can report their
    /// outcomes, so the event channel keeps draining while the handoff waits.
    /// Returns false when shutdown interrupted the handoff.
    async fn hand_off(&mut self, task: Task, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let id = task.id;
        let intake = Arc::clone(&self.intake);
        let mut handoff = intake.handle_payload(task);

        loop {
            tokio::select! {
                biased;
                handed = &mut handoff => {
                    if let Err(e) = handed {
                        warn!(task_id = id, error = %e, "Handoff failed, releasing job");
                        self.release(id).await;
                    }
                    return true;
                }
                _ = shutdown_rx.changed() => {
                    info!(task_id = id, "Shutdown during handoff, releasing job");
                    self.release(id).await;
                    return false;
                }
                Some(event) = self.event_rx.recv() => self.acknowledge(event).await,
            }
        }
    }

    /// Turn a reservation result into a task ready for handoff
    async fn decode(&self, reserved: Result<ReservedJob, BrokerError>) -> Option<Task> {
        let job = match reserved {
            Ok(job) => job,
            Err(e) if e.is_timeout() => {
                debug!("Reserve timed out");
                if let Some(events) = &self.events {
                    events.on_reserve_timeout();
                }
                return None;
            }
            Err(e) => {
                error!(error = %e, "Reserve failed");
                return None;
            }
        };

        if job.id == 0 {
            return None;
        }

        match Task::from_wire(job.id, &job.body) {
            Ok(task) => {
                debug!(task_id = task.id, task_name = %task.name, "Task decoded");
                Some(task)
            }
            Err(e @ PayloadError::Empty(_)) => {
                // Left reserved; the job resurfaces when its lease expires
                warn!(job_id = job.id, error = %e, "Empty job body");
                None
            }
            Err(e) => {
                error!(job_id = job.id, error = %e, "Malformed job body, burying");
                if let Err(e) = self.broker.bury(job.id, self.config.bury_priority).await {
                    error!(job_id = job.id, error = %e, "Failed to bury job");
                }
                None
            }
        }
    }

    async fn acknowledge(&self, event: TaskProcessEvent) {
        let id = event.task.id;
        debug!(task_id = id, task_name = %event.task.name, event = %event.kind, "Task process event");

        let result = match event.kind {
            TaskEventKind::Error => self.broker.bury(id, self.config.bury_priority).await,
            TaskEventKind::Success => self.broker.delete(id).await,
            TaskEventKind::Heartbeat => self.broker.touch(id).await,
            TaskEventKind::Progress => Ok(()),
        };

        if let Err(e) = result {
            error!(task_id = id, event = %event.kind, error = %e, "Broker acknowledgment failed");
        }
    }

    async fn release(&self, id: u64) {
        let result = self
            .broker
            .release(id, self.config.release_priority, self.config.release_delay)
            .await;
        if let Err(e) = result {
            error!(job_id = id, error = %e, "Failed to release job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, JobState};
    use crate::consumer::HandoffError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Intake {
        tasks: parking_lot::Mutex<Vec<Task>>,
    }

    impl Intake {
        fn tasks(&self) -> Vec<Task> {
            self.tasks.lock().clone()
        }
    }

    #[async_trait]
    impl TaskPayloadHandler for Intake {
        async fn handle_payload(&self, task: Task) -> Result<(), HandoffError> {
            self.tasks.lock().push(task);
            Ok(())
        }
    }

    struct ClosedIntake;

    #[async_trait]
    impl TaskPayloadHandler for ClosedIntake {
        async fn handle_payload(&self, task: Task) -> Result<(), HandoffError> {
            Err(HandoffError::Closed(task.id))
        }
    }

    #[derive(Default)]
    struct Signals {
        reserve_timeouts: AtomicUsize,
        heartbeats: AtomicUsize,
        ended: AtomicUsize,
    }

    impl ConsumerEventHandler for Signals {
        fn on_end_consume(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }

        fn on_reserve_timeout(&self) {
            self.reserve_timeouts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_heartbeat(&self) {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig::new()
            .with_reserve_timeout(Duration::from_millis(20))
            .with_heartbeat_interval(Duration::from_millis(10))
            .with_release(4, Duration::ZERO)
            .with_bury_priority(9)
    }

    fn consumer(broker: &Arc<InMemoryBroker>, intake: Arc<dyn TaskPayloadHandler>) -> Consumer {
        let mut consumer = Consumer::new(fast_config()).with_broker(broker.clone());
        consumer.set_payload_handler(intake);
        consumer
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_start_requires_handlers() {
        let consumer = Consumer::new(ConsumerConfig::default());
        assert!(matches!(consumer.start(), Err(ConsumerError::MissingHandler)));

        let consumer = Consumer::new(ConsumerConfig::default())
            .with_broker(Arc::new(InMemoryBroker::new()));
        assert!(matches!(consumer.start(), Err(ConsumerError::MissingPayloadHandler)));
        assert_eq!(consumer.status(), ConsumerStatus::Created);
    }

    #[tokio::test]
    async fn test_delegations_without_broker_are_noops() {
        let consumer = Consumer::new(ConsumerConfig::default());

        let job = consumer.reserve(Duration::from_millis(1)).await.unwrap();
        assert_eq!(job.id, 0);
        consumer.release(1, 1, Duration::ZERO).await.unwrap();
        consumer.delete(1).await.unwrap();
        consumer.bury(1, 1).await.unwrap();
        consumer.touch(1).await.unwrap();
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_decodes_and_hands_off() {
        let broker = Arc::new(InMemoryBroker::new());
        let id = broker.put(br#"{"name":"echo","payload":{"n":1}}"#.to_vec(), 1);
        let intake = Arc::new(Intake::default());

        let consumer = consumer(&broker, intake.clone());
        consumer.start().unwrap();
        assert!(matches!(consumer.start(), Err(ConsumerError::AlreadyRunning)));
        settle().await;
        consumer.stop().await;

        let tasks = intake.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, id);
        assert_eq!(tasks[0].name, "echo");
        assert_eq!(tasks[0].payload_str(), Some(r#"{"n":1}"#));
        assert!(broker.is_closed());
        assert_eq!(consumer.status(), ConsumerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_events_drive_acknowledgments() {
        let broker = Arc::new(InMemoryBroker::new());
        let ok = broker.put(br#"{"name":"a"}"#.to_vec(), 1);
        let failed = broker.put(br#"{"name":"b"}"#.to_vec(), 1);
        let intake = Arc::new(Intake::default());

        let consumer = consumer(&broker, intake.clone());
        let events = consumer.event_sender();
        consumer.start().unwrap();
        settle().await;

        let tasks = intake.tasks();
        assert_eq!(tasks.len(), 2);
        let task = |id| Arc::new(tasks.iter().find(|t| t.id == id).cloned().unwrap());

        events.send(TaskProcessEvent::heartbeat(task(ok))).await.unwrap();
        events
            .send(TaskProcessEvent::progress(task(ok), serde_json::json!(50)))
            .await
            .unwrap();
        events.send(TaskProcessEvent::success(task(ok))).await.unwrap();
        events.send(TaskProcessEvent::error(task(failed))).await.unwrap();
        settle().await;

        let stats = broker.stats();
        assert_eq!(broker.deleted_ids(), vec![ok]);
        assert_eq!(broker.buried_ids(), vec![failed]);
        assert_eq!(stats.touch_calls, 1);
        assert_eq!(stats.release_calls, 0);

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_empty_body_left_for_lease_expiry() {
        let broker = Arc::new(InMemoryBroker::new());
        let id = broker.put(Vec::new(), 1);
        let intake = Arc::new(Intake::default());

        let consumer = consumer(&broker, intake.clone());
        consumer.start().unwrap();
        settle().await;

        assert!(intake.tasks().is_empty());
        assert_eq!(broker.job_state(id), Some(JobState::Reserved));
        let stats = broker.stats();
        assert_eq!(stats.delete_calls + stats.bury_calls + stats.release_calls, 0);

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_body_is_buried() {
        let broker = Arc::new(InMemoryBroker::new());
        let id = broker.put(b"not json".to_vec(), 1);
        let intake = Arc::new(Intake::default());

        let consumer = consumer(&broker, intake.clone());
        consumer.start().unwrap();
        settle().await;
        consumer.stop().await;

        assert!(intake.tasks().is_empty());
        assert_eq!(broker.buried_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_closed_pool_releases_job() {
        let broker = Arc::new(InMemoryBroker::new());
        let id = broker.put(br#"{"name":"echo"}"#.to_vec(), 1);

        let consumer = consumer(&broker, Arc::new(ClosedIntake));
        consumer.start().unwrap();
        settle().await;
        consumer.stop().await;

        assert!(broker.stats().release_calls >= 1);
        assert_ne!(broker.job_state(id), Some(JobState::Buried));
    }

    #[tokio::test]
    async fn test_idle_signals() {
        let broker = Arc::new(InMemoryBroker::new());
        let signals = Arc::new(Signals::default());

        let mut consumer = consumer(&broker, Arc::new(Intake::default()));
        consumer.set_event_handler(signals.clone());
        consumer.start().unwrap();
        settle().await;
        consumer.stop().await;

        assert!(signals.reserve_timeouts.load(Ordering::SeqCst) >= 1);
        assert!(signals.heartbeats.load(Ordering::SeqCst) >= 1);
        assert_eq!(signals.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_closes_broker() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = consumer(&broker, Arc::new(Intake::default()));

        consumer.stop().await;

        assert!(broker.is_closed());
        assert!(consumer.event_sender().is_closed());
        assert!(matches!(consumer.start(), Err(ConsumerError::AlreadyStopped)));
    }
}
