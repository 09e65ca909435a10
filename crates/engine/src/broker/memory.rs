//! In-memory implementation of BrokerConnection for testing and local runs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{BrokerConnection, BrokerError, ReservedJob};

/// Default time-to-run for jobs put without an explicit lease
const DEFAULT_TTR: Duration = Duration::from_secs(60);

/// Lifecycle state of a job held by the in-memory broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its release delay to elapse
    Delayed,
    /// Available for reservation
    Ready,
    /// Leased to a consumer
    Reserved,
    /// Failed and parked
    Buried,
}

struct Job {
    body: Vec<u8>,
    priority: u32,
    ttr: Duration,
    state: JobState,
    ready_at: Instant,
    lease_until: Option<Instant>,
}

/// Snapshot of broker contents and call counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub ready: usize,
    pub delayed: usize,
    pub reserved: usize,
    pub buried: usize,
    pub deleted: usize,

    pub reserve_calls: usize,
    pub release_calls: usize,
    pub delete_calls: usize,
    pub bury_calls: usize,
    pub touch_calls: usize,
}

#[derive(Default)]
struct CallCounters {
    reserve: AtomicUsize,
    release: AtomicUsize,
    delete: AtomicUsize,
    bury: AtomicUsize,
    touch: AtomicUsize,
}

/// In-memory broker
///
/// Provides beanstalkd-like semantics: lower priority values are reserved
/// first, reserved jobs return to the ready queue when their lease (TTR)
/// expires, and released jobs may be delayed. Every lease operation is
/// counted and deleted/buried ids are recorded in order, which makes it a
/// convenient test double for the consumer loop.
///
/// # Example
///
/// ```
/// use taskqueue_engine::broker::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// let id = broker.put(br#"{"name":"echo","payload":{}}"#.to_vec(), 1);
/// assert_eq!(broker.stats().ready, 1);
/// # let _ = id;
/// ```
pub struct InMemoryBroker {
    jobs: Mutex<BTreeMap<u64, Job>>,
    next_id: AtomicU64,
    ready: Notify,
    closed: AtomicBool,
    calls: CallCounters,
    deleted: Mutex<Vec<u64>>,
    buried: Mutex<Vec<u64>>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            calls: CallCounters::default(),
            deleted: Mutex::new(Vec::new()),
            buried: Mutex::new(Vec::new()),
        }
    }

    /// Put a ready job with the default lease
    pub fn put(&self, body: Vec<u8>, priority: u32) -> u64 {
        self.put_with(body, priority, Duration::ZERO, DEFAULT_TTR)
    }

    /// Put a job with an explicit delay and lease (time-to-run)
    pub fn put_with(&self, body: Vec<u8>, priority: u32, delay: Duration, ttr: Duration) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = if delay.is_zero() {
            JobState::Ready
        } else {
            JobState::Delayed
        };

        self.jobs.lock().insert(
            id,
            Job {
                body,
                priority,
                ttr,
                state,
                ready_at: Instant::now() + delay,
                lease_until: None,
            },
        );
        debug!(job_id = id, priority, ?delay, "Job put");

        self.ready.notify_one();
        id
    }

    /// State of a job, `None` once deleted
    pub fn job_state(&self, id: u64) -> Option<JobState> {
        let mut jobs = self.jobs.lock();
        Self::promote(&mut jobs, Instant::now());
        jobs.get(&id).map(|job| job.state)
    }

    /// Ids of deleted jobs, in deletion order
    pub fn deleted_ids(&self) -> Vec<u64> {
        self.deleted.lock().clone()
    }

    /// Ids of buried jobs, in burial order
    pub fn buried_ids(&self) -> Vec<u64> {
        self.buried.lock().clone()
    }

    /// Whether no job is ready, delayed or reserved
    pub fn is_drained(&self) -> bool {
        let stats = self.stats();
        stats.ready + stats.delayed + stats.reserved == 0
    }

    /// Whether [`close`](BrokerConnection::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of job states and call counters
    pub fn stats(&self) -> BrokerStats {
        let mut jobs = self.jobs.lock();
        Self::promote(&mut jobs, Instant::now());

        let count = |state| jobs.values().filter(|job| job.state == state).count();

        BrokerStats {
            ready: count(JobState::Ready),
            delayed: count(JobState::Delayed),
            reserved: count(JobState::Reserved),
            buried: count(JobState::Buried),
            deleted: self.deleted.lock().len(),
            reserve_calls: self.calls.reserve.load(Ordering::Relaxed),
            release_calls: self.calls.release.load(Ordering::Relaxed),
            delete_calls: self.calls.delete.load(Ordering::Relaxed),
            bury_calls: self.calls.bury.load(Ordering::Relaxed),
            touch_calls: self.calls.touch.load(Ordering::Relaxed),
        }
    }

    /// Move delayed jobs whose delay elapsed and expired leases back to ready
    fn promote(jobs: &mut BTreeMap<u64, Job>, now: Instant) {
        for (id, job) in jobs.iter_mut() {
            match job.state {
                JobState::Delayed if job.ready_at <= now => job.state = JobState::Ready,
                JobState::Reserved if job.lease_until.is_some_and(|until| until <= now) => {
                    trace!(job_id = *id, "Lease expired, job ready again");
                    job.state = JobState::Ready;
                    job.lease_until = None;
                }
                _ => {}
            }
        }
    }

    /// Reserve the most urgent ready job, or report when to look again
    fn try_reserve(&self, now: Instant) -> Result<ReservedJob, Option<Instant>> {
        let mut jobs = self.jobs.lock();
        Self::promote(&mut jobs, now);

        let next = jobs
            .iter()
            .filter(|(_, job)| job.state == JobState::Ready)
            .min_by_key(|(id, job)| (job.priority, **id))
            .map(|(id, _)| *id);

        if let Some(id) = next {
            if let Some(job) = jobs.get_mut(&id) {
                job.state = JobState::Reserved;
                job.lease_until = Some(now + job.ttr);
                return Ok(ReservedJob {
                    id,
                    body: job.body.clone(),
                });
            }
        }

        let wake_at = jobs
            .values()
            .filter_map(|job| match job.state {
                JobState::Delayed => Some(job.ready_at),
                JobState::Reserved => job.lease_until,
                _ => None,
            })
            .min();

        Err(wake_at)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn with_reserved<F>(&self, id: u64, f: F) -> Result<(), BrokerError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Reserved => {
                f(job);
                Ok(())
            }
            _ => Err(BrokerError::NotFound(id)),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn reserve(&self, timeout: Duration) -> Result<ReservedJob, BrokerError> {
        self.calls.reserve.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_open()?;

            let now = Instant::now();
            let wake_at = match self.try_reserve(now) {
                Ok(job) => {
                    debug!(job_id = job.id, "Job reserved");
                    return Ok(job);
                }
                Err(wake_at) => wake_at,
            };

            if now >= deadline {
                return Err(BrokerError::Timeout);
            }

            let wake_at = wake_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.ready.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError> {
        self.calls.release.fetch_add(1, Ordering::Relaxed);
        self.ensure_open()?;

        self.with_reserved(id, |job| {
            job.priority = priority;
            job.lease_until = None;
            job.ready_at = Instant::now() + delay;
            job.state = if delay.is_zero() {
                JobState::Ready
            } else {
                JobState::Delayed
            };
        })?;

        self.ready.notify_one();
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        self.calls.delete.fetch_add(1, Ordering::Relaxed);
        self.ensure_open()?;

        self.jobs
            .lock()
            .remove(&id)
            .ok_or(BrokerError::NotFound(id))?;
        self.deleted.lock().push(id);
        Ok(())
    }

    async fn bury(&self, id: u64, priority: u32) -> Result<(), BrokerError> {
        self.calls.bury.fetch_add(1, Ordering::Relaxed);
        self.ensure_open()?;

        self.with_reserved(id, |job| {
            job.priority = priority;
            job.lease_until = None;
            job.state = JobState::Buried;
        })?;
        self.buried.lock().push(id);
        Ok(())
    }

    async fn touch(&self, id: u64) -> Result<(), BrokerError> {
        self.calls.touch.fetch_add(1, Ordering::Relaxed);
        self.ensure_open()?;

        let now = Instant::now();
        self.with_reserved(id, |job| job.lease_until = Some(now + job.ttr))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_put_and_reserve() {
        let broker = InMemoryBroker::new();
        let id = broker.put(b"job".to_vec(), 1);

        let job = broker.reserve(SHORT).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.body, b"job".to_vec());
        assert_eq!(broker.job_state(id), Some(JobState::Reserved));
    }

    #[tokio::test]
    async fn test_reserve_timeout() {
        let broker = InMemoryBroker::new();
        let result = broker.reserve(SHORT).await;

        assert_eq!(result, Err(BrokerError::Timeout));
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(broker.stats().reserve_calls, 1);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let broker = InMemoryBroker::new();
        let low = broker.put(b"low".to_vec(), 10);
        let high = broker.put(b"high".to_vec(), 1);

        assert_eq!(broker.reserve(SHORT).await.unwrap().id, high);
        assert_eq!(broker.reserve(SHORT).await.unwrap().id, low);
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_put() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let producer = broker.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.put(b"late".to_vec(), 1);
        });

        let job = broker.reserve(Duration::from_secs(2)).await.unwrap();
        assert_eq!(job.body, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_delete_and_bury() {
        let broker = InMemoryBroker::new();
        let a = broker.put(b"a".to_vec(), 1);
        let b = broker.put(b"b".to_vec(), 1);

        broker.reserve(SHORT).await.unwrap();
        broker.reserve(SHORT).await.unwrap();

        broker.delete(a).await.unwrap();
        broker.bury(b, 5).await.unwrap();

        assert_eq!(broker.job_state(a), None);
        assert_eq!(broker.job_state(b), Some(JobState::Buried));
        assert_eq!(broker.deleted_ids(), vec![a]);
        assert_eq!(broker.buried_ids(), vec![b]);
        assert!(broker.is_drained());

        assert_eq!(broker.delete(a).await, Err(BrokerError::NotFound(a)));
    }

    #[tokio::test]
    async fn test_bury_requires_reservation() {
        let broker = InMemoryBroker::new();
        let id = broker.put(b"a".to_vec(), 1);

        assert_eq!(broker.bury(id, 1).await, Err(BrokerError::NotFound(id)));
        assert_eq!(broker.touch(id).await, Err(BrokerError::NotFound(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_delay() {
        let broker = InMemoryBroker::new();
        let id = broker.put(b"a".to_vec(), 1);
        broker.reserve(SHORT).await.unwrap();

        broker.release(id, 2, Duration::from_millis(30)).await.unwrap();
        assert_eq!(broker.job_state(id), Some(JobState::Delayed));
        assert_eq!(broker.reserve(Duration::from_millis(1)).await, Err(BrokerError::Timeout));

        let job = broker.reserve(Duration::from_secs(1)).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(broker.stats().release_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_and_touch() {
        let broker = InMemoryBroker::new();
        let id = broker.put_with(b"a".to_vec(), 1, Duration::ZERO, Duration::from_millis(100));

        broker.reserve(SHORT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        broker.touch(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.job_state(id), Some(JobState::Reserved));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(broker.job_state(id), Some(JobState::Ready));
        assert_eq!(broker.stats().touch_calls, 1);
    }

    #[tokio::test]
    async fn test_closed_broker() {
        let broker = InMemoryBroker::new();
        broker.put(b"a".to_vec(), 1);
        broker.close().await.unwrap();

        assert!(broker.is_closed());
        assert_eq!(broker.reserve(SHORT).await, Err(BrokerError::Closed));
    }
}
