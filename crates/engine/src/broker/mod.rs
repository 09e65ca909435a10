//! Broker connection abstraction
//!
//! The engine never speaks a broker wire protocol itself. A broker client
//! (beanstalkd, a cloud queue, ...) plugs in by implementing
//! [`BrokerConnection`]; the consumer loop is its only caller.
//!
//! - [`BrokerConnection`] - lease operations on reserved jobs
//! - [`InMemoryBroker`] - process-local broker for tests and local runs

mod memory;

pub use memory::{BrokerStats, InMemoryBroker, JobState};

use std::time::Duration;

use async_trait::async_trait;

/// A job reserved from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    /// Broker-assigned identifier (0 means nothing was reserved)
    pub id: u64,
    /// Raw job body
    pub body: Vec<u8>,
}

/// Broker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// No job became ready within the reserve timeout
    #[error("timeout")]
    Timeout,

    /// The job id is not known or not reserved by this connection
    #[error("job {0} not found")]
    NotFound(u64),

    /// The connection has been closed
    #[error("connection closed")]
    Closed,

    /// Any other broker failure
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether this is a reserve timeout (expected when the queue is idle)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Lease operations the consumer loop needs from a broker
///
/// Priorities follow broker convention: lower values are more urgent.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Reserve the next ready job, waiting up to `timeout`
    ///
    /// Returns [`BrokerError::Timeout`] if nothing became ready.
    async fn reserve(&self, timeout: Duration) -> Result<ReservedJob, BrokerError>;

    /// Return a reserved job to the ready queue after `delay`
    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError>;

    /// Permanently remove a job
    async fn delete(&self, id: u64) -> Result<(), BrokerError>;

    /// Mark a reserved job as failed
    async fn bury(&self, id: u64, priority: u32) -> Result<(), BrokerError>;

    /// Extend the lease of a reserved job
    async fn touch(&self, id: u64) -> Result<(), BrokerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), BrokerError>;
}
