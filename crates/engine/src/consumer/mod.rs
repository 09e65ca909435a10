//! Broker consumer loop
//!
//! A single routine that reserves jobs, decodes them into tasks, hands them
//! to a [`TaskPayloadHandler`] and turns outcome events into broker
//! acknowledgments:
//!
//! | Event       | Broker action                 |
//! |-------------|-------------------------------|
//! | `Success`   | `delete(id)`                  |
//! | `Error`     | `bury(id, bury_priority)`     |
//! | `Heartbeat` | `touch(id)`                   |
//! | `Progress`  | none                          |
//!
//! Reservation and event draining alternate strictly, one event per
//! iteration, so acknowledgment latency is bounded by `reserve_timeout`.

mod runner;

pub use runner::{Consumer, ConsumerStatus};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;
use crate::task::Task;

/// Consumer loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// How long a single reserve call waits for a ready job
    #[serde(with = "duration_millis")]
    pub reserve_timeout: Duration,

    /// Idle time after which the loop reports a heartbeat
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Priority used when a job has to be released
    pub release_priority: u32,

    /// Delay used when a job has to be released
    #[serde(with = "duration_millis")]
    pub release_delay: Duration,

    /// Priority used when a job is buried
    pub bury_priority: u32,

    /// Outcome events buffered before workers block on delivery
    pub event_buffer: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            reserve_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            release_priority: 1,
            release_delay: Duration::from_secs(5),
            bury_priority: 1,
            event_buffer: 1,
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_release(mut self, priority: u32, delay: Duration) -> Self {
        self.release_priority = priority;
        self.release_delay = delay;
        self
    }

    pub fn with_bury_priority(mut self, priority: u32) -> Self {
        self.bury_priority = priority;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }
}

/// Consumer errors returned from lifecycle calls
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("no broker connection configured")]
    MissingHandler,

    #[error("no payload handler configured")]
    MissingPayloadHandler,

    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("consumer has been stopped")]
    AlreadyStopped,
}

/// Failure to hand a decoded task over for execution
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// The worker pool no longer accepts tasks
    #[error("task {0} not handed off, worker pool is closed")]
    Closed(u64),
}

/// Intake for decoded tasks
///
/// May block until the task is accepted; the consumer loop does not reserve
/// another job until this returns.
#[async_trait]
pub trait TaskPayloadHandler: Send + Sync {
    async fn handle_payload(&self, task: Task) -> Result<(), HandoffError>;
}

/// Observer of consumer lifecycle signals; every method defaults to a no-op
pub trait ConsumerEventHandler: Send + Sync {
    fn on_start_consume(&self) {}

    fn on_end_consume(&self) {}

    /// No job became ready within `reserve_timeout`
    fn on_reserve_timeout(&self) {}

    /// No outcome event arrived within `heartbeat_interval`
    fn on_heartbeat(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConsumerConfig::default();
        assert_eq!(config.reserve_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.release_priority, 1);
        assert_eq!(config.release_delay, Duration::from_secs(5));
        assert_eq!(config.bury_priority, 1);
        assert_eq!(config.event_buffer, 1);
    }

    #[test]
    fn test_config_builder() {
        let config = ConsumerConfig::new()
            .with_reserve_timeout(Duration::from_millis(50))
            .with_release(3, Duration::from_secs(1))
            .with_bury_priority(7)
            .with_event_buffer(0);

        assert_eq!(config.reserve_timeout, Duration::from_millis(50));
        assert_eq!(config.release_priority, 3);
        assert_eq!(config.release_delay, Duration::from_secs(1));
        assert_eq!(config.bury_priority, 7);
        assert_eq!(config.event_buffer, 1);
    }

    #[test]
    fn test_config_serialization() {
        let json = serde_json::to_value(ConsumerConfig::default()).unwrap();
        assert_eq!(json["reserve_timeout"], 5000);
        assert_eq!(json["release_delay"], 5000);
        assert_eq!(json["event_buffer"], 1);
    }
}
