//! Bounded submission queue handle

use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::debug;

use crate::task::Task;

/// Errors submitting a task to the worker pool
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The queue stayed full for the whole accept timeout
    #[error("task {} not accepted within {timeout:?}, worker pool saturated", .task.id)]
    Timeout { task: Task, timeout: Duration },

    /// The queue is full right now
    #[error("task {} rejected, worker pool queue is full", .0.id)]
    Full(Task),

    /// The worker pool has stopped
    #[error("task {} rejected, worker pool queue is closed", .0.id)]
    Closed(Task),
}

impl SubmitError {
    /// Take back the task that was not accepted
    pub fn into_task(self) -> Task {
        match self {
            Self::Timeout { task, .. } | Self::Full(task) | Self::Closed(task) => task,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Cloneable handle for submitting tasks to a [`WorkerPool`](super::WorkerPool)
///
/// The queue holds at most `concurrency` tasks; senders wait while it is
/// full, which is how a saturated pool pushes back on the consumer.
#[derive(Debug, Clone)]
pub struct TaskSubmitter {
    tx: mpsc::Sender<Task>,
    accept_timeout: Duration,
}

impl TaskSubmitter {
    pub(crate) fn new(tx: mpsc::Sender<Task>, accept_timeout: Duration) -> Self {
        Self { tx, accept_timeout }
    }

    /// Enqueue a task, waiting as long as the queue is full
    pub async fn submit(&self, task: Task) -> Result<(), SubmitError> {
        self.tx
            .send(task)
            .await
            .map_err(|err| SubmitError::Closed(err.0))?;
        debug!("Task queued");
        Ok(())
    }

    /// Enqueue a task, waiting at most the configured accept timeout
    pub async fn submit_timeout(&self, task: Task) -> Result<(), SubmitError> {
        match self.tx.send_timeout(task, self.accept_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(task)) => Err(SubmitError::Timeout {
                task,
                timeout: self.accept_timeout,
            }),
            Err(SendTimeoutError::Closed(task)) => Err(SubmitError::Closed(task)),
        }
    }

    /// Enqueue a task only if there is room right now
    pub fn try_submit(&self, task: Task) -> Result<(), SubmitError> {
        self.tx.try_send(task).map_err(|err| match err {
            TrySendError::Full(task) => SubmitError::Full(task),
            TrySendError::Closed(task) => SubmitError::Closed(task),
        })
    }

    /// How long [`submit_timeout`](Self::submit_timeout) waits
    pub fn accept_timeout(&self) -> Duration {
        self.accept_timeout
    }

    /// Number of tasks waiting for a free routine
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether the pool has closed its queue
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
