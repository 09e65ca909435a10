//! Bounded-concurrency worker pool
//!
//! - [`WorkerPool`] - fixed set of execution routines plus a shutdown supervisor
//! - [`TaskSubmitter`] - cloneable handle onto the bounded submission queue
//! - [`WorkerEventHandler`] - optional observer of pool lifecycle signals
//!
//! Submission blocks while the queue is full; that is the backpressure the
//! consumer loop feels through the connector.

mod dispatch;
mod pool;
mod queue;

pub use dispatch::WorkerEventHandler;
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use queue::{SubmitError, TaskSubmitter};
