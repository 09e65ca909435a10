//! Engine wiring
//!
//! A [`Server`] owns one worker pool and one consumer joined by a
//! [`Connector`]. The pool starts first so the consumer never reserves a job
//! nobody can run; on shutdown the consumer stops first so no new jobs are
//! reserved while the pool drains.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::broker::BrokerConnection;
use crate::config::ServerConfig;
use crate::connector::Connector;
use crate::consumer::{Consumer, ConsumerError, ConsumerEventHandler};
use crate::registry::TaskRegistry;
use crate::worker::{WorkerEventHandler, WorkerPool, WorkerPoolError};

/// Errors starting the server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("worker pool: {0}")]
    Worker(#[from] WorkerPoolError),

    #[error("consumer: {0}")]
    Consumer(#[from] ConsumerError),
}

/// Worker pool and consumer wired together over one broker connection
pub struct Server {
    registry: Arc<TaskRegistry>,
    pool: WorkerPool,
    consumer: Consumer,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn BrokerConnection>,
    ) -> Self {
        let mut pool = WorkerPool::new(config.worker, Arc::clone(&registry));
        let mut consumer = Consumer::new(config.consumer).with_broker(broker);

        let connector = Arc::new(Connector::new(pool.submitter(), consumer.event_sender()));
        pool.set_task_event_handler(connector.clone());
        consumer.set_payload_handler(connector);

        Self {
            registry,
            pool,
            consumer,
        }
    }

    /// Attach an observer of pool lifecycle signals
    pub fn set_worker_event_handler(&mut self, handler: Arc<dyn WorkerEventHandler>) {
        self.pool.set_event_handler(handler);
    }

    /// Attach an observer of consumer lifecycle signals
    pub fn set_consumer_event_handler(&mut self, handler: Arc<dyn ConsumerEventHandler>) {
        self.consumer.set_event_handler(handler);
    }

    /// Start the worker pool, then the consumer
    #[instrument(skip(self), fields(worker_id = %self.pool.worker_id()))]
    pub async fn start(&self) -> Result<(), ServerError> {
        self.pool.start().await?;

        if let Err(e) = self.consumer.start() {
            error!(error = %e, "Consumer failed to start");
            self.pool.stop().await;
            return Err(e.into());
        }

        info!(tasks = ?self.registry.registered_tasks(), "Server started");
        Ok(())
    }

    /// Stop the consumer, then the worker pool
    #[instrument(skip(self), fields(worker_id = %self.pool.worker_id()))]
    pub async fn stop(&self) {
        self.consumer.stop().await;
        self.pool.stop().await;
        info!("Server stopped");
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::consumer::ConsumerStatus;
    use crate::worker::WorkerPoolStatus;

    #[tokio::test]
    async fn test_start_and_stop_order() {
        let broker = Arc::new(InMemoryBroker::new());
        let server = Server::new(
            ServerConfig::default(),
            Arc::new(TaskRegistry::new()),
            broker.clone(),
        );

        server.start().await.unwrap();
        assert_eq!(server.pool().status(), WorkerPoolStatus::Running);
        assert_eq!(server.consumer().status(), ConsumerStatus::Running);

        server.stop().await;
        assert_eq!(server.pool().status(), WorkerPoolStatus::Stopped);
        assert_eq!(server.consumer().status(), ConsumerStatus::Stopped);
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn test_second_start_fails() {
        let server = Server::new(
            ServerConfig::default(),
            Arc::new(TaskRegistry::new()),
            Arc::new(InMemoryBroker::new()),
        );

        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::Worker(WorkerPoolError::AlreadyRunning))
        ));
        server.stop().await;
    }
}
