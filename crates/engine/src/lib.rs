//! # Task Queue Engine
//!
//! Reserves jobs from a message broker, executes them on a bounded pool of
//! routines and acknowledges each job from its outcome.
//!
//! ## Features
//!
//! - **Name-based dispatch**: a fresh handler instance per task, resolved from a [`TaskRegistry`]
//! - **Bounded concurrency**: a fixed-size [`WorkerPool`] whose full queue pushes back on reservation
//! - **Lease management**: success deletes, failure buries, heartbeats touch the broker job
//! - **Graceful shutdown**: bounded drain of in-flight work
//!
//! ## Architecture
//!
//! ```text
//!  broker ──reserve──▶ Consumer ──handoff──▶ Connector ──submit──▶ WorkerPool
//!    ▲                    │                      ▲                     │
//!    └──delete/bury/touch─┘◀────outcome events───┴─────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskqueue_engine::prelude::*;
//!
//! let registry = Arc::new(TaskRegistry::new());
//! registry.register_fn("echo", |task, sink| async move {
//!     sink.progress(serde_json::json!({ "echo": task.payload_str() })).await;
//!     Ok(())
//! });
//!
//! let server = Server::new(ServerConfig::load(None)?, registry, broker);
//! server.start().await?;
//! tokio::signal::ctrl_c().await?;
//! server.stop().await;
//! ```

pub mod broker;
pub mod config;
pub mod connector;
pub mod consumer;
pub mod registry;
pub mod server;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{BrokerConnection, BrokerError, InMemoryBroker, ReservedJob};
    pub use crate::config::{ConfigError, ServerConfig};
    pub use crate::connector::Connector;
    pub use crate::consumer::{Consumer, ConsumerConfig, ConsumerError, TaskPayloadHandler};
    pub use crate::registry::{RegistryError, TaskRegistry};
    pub use crate::server::{Server, ServerError};
    pub use crate::task::{
        BaseTaskHandler, Task, TaskError, TaskEventHandler, TaskEventSink, TaskHandler,
        TaskProcessEvent,
    };
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use broker::{BrokerConnection, BrokerError, InMemoryBroker};
pub use config::{ConfigError, ServerConfig};
pub use connector::Connector;
pub use consumer::{Consumer, ConsumerConfig, ConsumerError, HandoffError};
pub use registry::{RegistryError, TaskRegistry};
pub use server::{Server, ServerError};
pub use task::{PayloadError, Task, TaskError, TaskEventKind, TaskProcessEvent};
pub use worker::{SubmitError, WorkerPool, WorkerPoolConfig, WorkerPoolError};
