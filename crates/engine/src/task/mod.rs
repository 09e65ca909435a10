//! Task model
//!
//! A [`Task`] is a unit of work reserved from the broker. This module provides:
//! - [`Task`] - identifier, handler name and opaque payload
//! - [`TaskHandler`] - the per-task execution capability resolved by name
//! - [`TaskProcessEvent`] - outcome events flowing back to the consumer
//!
//! # Wire format
//!
//! Jobs on the broker carry a JSON body:
//!
//! ```text
//! { "name": "resize_image", "payload": { "width": 640 } }
//! ```
//!
//! A payload that is valid JSON text is embedded verbatim. Any other bytes
//! are carried as a base64 string with `"encoding": "base64"`:
//!
//! ```text
//! { "name": "checksum", "payload": "AP8Q", "encoding": "base64" }
//! ```
//!
//! The task id is not part of the body; it is assigned by the broker at
//! reservation time.

mod event;
mod handler;

pub use event::{TaskEventHandler, TaskEventKind, TaskEventSink, TaskProcessEvent};
pub use handler::{BaseTaskHandler, TaskHandler, TaskHandlerFactory, TaskHandlerFuture};

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::registry::RegistryError;

/// A unit of work reserved from the broker
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Task {
    /// Broker-assigned job identifier (0 until reserved)
    pub id: u64,

    /// Name selecting the registered handler
    pub name: String,

    /// Job-specific encoded arguments (opaque bytes, usually JSON text)
    pub payload: Vec<u8>,
}

const BASE64_ENCODING: &str = "base64";

#[derive(Serialize)]
struct WireTaskRef<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<&'static str>,
}

#[derive(Deserialize)]
struct WireTask {
    name: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
    #[serde(default)]
    encoding: Option<String>,
}

impl Task {
    /// Create an unreserved task
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            payload: payload.into(),
        }
    }

    /// Set the broker-assigned identifier
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Decode a reserved job body into a task
    ///
    /// An empty body is rejected; a missing or `null` payload field yields an
    /// empty payload.
    pub fn from_wire(id: u64, body: &[u8]) -> Result<Self, PayloadError> {
        if body.is_empty() {
            return Err(PayloadError::Empty(id));
        }

        let invalid = |source| PayloadError::Invalid { id, source };
        let wire: WireTask = serde_json::from_slice(body).map_err(invalid)?;

        let payload = match (wire.payload, wire.encoding.as_deref()) {
            (None, _) => Vec::new(),
            (Some(raw), None) => raw.get().as_bytes().to_vec(),
            (Some(raw), Some(BASE64_ENCODING)) => {
                let text: String = serde_json::from_str(raw.get()).map_err(invalid)?;
                BASE64.decode(text).map_err(|e| PayloadError::Encoding {
                    id,
                    message: e.to_string(),
                })?
            }
            (Some(_), Some(other)) => {
                return Err(PayloadError::Encoding {
                    id,
                    message: format!("unsupported encoding {other:?}"),
                })
            }
        };

        Ok(Self {
            id,
            name: wire.name,
            payload,
        })
    }

    /// Encode the task into a job body (the id is not included)
    ///
    /// Payloads that are not exactly one JSON value are base64-encoded, so
    /// any byte sequence survives the round trip.
    pub fn to_wire(&self) -> Result<Vec<u8>, PayloadError> {
        let invalid = |source| PayloadError::Invalid {
            id: self.id,
            source,
        };

        let (payload, encoding) = if self.payload.is_empty() {
            (None, None)
        } else {
            match serde_json::from_slice::<&RawValue>(&self.payload) {
                Ok(raw) if raw.get().as_bytes() == self.payload.as_slice() => {
                    (Some(raw.to_owned()), None)
                }
                _ => {
                    let text = serde_json::to_string(&BASE64.encode(&self.payload))
                        .map_err(invalid)?;
                    let raw = RawValue::from_string(text).map_err(invalid)?;
                    (Some(raw), Some(BASE64_ENCODING))
                }
            }
        };

        serde_json::to_vec(&WireTaskRef {
            name: &self.name,
            payload,
            encoding,
        })
        .map_err(invalid)
    }

    /// Decode the payload into a handler-specific type
    ///
    /// An empty payload decodes as JSON `null`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        let bytes: &[u8] = if self.payload.is_empty() {
            b"null"
        } else {
            &self.payload
        };

        serde_json::from_slice(bytes).map_err(|e| TaskError::InvalidPayload {
            id: self.id,
            name: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Errors decoding a reserved job body
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The reserved job had no body
    #[error("task {0} payload empty")]
    Empty(u64),

    /// The body is not a valid task document
    #[error("invalid task {id} JSON format: {source}")]
    Invalid {
        id: u64,
        #[source]
        source: serde_json::Error,
    },

    /// The payload encoding is unknown or its content does not decode
    #[error("invalid task {id} payload encoding: {message}")]
    Encoding { id: u64, message: String },
}

/// Reasons a task failed to execute
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// No handler registered under the task's name
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// The payload does not match what the handler expects
    #[error("invalid payload for task {id} ({name}): {message}")]
    InvalidPayload {
        id: u64,
        name: String,
        message: String,
    },

    /// The handler ran past the configured execution timeout
    #[error("task execution timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked
    #[error("task handler panicked: {0}")]
    Panicked(String),

    /// The handler reported a failure
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Create a handler failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

impl From<RegistryError> for TaskError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownTaskType(name) => Self::UnknownTaskType(name),
        }
    }
}
