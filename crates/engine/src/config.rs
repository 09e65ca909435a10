//! Engine configuration
//!
//! Values come from, in increasing precedence: built-in defaults, a JSON file
//! ([`ServerConfig::from_file`]) and `TASKQUEUE_*` environment variables
//! ([`ServerConfig::apply_env`]). Durations are expressed in milliseconds in
//! both the file and the environment.
//!
//! ```text
//! {
//!   "worker":   { "concurrency": 8, "accept_timeout": 30000 },
//!   "consumer": { "reserve_timeout": 5000, "bury_priority": 1 }
//! }
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consumer::ConsumerConfig;
use crate::worker::WorkerPoolConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub worker: WorkerPoolConfig,
    pub consumer: ConsumerConfig,
}

impl ServerConfig {
    /// Load configuration from a JSON file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;

        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;

        debug!(path = %shown, "Loaded configuration file");
        Ok(config)
    }

    /// Load from defaults, an optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()
    }

    /// Override values from `TASKQUEUE_*` environment variables
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { var: &var };

        if let Some(id) = var("TASKQUEUE_WORKER_ID") {
            self.worker.worker_id = id;
        }
        if let Some(n) = env.parse::<usize>("TASKQUEUE_CONCURRENCY")? {
            self.worker.concurrency = n.max(1);
        }
        env.millis("TASKQUEUE_ACCEPT_TIMEOUT_MS", &mut self.worker.accept_timeout)?;
        env.millis("TASKQUEUE_SHUTDOWN_TIMEOUT_MS", &mut self.worker.shutdown_timeout)?;
        env.millis("TASKQUEUE_WORKER_HEARTBEAT_MS", &mut self.worker.heartbeat_interval)?;
        if let Some(ms) = env.parse::<u64>("TASKQUEUE_EXECUTION_TIMEOUT_MS")? {
            // 0 disables the deadline
            self.worker.execution_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        env.millis("TASKQUEUE_RESERVE_TIMEOUT_MS", &mut self.consumer.reserve_timeout)?;
        env.millis("TASKQUEUE_CONSUMER_HEARTBEAT_MS", &mut self.consumer.heartbeat_interval)?;
        env.millis("TASKQUEUE_RELEASE_DELAY_MS", &mut self.consumer.release_delay)?;
        if let Some(p) = env.parse("TASKQUEUE_RELEASE_PRIORITY")? {
            self.consumer.release_priority = p;
        }
        if let Some(p) = env.parse("TASKQUEUE_BURY_PRIORITY")? {
            self.consumer.bury_priority = p;
        }
        if let Some(n) = env.parse::<usize>("TASKQUEUE_EVENT_BUFFER")? {
            self.consumer.event_buffer = n.max(1);
        }

        Ok(self)
    }

    /// Default configuration as pretty-printed JSON
    pub fn default_json() -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&Self::default())?)
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    var: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match (self.var)(key) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                }),
        }
    }

    fn millis(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.parse::<u64>(key)? {
            *target = Duration::from_millis(ms);
        }
        Ok(())
    }
}

/// Serde helpers for `Duration` as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helpers for `Option<Duration>` as milliseconds or `null`
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
