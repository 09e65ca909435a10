// Logging setup
//
// Configure via environment variables:
// - RUST_LOG or LOG_LEVEL: log filter (default: "info")
// - LOG_FORMAT: "json" for one JSON object per line, anything else for text

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for log output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Log filter (e.g., "info", "debug", "taskqueue_engine=debug")
    pub log_filter: Option<String>,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            log_filter: var("RUST_LOG").or_else(|| var("LOG_LEVEL")),
            json: var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global tracing subscriber
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = config.filter();

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).init();
}
