//! Logging setup for embedders.
//!
//! This crate is a library embedded once per tab, so nothing installs a
//! subscriber implicitly. The host picks the output shape: compact lines
//! for an attached console, JSON events for a log collector.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directive; falls back to `RUST_LOG`, then to info-level
    /// output for this crate only.
    #[serde(default)]
    pub filter: Option<String>,
}

impl TelemetryConfig {
    /// Read `AWT_LOG_FORMAT` ("json" or "compact") and `RUST_LOG`.
    pub fn from_env() -> Self {
        let format = match std::env::var("AWT_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        Self {
            format,
            filter: std::env::var("RUST_LOG").ok(),
        }
    }
}

/// Install the global subscriber. A second core in the same process keeps
/// the first subscriber; the error is discarded on purpose.
pub fn init(config: &TelemetryConfig) {
    let filter = config
        .filter
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "awt_core=info".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_level(true);

    match config.format {
        LogFormat::Json => {
            let _ = builder.json().flatten_event(true).try_init();
        }
        LogFormat::Compact => {
            let _ = builder.compact().try_init();
        }
    }
}

/// Convenience for binaries and tests: environment-driven defaults.
pub fn init_tracing() {
    init(&TelemetryConfig::from_env());
}
