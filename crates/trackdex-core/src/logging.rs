//! Structured logging setup built on `tracing`.
//!
//! Embedders call [`init_logging`] once at startup; everything in the crate
//! emits through `tracing` macros with structured fields (`record_key`,
//! `sub_index`, `elapsed_ms`). Use consistent field names so operations can
//! be correlated across online edits and rebuild flows.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use.
    #[default]
    Pretty,
    /// JSON lines for CI and ops tooling.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (overridable via `RUST_LOG`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Initialize the global subscriber. Idempotent: the second and later calls
/// are no-ops and report `false`.
pub fn init_logging(config: &LogConfig) -> bool {
    let mut first = false;
    LOGGING_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
        match config.format {
            LogFormat::Pretty => {
                let _ = fmt().with_env_filter(filter).try_init();
            }
            LogFormat::Json => {
                let _ = fmt().json().with_env_filter(filter).try_init();
            }
        }
        first = true;
        true
    });
    first
}
