use crate::humanize::HumanDuration;
use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub multi: MultiSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Multi controller settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiSettings {
    /// Upper bound for one blocking poll iteration
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: HumanDuration,
    #[serde(default = "default_max_active_handles")]
    pub max_active_handles: usize,
}

impl Default for MultiSettings {
    fn default() -> Self {
        Self {
            poll_timeout: default_poll_timeout(),
            max_active_handles: default_max_active_handles(),
        }
    }
}

fn default_poll_timeout() -> HumanDuration {
    HumanDuration::from_millis(250)
}

fn default_max_active_handles() -> usize {
    1024
}

/// Poll worker thread settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Pause after a multiplexer-level poll error
    #[serde(default = "default_error_backoff")]
    pub error_backoff: HumanDuration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            error_backoff: default_error_backoff(),
        }
    }
}

fn default_thread_name() -> String {
    "fetchmux-poll".to_string()
}

fn default_error_backoff() -> HumanDuration {
    HumanDuration::from_millis(100)
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
