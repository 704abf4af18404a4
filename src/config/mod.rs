//! Configuration management for fetchmux
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use fetchmux::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Poll timeout: {}", config.multi.poll_timeout);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `FETCHMUX__<section>__<key>`
//!
//! Examples:
//! - `FETCHMUX__MULTI__POLL_TIMEOUT=500ms`
//! - `FETCHMUX__MULTI__MAX_ACTIVE_HANDLES=64`
//! - `FETCHMUX__WORKER__THREAD_NAME=transfers`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/fetchmux.toml`.
//! This can be overridden using the `FETCHMUX_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::HumanDuration;
pub use models::{Config, MultiSettings, TelemetryConfig, WorkerSettings};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
