//! Poll worker
//!
//! Runs a multi's poll loop on one dedicated OS thread and forwards every
//! completion to an mpsc channel, so callers can react on their own threads
//! or inside a tokio runtime.

pub mod runner;

pub use runner::PollWorker;

use crate::config::Config;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn poll thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Poll thread panicked")]
    Panicked,
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub thread_name: String,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            thread_name: config.worker.thread_name.clone(),
            poll_timeout: config.multi.poll_timeout.as_duration(),
            error_backoff: config.worker.error_backoff.as_duration(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
