use super::models::Config;
use std::time::Duration;
use thiserror::Error;

const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("max_active_handles must be positive")]
    NoHandleCapacity,

    #[error("{field} ({actual:?}) exceeds limit of {limit:?}")]
    DurationTooLong {
        field: String,
        actual: Duration,
        limit: Duration,
    },

    #[error("Worker thread name must not be empty")]
    EmptyThreadName,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_multi(config)?;
    validate_worker(config)?;
    Ok(())
}

fn validate_multi(config: &Config) -> Result<(), ValidationError> {
    if config.multi.max_active_handles == 0 {
        return Err(ValidationError::NoHandleCapacity);
    }

    check_duration(
        "poll_timeout",
        config.multi.poll_timeout.as_duration(),
        MAX_POLL_TIMEOUT,
    )
}

fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    if config.worker.thread_name.trim().is_empty() {
        return Err(ValidationError::EmptyThreadName);
    }

    check_duration(
        "error_backoff",
        config.worker.error_backoff.as_duration(),
        MAX_ERROR_BACKOFF,
    )
}

fn check_duration(field: &str, actual: Duration, limit: Duration) -> Result<(), ValidationError> {
    if actual > limit {
        return Err(ValidationError::DurationTooLong {
            field: field.to_string(),
            actual,
            limit,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::HumanDuration;

    #[test]
    fn test_valid_config() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_capacity() {
        let mut config = Config::default();
        config.multi.max_active_handles = 0;

        assert!(matches!(validate(&config), Err(ValidationError::NoHandleCapacity)));
    }

    #[test]
    fn test_poll_timeout_too_long() {
        let mut config = Config::default();
        config.multi.poll_timeout = HumanDuration::from_millis(61_000);

        let result = validate(&config);
        assert!(matches!(
            result,
            Err(ValidationError::DurationTooLong { ref field, .. }) if field == "poll_timeout"
        ));
    }

    #[test]
    fn test_empty_thread_name() {
        let mut config = Config::default();
        config.worker.thread_name = "  ".to_string();

        assert!(matches!(validate(&config), Err(ValidationError::EmptyThreadName)));
    }

    #[test]
    fn test_error_backoff_too_long() {
        let mut config = Config::default();
        config.worker.error_backoff = HumanDuration(Duration::from_secs(120));

        assert!(matches!(
            validate(&config),
            Err(ValidationError::DurationTooLong { .. })
        ));
    }
}
