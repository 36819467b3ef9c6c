use crate::core::errors::{ProcessionError, Result};
use std::time::Duration;

/// Configuration for engine behavior
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the lifecycle event queue feeding the history worker
    pub history_queue_capacity: usize,
    /// Interval at which drain-waiters poll the history queue
    pub history_poll_interval: Duration,
    /// How long a change-state command waits for its hierarchy lock
    /// (None = wait indefinitely; the surrounding transaction manager
    /// owns overall timeout semantics)
    pub lock_timeout: Option<Duration>,
    /// Whether a failed concurrency self-check aborts the command.
    /// When false the violation is logged and the command proceeds;
    /// intended for diagnostics only.
    pub strict_consistency_check: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_queue_capacity: 256,
            history_poll_interval: Duration::from_millis(20),
            lock_timeout: None,
            strict_consistency_check: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_queue_capacity == 0 {
            return Err(ProcessionError::configuration(
                "history_queue_capacity cannot be zero",
            ));
        }
        if self.history_poll_interval.is_zero() {
            return Err(ProcessionError::configuration(
                "history_poll_interval cannot be zero",
            ));
        }
        if let Some(timeout) = self.lock_timeout {
            if timeout.is_zero() {
                return Err(ProcessionError::configuration(
                    "lock_timeout cannot be zero when set",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = EngineConfig {
            history_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
