//! Error types for toimitus outputs

use thiserror::Error;

// Re-export the client-boundary errors from toimitus-core
pub use toimitus_core::{CodecError, OutputError, SignalError};

/// Error returned to producers by [`EventSender`](crate::EventSender)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The batching worker is gone; nothing was queued
    #[error("output closed")]
    Closed,

    /// Input queue at its high-water mark (non-blocking publish only)
    #[error("output queue full")]
    Full,

    /// Events were queued but delivery was given up on
    #[error("delivery failed: {0}")]
    Failed(#[from] SignalError),
}

/// Invalid configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment could not be read into settings (missing or mistyped value)
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// Value read but not one of the accepted choices
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// Values parse but contradict each other or a bound
    #[error("configuration error: {0}")]
    Constraint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_from_signal_error() {
        let err: PublishError = SignalError::new("retry limit reached").into();
        assert_eq!(err.to_string(), "delivery failed: retry limit reached");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            key: "TOIMITUS_QUEUE_HWM",
            value: "lots".into(),
            reason: "invalid digit found in string".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value \"lots\" for TOIMITUS_QUEUE_HWM: invalid digit found in string"
        );
    }
}
