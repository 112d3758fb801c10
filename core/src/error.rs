//! Error types for toimitus outputs

use std::time::Duration;
use thiserror::Error;

/// Error returned across the [`NetworkClient`](crate::NetworkClient) boundary
///
/// Wrappers (backoff, failover) and client workers branch on the variant to
/// decide whether to delay, reconnect or switch hosts.
///
/// # Example
///
/// ```
/// use toimitus_core::OutputError;
/// use std::time::Duration;
///
/// let err = OutputError::Timeout(Duration::from_secs(30));
/// assert!(err.is_timeout());
/// assert!(!err.is_application());
/// ```
#[derive(Error, Debug)]
pub enum OutputError {
    /// A failover group was built with no clients
    #[error("no network connection configured")]
    NoConnectionConfigured,

    /// Failover group has not established any connection yet
    #[error("no active connection")]
    NoActiveConnection,

    /// Publish attempted on a client without an open connection
    #[error("client not connected")]
    NotConnected,

    /// Acknowledgement did not arrive in time
    ///
    /// Retryable. Closes the connection only after the configured number
    /// of consecutive occurrences.
    #[error("timed out after {0:?} waiting for acknowledgement")]
    Timeout(Duration),

    /// Transport failure (reset, refused, broken pipe)
    ///
    /// Fatal to the current connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer sent something that does not fit the protocol
    ///
    /// The stream is desynchronized; the connection must be closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Sink-reported application failure (e.g. out of memory)
    #[error("sink error: {0}")]
    Application(String),

    /// No acknowledgement progress within the stall timeout
    #[error("no acknowledgement progress for {0:?}")]
    Stalled(Duration),
}

impl OutputError {
    /// Ack read timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, OutputError::Timeout(_))
    }

    /// Failure reported by the sink itself rather than the network layer
    pub fn is_application(&self) -> bool {
        matches!(self, OutputError::Application(_))
    }
}

/// Failure cause delivered to producers through a signaler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct SignalError {
    reason: String,
}

impl SignalError {
    /// Failure with a human readable reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Why delivery failed
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<&OutputError> for SignalError {
    fn from(err: &OutputError) -> Self {
        SignalError::new(err.to_string())
    }
}

/// Per-event serialization failure
#[derive(Error, Debug)]
pub enum CodecError {
    /// serde_json rejected the event
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Event shape the codec cannot represent
    #[error("unsupported event: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_error_display() {
        assert_eq!(
            OutputError::NoConnectionConfigured.to_string(),
            "no network connection configured"
        );
        assert_eq!(
            OutputError::NoActiveConnection.to_string(),
            "no active connection"
        );
        assert_eq!(
            OutputError::Protocol("invalid sequence number".into()).to_string(),
            "protocol error: invalid sequence number"
        );
    }

    #[test]
    fn test_classification() {
        let io = OutputError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(!io.is_timeout());
        assert!(!io.is_application());

        let timeout = OutputError::Timeout(Duration::from_secs(1));
        assert!(timeout.is_timeout());

        let oom = OutputError::Application("OOM command not allowed".into());
        assert!(oom.is_application());
        assert!(!oom.is_timeout());
    }

    #[test]
    fn test_signal_error_from_output_error() {
        let err = SignalError::from(&OutputError::NoActiveConnection);
        assert_eq!(err.reason(), "no active connection");
        assert_eq!(err.to_string(), "no active connection");
    }

    #[test]
    fn test_errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OutputError>();
        assert_send_sync::<SignalError>();
        assert_send_sync::<CodecError>();
    }
}
