//! Error types and handling for the Riffle library

use thiserror::Error;

/// Result type alias for Riffle operations
pub type Result<T> = std::result::Result<T, RiffleError>;

/// Main error type for the Riffle library
#[derive(Error, Debug)]
pub enum RiffleError {
    /// Control signal: the sequence barrier was alerted for cancellation or
    /// shutdown. Unwinds waiting consumers; never delivered to user code.
    #[error("Sequence barrier was alerted")]
    Alert,

    /// Control signal: the consumer behind an operation is gone. Unwinds a
    /// producer or delivery frame; never delivered to user code.
    #[error("Subscription was cancelled")]
    Cancelled,

    /// Ring buffer is full and cannot accept more events
    #[error("Ring buffer is full")]
    BufferFull,

    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Invalid argument to an operation, such as non-positive demand
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Error message describing the invalid argument
        message: String,
    },

    /// Operation not legal in the current lifecycle state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message describing the state violation
        message: String,
    },

    /// A downstream callback failed while handling a signal
    #[error("Subscriber error: {message}")]
    Subscriber {
        /// Failure description, augmented with the offending value
        message: String,
    },
}

impl RiffleError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new invalid argument error
    pub fn argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new invalid state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a new subscriber error
    pub fn subscriber(message: impl Into<String>) -> Self {
        Self::Subscriber {
            message: message.into(),
        }
    }

    /// Whether this error is an internal control signal (alert or cancel)
    /// rather than a failure to report downstream
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Alert | Self::Cancelled)
    }

    /// Whether the operation that produced this error can be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BufferFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_constructors() {
        let err = RiffleError::config("size must be power of 2");
        assert!(matches!(err, RiffleError::InvalidConfig { .. }));

        let err = RiffleError::argument("demand must be positive");
        assert!(matches!(err, RiffleError::InvalidArgument { .. }));

        let err = RiffleError::state("already subscribed");
        assert!(matches!(err, RiffleError::InvalidState { .. }));
    }

    #[test]
    fn test_control_signals() {
        assert!(RiffleError::Alert.is_control());
        assert!(RiffleError::Cancelled.is_control());
        assert!(!RiffleError::BufferFull.is_control());
        assert!(!RiffleError::subscriber("boom").is_control());
    }

    #[test]
    fn test_recoverable() {
        assert!(RiffleError::BufferFull.is_recoverable());
        assert!(!RiffleError::Alert.is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = RiffleError::config("bad size");
        assert_eq!(err.to_string(), "Invalid configuration: bad size");
    }
}
