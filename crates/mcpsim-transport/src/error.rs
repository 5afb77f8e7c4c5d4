//! Transport error types.

use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The transport has not been opened yet.
    #[error("Transport not open")]
    NotOpen,

    /// The transport was closed.
    #[error("Transport closed")]
    Closed,

    /// Failed to send a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Framing lost sync with the byte stream; nothing after this point can be trusted.
    #[error("Frame desync: {0}")]
    FrameDesync(String),

    /// The peer wrote something that is not a protocol frame (log output on stdout, ...).
    #[error("Non-protocol output from peer: {0}")]
    NonProtocolOutput(String),

    /// An outbound frame could not be put on the wire as-is.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The remote endpoint answered with a non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// Status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// A single outbound request timed out.
    #[error("Request timed out after {timeout:?} for operation: {operation}")]
    RequestTimeout {
        /// The operation that timed out
        operation: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// True when the transport can no longer be used after this error.
    ///
    /// Non-fatal errors concern one frame or one outbound request; the
    /// transport keeps working and the next `receive` may succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::NotOpen
                | Self::Closed
                | Self::FrameDesync(_)
                | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<TransportError> for mcpsim_protocol::Error {
    fn from(err: TransportError) -> Self {
        use mcpsim_protocol::Error;

        match &err {
            TransportError::NonProtocolOutput(_) | TransportError::ConfigurationError(_) => {
                Error::configuration(err.to_string())
            }
            TransportError::RequestTimeout { .. } => Error::timeout(err.to_string()),
            _ => Error::transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpsim_protocol::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fatality() {
        assert!(TransportError::FrameDesync("oversized".into()).is_fatal());
        assert!(TransportError::ConnectionLost("eof".into()).is_fatal());
        assert!(!TransportError::NonProtocolOutput("hello".into()).is_fatal());
        assert!(
            !TransportError::HttpStatus {
                status: 500,
                body: String::new()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_conversion_into_client_error() {
        let err: mcpsim_protocol::Error =
            TransportError::NonProtocolOutput("Client connected: x".into()).into();
        assert_eq!(err.kind, ErrorKind::Configuration);

        let err: mcpsim_protocol::Error = TransportError::Closed.into();
        assert_eq!(err.kind, ErrorKind::Transport);

        let err: mcpsim_protocol::Error = TransportError::RequestTimeout {
            operation: "POST".into(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
