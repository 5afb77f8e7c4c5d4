//! Error types for CLI operations

use std::fmt;

use mcpsim_protocol::ErrorKind;
use mcpsim_transport::TransportError;
use thiserror::Error;

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Failure reported by the client engine
    #[error(transparent)]
    Client(#[from] mcpsim_protocol::Error),

    /// The transport could not be built
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid command arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// User-facing hints for resolving the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Client(err) => match err.kind {
                ErrorKind::Transport => vec![
                    "Check that the server command runs on its own",
                    "Use -vv to see the server's stderr and every frame",
                ],
                ErrorKind::Timeout => vec![
                    "Increase the deadline with --timeout",
                    "Check that the server answers every request id",
                ],
                ErrorKind::CapabilityNotSupported => vec![
                    "The server did not advertise this feature during initialization",
                ],
                ErrorKind::Decode | ErrorKind::ProtocolViolation => vec![
                    "The server wrote something that is not a valid JSON-RPC 2.0 envelope",
                    "Run with --events to see the offending frame",
                ],
                _ => vec![],
            },
            Self::Transport(_) => vec![
                "Pass --command for a stdio server or --url for an HTTP server",
                "Check header syntax: --header \"Name: value\"",
            ],
            Self::InvalidArguments(_) => vec![
                "Arguments must be a JSON object, e.g. '{\"name\": \"value\"}'",
                "Use --help to see the expected format",
            ],
            _ => vec![],
        }
    }

    /// Category shown in the error banner
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Client(err) => match err.kind {
                ErrorKind::Transport => ErrorCategory::Connection,
                ErrorKind::Application | ErrorKind::Refused => ErrorCategory::Server,
                ErrorKind::Decode | ErrorKind::ProtocolViolation => ErrorCategory::Protocol,
                ErrorKind::Timeout | ErrorKind::Cancelled => ErrorCategory::Timeout,
                ErrorKind::CapabilityNotSupported => ErrorCategory::NotSupported,
                ErrorKind::InvalidState | ErrorKind::Configuration | ErrorKind::Internal => {
                    ErrorCategory::Other
                }
            },
            Self::Transport(_) => ErrorCategory::Connection,
            Self::InvalidArguments(_) => ErrorCategory::User,
            Self::Json(_) => ErrorCategory::Parsing,
            Self::Io(_) => ErrorCategory::System,
        }
    }
}

/// Error categories for the banner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Could not reach or lost the server
    Connection,
    /// Bad input
    User,
    /// The server answered with an error
    Server,
    /// The server broke the protocol
    Protocol,
    /// Deadline or cancellation
    Timeout,
    /// Malformed JSON
    Parsing,
    /// Local I/O
    System,
    /// Feature not negotiated
    NotSupported,
    /// Anything else
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "Connection"),
            Self::User => write!(f, "User Input"),
            Self::Server => write!(f, "Server"),
            Self::Protocol => write!(f, "Protocol"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Parsing => write!(f, "Parsing"),
            Self::System => write!(f, "System"),
            Self::NotSupported => write!(f, "Not Supported"),
            Self::Other => write!(f, "Error"),
        }
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
