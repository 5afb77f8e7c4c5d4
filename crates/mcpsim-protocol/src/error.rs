//! Error taxonomy shared by every layer of the client.
//!
//! One [`Error`] type carries an [`ErrorKind`] classification so callers can
//! tell a dead connection apart from a peer that merely said "no":
//!
//! | Kind | Scope |
//! |------|-------|
//! | [`ErrorKind::Transport`] | fatal to the connection, broadcast to all waiters |
//! | [`ErrorKind::Decode`] | fatal to one frame |
//! | [`ErrorKind::ProtocolViolation`] | anomaly; fails only the affected request |
//! | [`ErrorKind::Application`] | peer error envelope, never retried |
//! | [`ErrorKind::Timeout`] / [`ErrorKind::Cancelled`] | terminal for one request |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::DecodeError;
use crate::jsonrpc::{JsonRpcError, JsonRpcErrorCode, RequestId};

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error classification for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connect failure, mid-session disconnect, frame desync
    Transport,
    /// Malformed envelope
    Decode,
    /// Duplicate or unknown identifier, misplaced message
    ProtocolViolation,
    /// The peer answered with an error envelope
    Application,
    /// Deadline elapsed
    Timeout,
    /// Cancelled by the caller or by connection close
    Cancelled,
    /// Operation not allowed in the current connection state
    InvalidState,
    /// Feature not negotiated for this connection
    CapabilityNotSupported,
    /// Local configuration is unusable
    Configuration,
    /// The approval authority refused a sampling request
    Refused,
    /// Bug or unexpected local failure
    Internal,
}

impl ErrorKind {
    /// Get a human-readable description
    pub const fn description(self) -> &'static str {
        match self {
            Self::Transport => "Transport error",
            Self::Decode => "Decode error",
            Self::ProtocolViolation => "Protocol violation",
            Self::Application => "Application error",
            Self::Timeout => "Operation timed out",
            Self::Cancelled => "Operation cancelled",
            Self::InvalidState => "Invalid state",
            Self::CapabilityNotSupported => "Capability not supported",
            Self::Configuration => "Configuration error",
            Self::Refused => "Request refused",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Client error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Peer error object for [`ErrorKind::Application`] errors
    pub rpc: Option<Box<JsonRpcError>>,
    /// Request the error belongs to, when there is one
    pub request_id: Option<RequestId>,
}

impl Error {
    /// Create a new error with kind and message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            rpc: None,
            request_id: None,
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, message)
    }

    /// Create a protocol violation error
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    /// Wrap an error envelope returned by the peer
    pub fn application(error: JsonRpcError) -> Self {
        Self {
            kind: ErrorKind::Application,
            message: error.message.clone(),
            rpc: Some(Box::new(error)),
            request_id: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Create a cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    /// Create a capability not supported error
    pub fn capability_not_supported(capability: &str) -> Self {
        Self::new(
            ErrorKind::CapabilityNotSupported,
            format!("Capability not negotiated: {capability}"),
        )
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Create a refusal error
    pub fn refused(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Refused, reason)
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach the request identifier
    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Peer error code for application errors
    pub fn rpc_code(&self) -> Option<i32> {
        self.rpc.as_ref().map(|e| e.code)
    }

    /// JSON-RPC code used when this error is reported back to the peer
    pub fn jsonrpc_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Application => self
                .rpc_code()
                .unwrap_or(JsonRpcErrorCode::InternalError.code()),
            ErrorKind::Decode => JsonRpcErrorCode::ParseError.code(),
            ErrorKind::ProtocolViolation | ErrorKind::InvalidState => {
                JsonRpcErrorCode::InvalidRequest.code()
            }
            ErrorKind::CapabilityNotSupported => JsonRpcErrorCode::MethodNotFound.code(),
            ErrorKind::Refused => -1,
            ErrorKind::Transport
            | ErrorKind::Timeout
            | ErrorKind::Cancelled
            | ErrorKind::Configuration
            | ErrorKind::Internal => JsonRpcErrorCode::InternalError.code(),
        }
    }

    /// Convert into an error object for a reply envelope
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        if let Some(rpc) = &self.rpc {
            return (**rpc).clone();
        }
        JsonRpcError::new(self.jsonrpc_code(), self.message.clone())
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Self::decode(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_application_error_keeps_peer_code() {
        let err = Error::application(JsonRpcError::new(-32602, "Tool not found: nope"));
        assert_eq!(err.kind, ErrorKind::Application);
        assert_eq!(err.rpc_code(), Some(-32602));
        assert_eq!(err.jsonrpc_code(), -32602);
        assert_eq!(err.to_string(), "Application error: Tool not found: nope");
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(Error::refused("no").jsonrpc_code(), -1);
        assert_eq!(Error::capability_not_supported("sampling").jsonrpc_code(), -32601);
        assert_eq!(Error::invalid_state("closed").jsonrpc_code(), -32600);
        assert_eq!(Error::timeout("slow").to_jsonrpc_error().code, -32603);
    }

    #[test]
    fn test_request_id_is_attached() {
        let err = Error::timeout("late").with_request_id(RequestId::from(7));
        assert_eq!(err.request_id, Some(RequestId::Number(7)));
    }

    #[test]
    fn test_decode_error_conversion() {
        let err: Error = DecodeError::MissingField("id").into();
        assert_eq!(err.kind, ErrorKind::Decode);
        assert_eq!(err.message, "Missing required field: id");
    }
}
