//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a [`Connection`](crate::Connection)
///
/// ```text
/// Disconnected → Connecting → Negotiating → Ready → Closing → Closed
///        └────────────┴────────────┴──────────┴───────┴──→ Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, transport not opened
    Disconnected,
    /// Opening the transport
    Connecting,
    /// `initialize` in flight
    Negotiating,
    /// Capabilities fixed; feature invocations allowed
    Ready,
    /// Explicit close in progress
    Closing,
    /// Closed on request
    Closed,
    /// Unrecoverable failure
    Failed {
        /// What went wrong
        reason: String,
    },
}

impl ConnectionState {
    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Negotiating => "negotiating",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed { .. } => "failed",
        }
    }

    /// `Closed` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }

    /// True only in `Ready`
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (from, Failed { .. }) => !from.is_terminal(),
            (Disconnected, Connecting)
            | (Connecting, Negotiating)
            | (Negotiating, Ready)
            | (Closing, Closed) => true,
            // close may start from any live state
            (Disconnected | Connecting | Negotiating | Ready, Closing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}
