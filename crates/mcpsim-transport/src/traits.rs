//! Core transport trait.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransportResult;

/// Which concrete transport a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Framed stdio of a spawned process
    Pipe,
    /// HTTP POST outbound, server-sent events inbound
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe => write!(f, "pipe"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// A bidirectional message channel.
///
/// Frames are opaque bytes here; the connection above decodes them. A
/// transport must preserve the order in which the peer produced inbound
/// frames and must never interleave two outbound frames, even when `send`
/// is called concurrently.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Returns the kind of this transport.
    fn kind(&self) -> TransportKind;

    /// Opens the underlying channel (spawns the process, opens the event stream).
    ///
    /// Opening an already-open transport is a no-op.
    async fn open(&self) -> TransportResult<()>;

    /// Sends one frame.
    async fn send(&self, frame: Bytes) -> TransportResult<()>;

    /// Waits for the next inbound frame.
    ///
    /// Returns `Ok(None)` once the transport has closed and every frame
    /// received before the closure has been handed out. A fatal error (see
    /// [`TransportError::is_fatal`](crate::TransportError::is_fatal)) also
    /// means no more frames will follow.
    async fn receive(&self) -> TransportResult<Option<Bytes>>;

    /// Closes the channel. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    /// Returns `true` between a successful `open` and `close` or peer closure.
    fn is_open(&self) -> bool;

    /// Returns the endpoint address or identifier for this transport, if applicable.
    fn endpoint(&self) -> Option<String> {
        None
    }
}
