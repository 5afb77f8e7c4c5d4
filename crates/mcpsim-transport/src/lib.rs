//! # mcpsim Transport
//!
//! Byte-level channels between the client engine and a server under test.
//!
//! - [`PipeTransport`]: spawns the server and speaks framed JSON over its
//!   stdin/stdout ([`Framing::Newline`] or [`Framing::LengthDelimited`])
//! - [`StreamTransport`]: POSTs each outbound frame and reads inbound frames
//!   from a server-sent event stream
//! - [`ClientTransport`]: either of the above, picked at runtime
//!
//! Transports move opaque [`bytes::Bytes`] frames; decoding belongs to the
//! connection layer. Errors say whether the channel survived them through
//! [`TransportError::is_fatal`].

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod any;
pub mod error;
pub mod framing;
pub mod pipe;
pub mod sse;
pub mod stream;
pub mod traits;

pub use any::ClientTransport;
pub use error::{TransportError, TransportResult};
pub use framing::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, Framing};
pub use pipe::{PipeConfig, PipeTransport};
pub use sse::{SseEvent, SseParser};
pub use stream::{StreamConfig, StreamTransport};
pub use traits::{Transport, TransportKind};
