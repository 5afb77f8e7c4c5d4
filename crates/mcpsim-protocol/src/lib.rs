//! # mcpsim Protocol
//!
//! Wire-level building blocks for the mcpsim client engine:
//!
//! - **Envelopes**: [`jsonrpc`] request, response, error and notification types
//! - **Codec**: [`codec::encode`] / [`codec::decode`], pure and stateless
//! - **Capabilities**: [`CapabilitySet`] and the [`negotiate`] intersection
//! - **Payloads**: [`types`] for the resource, prompt, tool and sampling methods
//! - **Errors**: [`Error`] with the [`ErrorKind`] taxonomy
//!
//! Nothing in this crate performs I/O.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod capabilities;
pub mod codec;
pub mod error;
pub mod jsonrpc;
pub mod types;

pub use capabilities::{CapabilitySet, feature, negotiate};
pub use codec::DecodeError;
pub use error::{Error, ErrorKind, Result};
pub use jsonrpc::{
    Envelope, JsonRpcError, JsonRpcErrorCode, JsonRpcErrorResponse, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use types::methods;
