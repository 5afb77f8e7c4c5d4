//! Connection lifecycle, inbound routing and feature operations.

mod core;
mod dispatcher;
mod operations;

pub use self::core::{Call, Connection};
pub use self::operations::execution_outcome;
