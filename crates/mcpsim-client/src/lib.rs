//! # mcpsim Client
//!
//! Client engine for exercising MCP servers during development and testing.
//!
//! ## Features
//!
//! - **Connection lifecycle**: connect, negotiate capabilities, close, with
//!   every transition observable
//! - **Concurrent requests**: one reader per connection, replies correlated
//!   by identifier regardless of arrival order, per-request deadlines and
//!   cancellation
//! - **Feature operations**: resources, prompts and tools, gated on the
//!   negotiated capability set
//! - **Sampling relay**: server-initiated completion requests go to an
//!   external [`ApprovalAuthority`]; nothing is ever auto-approved
//! - **Sessions**: ordered (query, reply) records spanning connections
//! - **Comparison**: one query against two servers, with a structural diff
//! - **Events**: a structured stream of state changes, envelopes and anomalies
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mcpsim_client::{Connection, ConnectionConfig, Session, Query};
//! use mcpsim_transport::{PipeConfig, PipeTransport};
//!
//! # async fn example() -> mcpsim_protocol::Result<()> {
//! let transport = PipeTransport::new(PipeConfig::new("node").with_arg("server.js"));
//! let connection = Connection::new(transport, ConnectionConfig::default());
//! let capabilities = connection.connect().await?;
//! println!("negotiated: {:?}", capabilities.features().collect::<Vec<_>>());
//!
//! let session = Session::new();
//! let tools = session.track(&connection, Query::list_tools()).await?;
//! println!("{tools}");
//!
//! connection.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod compare;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod events;
pub mod query;
pub mod sampling;
pub mod session;
pub mod state;

pub use compare::{Comparison, Diff, compare};
pub use config::ConnectionConfig;
pub use connection::{Call, Connection, execution_outcome};
pub use events::{AnomalyKind, Event, EventKind, Outcome};
pub use query::Query;
pub use sampling::{ApprovalAuthority, AuthorityError, DenyAll};
pub use session::{Reply, Session, Turn};
pub use state::ConnectionState;
