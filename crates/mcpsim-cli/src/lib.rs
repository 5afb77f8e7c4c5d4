//! # mcpsim CLI
//!
//! Drives an MCP server the way a host application would, for testing
//! servers under development.
//!
//! ## Features
//!
//! - Spawn a server and speak to it over stdio, or reach it over HTTP with
//!   server-sent events
//! - List and describe resources, prompts and tools
//! - Execute prompts and tools with JSON arguments
//! - Relay server sampling requests to the operator for approval
//! - Send the same request to two servers and diff the replies
//! - Interactive session with request history
//!
//! ## Usage
//!
//! ```bash
//! # Everything a stdio server offers
//! mcpsim --command python3 --arg server.py list
//!
//! # Execute a tool on an HTTP server
//! mcpsim --url http://localhost:8080/mcp tools execute calculator -a '{"expression": "2+2"}'
//!
//! # Compare two versions of a server
//! mcpsim --command ./server-v1 compare tools/list --right-command ./server-v2
//!
//! # Interactive session, asking before any sampling request is answered
//! mcpsim --command ./server --sampling prompt interactive
//! ```

pub mod cli;
pub mod console;
pub mod error;
pub mod executor;
pub mod formatter;
pub mod interactive;
pub mod logging;
pub mod transport;

pub use cli::Cli;
pub use error::{CliError, CliResult};
pub use executor::CommandExecutor;

/// Run one parsed command line
///
/// Errors are displayed before they are returned.
pub async fn run(cli: Cli) -> CliResult<()> {
    let executor = CommandExecutor::new(&cli);
    let result = executor.execute(cli.command).await;
    if let Err(e) = &result {
        executor.display_error(e);
    }
    result
}
