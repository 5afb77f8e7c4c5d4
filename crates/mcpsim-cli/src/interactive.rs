//! Interactive session
//!
//! Every request goes through a [`Session`], so `history` shows each turn
//! with its request id, outcome and latency.

use mcpsim_client::{Query, Session, execution_outcome};
use mcpsim_protocol::types::{
    ListPromptsResult, ListResourcesResult, ListToolsResult, ResourceContent,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cli::ListKind;
use crate::console::Console;
use crate::error::{CliError, CliResult};
use crate::executor::{CliConnection, parse_args};
use crate::formatter::Formatter;

const HELP: &str = "\
Available commands:
  list resources|prompts|tools      List what the server offers
  get resource <uri>                Fetch a resource
  describe resource <uri>           Show a resource's metadata
  execute prompt <id> [json-args]   Execute a prompt
  execute tool <id> [json-args]     Execute a tool
  history                           Show the requests of this session
  note [#<turn>] <text>             Annotate the session or one turn
  help                              Show this help
  exit                              Leave the session";

/// One parsed REPL line
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    /// Blank line
    Empty,
    /// `list <kind>`
    List(ListKind),
    /// `get resource <uri>`
    GetResource(String),
    /// `describe resource <uri>`
    DescribeResource(String),
    /// `execute prompt <id> [args]`
    ExecutePrompt { id: String, args: Value },
    /// `execute tool <id> [args]`
    ExecuteTool { id: String, args: Value },
    /// `history`
    History,
    /// `note [#turn] <text>`
    Note { turn: Option<usize>, text: String },
    /// `help`
    Help,
    /// `exit` or `quit`
    Exit,
}

/// Parse one input line
///
/// The error is a message for the operator.
pub fn parse_command(line: &str) -> Result<ReplCommand, String> {
    let line = line.trim();
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(ReplCommand::Empty);
    };

    match (verb, words.next()) {
        ("exit" | "quit", None) => Ok(ReplCommand::Exit),
        ("help" | "?", None) => Ok(ReplCommand::Help),
        ("history", None) => Ok(ReplCommand::History),
        ("list", Some(kind)) => match kind {
            "resources" => Ok(ReplCommand::List(ListKind::Resources)),
            "prompts" => Ok(ReplCommand::List(ListKind::Prompts)),
            "tools" => Ok(ReplCommand::List(ListKind::Tools)),
            other => Err(format!("Cannot list '{other}': expected resources, prompts or tools")),
        },
        ("get", Some("resource")) => words
            .next()
            .map(|uri| ReplCommand::GetResource(uri.to_string()))
            .ok_or_else(|| "Usage: get resource <uri>".to_string()),
        ("describe", Some("resource")) => words
            .next()
            .map(|uri| ReplCommand::DescribeResource(uri.to_string()))
            .ok_or_else(|| "Usage: describe resource <uri>".to_string()),
        ("execute", Some(kind @ ("prompt" | "tool"))) => {
            let Some(id) = words.next() else {
                return Err(format!("Usage: execute {kind} <id> [json-args]"));
            };
            let rest = words.collect::<Vec<_>>().join(" ");
            let args = parse_args(&rest).map_err(|e| match e {
                CliError::InvalidArguments(msg) => format!("Invalid JSON for args: {msg}"),
                other => other.to_string(),
            })?;
            let id = id.to_string();
            Ok(if kind == "prompt" {
                ReplCommand::ExecutePrompt { id, args }
            } else {
                ReplCommand::ExecuteTool { id, args }
            })
        }
        ("note", Some(first)) => {
            let rest = line["note".len()..].trim_start();
            match first.strip_prefix('#') {
                Some(turn) => {
                    let turn = turn
                        .parse::<usize>()
                        .map_err(|_| format!("Not a turn number: {first}"))?;
                    let text = rest[first.len()..].trim();
                    if text.is_empty() {
                        return Err("Usage: note [#<turn>] <text>".to_string());
                    }
                    Ok(ReplCommand::Note {
                        turn: Some(turn),
                        text: text.to_string(),
                    })
                }
                None => Ok(ReplCommand::Note {
                    turn: None,
                    text: rest.to_string(),
                }),
            }
        }
        _ => Err(format!("Unknown command: {line} (type 'help')")),
    }
}

/// Run the REPL until `exit`, end of input or a dead connection
pub async fn run(
    formatter: &Formatter,
    console: &Console,
    connection: &CliConnection,
) -> CliResult<()> {
    eprintln!("mcpsim interactive mode (type 'help' for commands)");
    if let Some(capabilities) = connection.capabilities() {
        formatter.display_handshake(capabilities, connection.server_info())?;
    }

    let session = Session::new();
    while let Some(line) = console.read_command("> ").await {
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };

        match command {
            ReplCommand::Empty => {}
            ReplCommand::Exit => break,
            ReplCommand::Help => eprintln!("{HELP}"),
            ReplCommand::History => formatter.display_history(&session.turns())?,
            ReplCommand::Note { turn, text } => {
                if let Err(e) = session.annotate(turn, text) {
                    formatter.display_error(&e.into());
                }
            }
            command => {
                if let Err(e) = dispatch(formatter, &session, connection, command).await {
                    formatter.display_error(&e);
                }
            }
        }

        if connection.state().is_terminal() {
            eprintln!("Connection is {}; leaving", connection.state());
            break;
        }
    }
    Ok(())
}

async fn dispatch(
    formatter: &Formatter,
    session: &Session,
    connection: &CliConnection,
    command: ReplCommand,
) -> CliResult<()> {
    match command {
        ReplCommand::List(ListKind::Resources) => {
            let listed: ListResourcesResult =
                request(session, connection, Query::list_resources()).await?;
            formatter.display_resources(&listed.resources)
        }
        ReplCommand::List(ListKind::Prompts) => {
            let listed: ListPromptsResult =
                request(session, connection, Query::list_prompts()).await?;
            formatter.display_items("prompts", &listed.prompts)
        }
        ReplCommand::List(ListKind::Tools) => {
            let listed: ListToolsResult = request(session, connection, Query::list_tools()).await?;
            formatter.display_items("tools", &listed.tools)
        }
        ReplCommand::GetResource(uri) => {
            let content: ResourceContent =
                request(session, connection, Query::get_resource(uri)).await?;
            formatter.display_content(&content)
        }
        ReplCommand::DescribeResource(uri) => {
            let listed: ListResourcesResult =
                request(session, connection, Query::list_resources()).await?;
            let resource = listed.resources.iter().find(|resource| resource.uri == uri);
            formatter.display_resource(&uri, resource)
        }
        ReplCommand::ExecutePrompt { id, args } => {
            let reply = session.track(connection, Query::execute_prompt(id, args)).await;
            formatter.display_outcome(&execution_outcome(reply)?)
        }
        ReplCommand::ExecuteTool { id, args } => {
            let reply = session.track(connection, Query::execute_tool(id, args)).await;
            formatter.display_outcome(&execution_outcome(reply)?)
        }
        ReplCommand::Empty
        | ReplCommand::Exit
        | ReplCommand::Help
        | ReplCommand::History
        | ReplCommand::Note { .. } => Ok(()),
    }
}

/// Send `query` as a session turn and decode the reply
async fn request<R: DeserializeOwned>(
    session: &Session,
    connection: &CliConnection,
    query: Query,
) -> CliResult<R> {
    let value = session.track(connection, query).await?;
    Ok(serde_json::from_value(value)?)
}
