//! CLI argument parsing and configuration types

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use mcpsim_transport::Framing;
use url::Url;

/// Main CLI application structure
#[derive(Parser, Debug)]
#[command(
    name = "mcpsim",
    version,
    about = "Simulate an MCP client against a server under development",
    long_about = "mcpsim drives an MCP server the way a host application would: it negotiates\n\
                  capabilities, lists and executes resources, prompts and tools, relays sampling\n\
                  requests to a human operator and compares two servers side by side.\n\n\
                  Select the server with --command (spawned, spoken to over stdio) or --url\n\
                  (HTTP POST plus server-sent events).\n\n\
                  SECURITY WARNING: --command executes an arbitrary program on this machine."
)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Server to connect to
    #[command(flatten)]
    pub target: Target,

    /// Output format
    #[arg(long, short = 'f', global = true, value_enum, default_value = "pretty")]
    pub format: OutputFormat,

    /// Echo connection events to stderr as JSON lines
    #[arg(long, global = true)]
    pub events: bool,

    /// How sampling requests from the server are decided
    #[arg(long, global = true, value_enum, default_value = "deny")]
    pub sampling: SamplingMode,

    /// Reason sent back when sampling is denied
    #[arg(long, global = true, default_value = "sampling is disabled in this session")]
    pub deny_reason: String,

    /// Per-request timeout in seconds (0 waits forever)
    #[arg(long, global = true, default_value = "30")]
    pub timeout: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins when set
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List resources, prompts and tools (or just one kind)
    List {
        /// What to list; everything the server supports when omitted
        #[arg(value_enum)]
        kind: Option<ListKind>,
    },

    /// Resource operations
    #[command(subcommand)]
    Resources(ResourceCommands),

    /// Prompt operations
    #[command(subcommand)]
    Prompts(PromptCommands),

    /// Tool operations
    #[command(subcommand)]
    Tools(ToolCommands),

    /// Send the same request to two servers and diff the replies
    Compare(CompareArgs),

    /// Interactive session
    Interactive,
}

/// Feature kinds for `list`
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ListKind {
    /// Contextual data items
    Resources,
    /// Interactive templates
    Prompts,
    /// Executable functions
    Tools,
}

/// Resource commands
#[derive(Subcommand, Debug)]
pub enum ResourceCommands {
    /// List resources
    List,

    /// Fetch resource content
    Get {
        /// Resource URI
        uri: String,
    },

    /// Show resource metadata
    Describe {
        /// Resource URI
        uri: String,
    },
}

/// Prompt commands
#[derive(Subcommand, Debug)]
pub enum PromptCommands {
    /// List prompts
    List,

    /// Execute a prompt
    Execute {
        /// Prompt identifier
        id: String,

        /// Arguments as a JSON object
        #[arg(long, short = 'a', default_value = "{}")]
        args: String,
    },
}

/// Tool commands
#[derive(Subcommand, Debug)]
pub enum ToolCommands {
    /// List tools
    List,

    /// Execute a tool
    Execute {
        /// Tool identifier
        id: String,

        /// Arguments as a JSON object
        #[arg(long, short = 'a', default_value = "{}")]
        args: String,
    },
}

/// Arguments of `compare`
#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    /// Wire method, e.g. `tools/list`
    pub method: String,

    /// Parameters as JSON
    #[arg(long, short = 'p')]
    pub params: Option<String>,

    /// Command of the second server
    #[arg(long, conflicts_with = "right_url")]
    pub right_command: Option<String>,

    /// Argument for the second server's command (repeatable)
    #[arg(long = "right-arg", allow_hyphen_values = true)]
    pub right_args: Vec<String>,

    /// URL of the second server
    #[arg(long)]
    pub right_url: Option<Url>,
}

/// Server selection
#[derive(Args, Debug, Clone, Default)]
pub struct Target {
    /// Program to spawn and speak to over stdio
    #[arg(long, env = "MCPSIM_COMMAND", global = true, conflicts_with = "url")]
    pub command: Option<String>,

    /// Argument for --command (repeatable)
    #[arg(long = "arg", global = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Working directory for --command
    #[arg(long, global = true)]
    pub cwd: Option<PathBuf>,

    /// Environment variable for --command as KEY=VALUE (repeatable)
    #[arg(long = "env", global = true, value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Stdio framing: newline or length
    #[arg(long, global = true, default_value = "newline")]
    pub framing: Framing,

    /// Base URL of an HTTP server
    #[arg(long, env = "MCPSIM_URL", global = true)]
    pub url: Option<Url>,

    /// Event stream URL, when it is not `<url>/events`
    #[arg(long, global = true)]
    pub events_url: Option<Url>,

    /// Extra HTTP header as "Name: value" (repeatable)
    #[arg(long = "header", global = true, value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Bearer token for the HTTP server
    #[arg(long, env = "MCPSIM_AUTH_TOKEN", global = true, hide_env_values = true)]
    pub auth_token: Option<String>,
}

/// Output formats
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Tables and colors
    Pretty,
    /// Pretty-printed JSON
    Json,
}

/// Sampling decision source
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum SamplingMode {
    /// Ask the operator on the console
    Prompt,
    /// Refuse every request
    Deny,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected \"Name: value\", got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{s}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_pipe_target_parsing() {
        let cli = Cli::try_parse_from([
            "mcpsim",
            "--command",
            "python3",
            "--arg",
            "server.py",
            "--arg",
            "--debug",
            "--env",
            "LOG=1",
            "--framing",
            "length",
            "tools",
            "execute",
            "calculator",
            "-a",
            r#"{"expression":"2+2"}"#,
        ])
        .unwrap();

        assert_eq!(cli.target.command.as_deref(), Some("python3"));
        assert_eq!(cli.target.args, vec!["server.py", "--debug"]);
        assert_eq!(cli.target.env, vec![("LOG".to_string(), "1".to_string())]);
        assert_eq!(cli.target.framing, Framing::LengthDelimited);
        match cli.command {
            Commands::Tools(ToolCommands::Execute { id, args }) => {
                assert_eq!(id, "calculator");
                assert_eq!(args, r#"{"expression":"2+2"}"#);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_stream_target_and_globals_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mcpsim",
            "list",
            "tools",
            "--url",
            "http://localhost:8080/mcp",
            "--header",
            "X-Trace: abc",
            "--format",
            "json",
            "-vv",
        ])
        .unwrap();

        assert_eq!(
            cli.target.url.as_ref().map(Url::as_str),
            Some("http://localhost:8080/mcp")
        );
        assert_eq!(cli.target.headers, vec![("X-Trace".to_string(), "abc".to_string())]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::List { kind: Some(ListKind::Tools) }));
    }

    #[test]
    fn test_command_and_url_conflict() {
        let err = Cli::try_parse_from([
            "mcpsim",
            "--command",
            "srv",
            "--url",
            "http://localhost/",
            "interactive",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_key_value_parsers() {
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
        assert_eq!(
            parse_header("Authorization:  Bearer t ").unwrap(),
            ("Authorization".to_string(), "Bearer t".to_string())
        );
        assert!(parse_header("nocolon").is_err());
    }
}
