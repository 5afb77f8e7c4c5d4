//! Command execution using mcpsim-client

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mcpsim_client::sampling::ApprovalAuthority;
use mcpsim_client::{Connection, ConnectionConfig, DenyAll, Query, compare};
use mcpsim_protocol::feature;
use mcpsim_transport::ClientTransport;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cli::{
    Cli, Commands, CompareArgs, ListKind, OutputFormat, PromptCommands, ResourceCommands,
    SamplingMode, Target, ToolCommands,
};
use crate::console::{Console, ConsoleAuthority};
use crate::error::{CliError, CliResult};
use crate::formatter::Formatter;
use crate::interactive;
use crate::transport::{create_transport, right_target};

/// Connection over whichever transport the target selected
pub type CliConnection = Connection<ClientTransport>;

/// Execute CLI commands
#[derive(Debug)]
pub struct CommandExecutor {
    pub formatter: Formatter,
    target: Target,
    config: ConnectionConfig,
    sampling: SamplingMode,
    deny_reason: String,
    echo_events: bool,
    console: OnceLock<Arc<Console>>,
}

/// A connected server plus its event echo task
#[derive(Debug)]
struct Link {
    connection: CliConnection,
    echo: Option<JoinHandle<()>>,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(cli: &Cli) -> Self {
        let timeout = request_timeout(cli.timeout);
        let config = ConnectionConfig::default()
            .with_client_info("mcpsim", env!("CARGO_PKG_VERSION"))
            .with_request_timeout(timeout);
        Self {
            formatter: Formatter::new(cli.format, !cli.no_color),
            target: cli.target.clone(),
            config,
            sampling: cli.sampling,
            deny_reason: cli.deny_reason.clone(),
            echo_events: cli.events,
            console: OnceLock::new(),
        }
    }

    /// Display an error with rich formatting
    pub fn display_error(&self, error: &CliError) {
        self.formatter.display_error(error);
    }

    /// Execute a command
    pub async fn execute(&self, command: Commands) -> CliResult<()> {
        match command {
            Commands::Compare(args) => self.execute_compare(args).await,
            command => {
                let link = self.connect(&self.target).await?;
                let result = self.execute_on(&link.connection, command).await;
                self.finish(link).await;
                result
            }
        }
    }

    async fn execute_on(&self, connection: &CliConnection, command: Commands) -> CliResult<()> {
        match command {
            Commands::List { kind } => self.execute_list(connection, kind).await,
            Commands::Resources(cmd) => self.execute_resource_command(connection, cmd).await,
            Commands::Prompts(cmd) => self.execute_prompt_command(connection, cmd).await,
            Commands::Tools(cmd) => self.execute_tool_command(connection, cmd).await,
            Commands::Interactive => {
                interactive::run(&self.formatter, &self.console(), connection).await
            }
            Commands::Compare(_) => Err(CliError::InvalidArguments(
                "compare opens its own connections".to_string(),
            )),
        }
    }

    /// Open the transport, install the sampling authority and negotiate
    async fn connect(&self, target: &Target) -> CliResult<Link> {
        let transport = create_transport(target, self.config.request_timeout())?;
        let connection = Connection::new(transport, self.config.clone());
        connection.set_approval_authority(Some(self.authority()));

        let echo = self.echo_events.then(|| spawn_event_echo(&connection));
        connection.connect().await?;
        debug!(
            connection = %connection.id(),
            server = ?connection.server_info(),
            "connected"
        );
        Ok(Link { connection, echo })
    }

    /// Shut the connection down and let the echo task drain
    async fn finish(&self, link: Link) {
        let Link { connection, echo } = link;
        if let Err(e) = connection.shutdown().await {
            warn!(error = %e, "shutdown did not complete cleanly");
        }
        drop(connection);
        if let Some(echo) = echo {
            if tokio::time::timeout(Duration::from_secs(1), echo).await.is_err() {
                debug!("event echo still running at exit");
            }
        }
    }

    fn authority(&self) -> Arc<dyn ApprovalAuthority> {
        match self.sampling {
            SamplingMode::Prompt => Arc::new(ConsoleAuthority::new(self.console())),
            SamplingMode::Deny => Arc::new(DenyAll::new(self.deny_reason.clone())),
        }
    }

    fn console(&self) -> Arc<Console> {
        self.console
            .get_or_init(|| Arc::new(Console::stdin()))
            .clone()
    }

    // List command

    async fn execute_list(
        &self,
        connection: &CliConnection,
        kind: Option<ListKind>,
    ) -> CliResult<()> {
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => [ListKind::Resources, ListKind::Prompts, ListKind::Tools]
                .into_iter()
                .filter(|kind| connection.supports(feature_of(*kind)))
                .collect(),
        };

        if self.formatter.format() == OutputFormat::Json {
            let mut listing = Map::new();
            for kind in kinds {
                let value = match kind {
                    ListKind::Resources => {
                        serde_json::to_value(connection.list_resources().await?)?
                    }
                    ListKind::Prompts => serde_json::to_value(connection.list_prompts().await?)?,
                    ListKind::Tools => serde_json::to_value(connection.list_tools().await?)?,
                };
                listing.insert(feature_of(kind).to_string(), value);
            }
            return self.formatter.display(&Value::Object(listing));
        }

        for kind in kinds {
            match kind {
                ListKind::Resources => self
                    .formatter
                    .display_resources(&connection.list_resources().await?)?,
                ListKind::Prompts => self
                    .formatter
                    .display_items("prompts", &connection.list_prompts().await?)?,
                ListKind::Tools => self
                    .formatter
                    .display_items("tools", &connection.list_tools().await?)?,
            }
        }
        Ok(())
    }

    // Resource commands

    async fn execute_resource_command(
        &self,
        connection: &CliConnection,
        command: ResourceCommands,
    ) -> CliResult<()> {
        match command {
            ResourceCommands::List => {
                let resources = connection.list_resources().await?;
                self.formatter.display_resources(&resources)
            }
            ResourceCommands::Get { uri } => {
                let content = connection.get_resource(&uri).await?;
                self.formatter.display_content(&content)
            }
            ResourceCommands::Describe { uri } => {
                let resource = connection.describe_resource(&uri).await?;
                self.formatter.display_resource(&uri, resource.as_ref())
            }
        }
    }

    // Prompt commands

    async fn execute_prompt_command(
        &self,
        connection: &CliConnection,
        command: PromptCommands,
    ) -> CliResult<()> {
        match command {
            PromptCommands::List => {
                let prompts = connection.list_prompts().await?;
                self.formatter.display_items("prompts", &prompts)
            }
            PromptCommands::Execute { id, args } => {
                let args = parse_args(&args)?;
                let outcome = connection.execute_prompt(&id, args).await?;
                self.formatter.display_outcome(&outcome)
            }
        }
    }

    // Tool commands

    async fn execute_tool_command(
        &self,
        connection: &CliConnection,
        command: ToolCommands,
    ) -> CliResult<()> {
        match command {
            ToolCommands::List => {
                let tools = connection.list_tools().await?;
                self.formatter.display_items("tools", &tools)
            }
            ToolCommands::Execute { id, args } => {
                let args = parse_args(&args)?;
                let outcome = connection.execute_tool(&id, args).await?;
                self.formatter.display_outcome(&outcome)
            }
        }
    }

    // Comparison

    async fn execute_compare(&self, args: CompareArgs) -> CliResult<()> {
        let params = args
            .params
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| CliError::InvalidArguments(format!("invalid --params JSON: {e}")))?;
        let query = Query::new(args.method.clone(), params);
        let right = right_target(&self.target, &args)?;

        let (left, right) = tokio::join!(self.connect(&self.target), self.connect(&right));
        match (left, right) {
            (Ok(left), Ok(right)) => {
                let comparison = compare(&left.connection, &right.connection, &query).await;
                let shown = self.formatter.display_comparison(&comparison);
                self.finish(left).await;
                self.finish(right).await;
                shown
            }
            (Ok(link), Err(e)) | (Err(e), Ok(link)) => {
                self.finish(link).await;
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }
}

/// Request deadline from the `--timeout` seconds; 0 waits forever
fn request_timeout(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// Capability name of a list kind
fn feature_of(kind: ListKind) -> &'static str {
    match kind {
        ListKind::Resources => feature::RESOURCES,
        ListKind::Prompts => feature::PROMPTS,
        ListKind::Tools => feature::TOOLS,
    }
}

/// Parse execute arguments; they must form a JSON object
pub fn parse_args(raw: &str) -> CliResult<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(CliError::InvalidArguments(format!(
            "arguments must be a JSON object, got {other}"
        ))),
        Err(e) => Err(CliError::InvalidArguments(format!("invalid JSON arguments: {e}"))),
    }
}

/// Print every event of `connection` to stderr as one JSON line
fn spawn_event_echo(connection: &CliConnection) -> JoinHandle<()> {
    let mut events = connection.subscribe_events(256);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => eprintln!("{line}"),
                Err(e) => warn!(error = %e, "unserializable event"),
            }
        }
    })
}
