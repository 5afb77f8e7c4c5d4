//! Output formatting for the CLI
//!
//! Results go to stdout, errors and events to stderr.

use comfy_table::{Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use mcpsim_client::session::Reply;
use mcpsim_client::{Comparison, Turn};
use mcpsim_protocol::CapabilitySet;
use mcpsim_protocol::types::{ExecutionOutcome, Implementation, Item, Resource, ResourceContent};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::error::{CliError, CliResult};

/// Format and display output based on format preference
#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
    colored: bool,
}

impl Formatter {
    #[must_use]
    pub fn new(format: OutputFormat, colored: bool) -> Self {
        Self { format, colored }
    }

    /// Selected output format
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Display any serializable value as pretty JSON
    pub fn display<T: Serialize + ?Sized>(&self, value: &T) -> CliResult<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Display a resource list
    pub fn display_resources(&self, resources: &[Resource]) -> CliResult<()> {
        match self.format {
            OutputFormat::Json => self.display(resources),
            OutputFormat::Pretty => {
                println!("{}", self.render_resources(resources));
                Ok(())
            }
        }
    }

    /// Display a prompt or tool list
    pub fn display_items(&self, title: &str, items: &[Item]) -> CliResult<()> {
        match self.format {
            OutputFormat::Json => self.display(items),
            OutputFormat::Pretty => {
                println!("{}", self.render_items(title, items));
                Ok(())
            }
        }
    }

    /// Display one resource's metadata; `None` when it is not listed
    pub fn display_resource(&self, uri: &str, resource: Option<&Resource>) -> CliResult<()> {
        match (self.format, resource) {
            (OutputFormat::Json, _) => self.display(&resource),
            (OutputFormat::Pretty, None) => {
                println!("{}", self.info(&format!("No resource listed under {uri}")));
                Ok(())
            }
            (OutputFormat::Pretty, Some(resource)) => {
                let mut out = self.header(&resource.uri);
                out.push_str(&self.kv("Name", resource.name.as_deref().unwrap_or("-")));
                out.push_str(&self.kv("Type", resource.mime_type.as_deref().unwrap_or("-")));
                out.push_str(&self.kv(
                    "Description",
                    resource.description.as_deref().unwrap_or("-"),
                ));
                for (key, value) in &resource.extra {
                    out.push_str(&self.kv(key, &compact(value)));
                }
                println!("{out}");
                Ok(())
            }
        }
    }

    /// Display fetched resource content
    pub fn display_content(&self, content: &ResourceContent) -> CliResult<()> {
        match self.format {
            OutputFormat::Json => self.display(content),
            OutputFormat::Pretty => {
                let mut out = self.header(&content.uri);
                out.push_str(&self.kv("Type", content.mime_type.as_deref().unwrap_or("-")));
                out.push('\n');
                out.push_str(&body(&content.content));
                println!("{out}");
                Ok(())
            }
        }
    }

    /// Display the outcome of executing a prompt or tool
    pub fn display_outcome(&self, outcome: &ExecutionOutcome) -> CliResult<()> {
        match self.format {
            OutputFormat::Json => self.display(outcome),
            OutputFormat::Pretty => {
                println!("{}", self.render_outcome(outcome));
                Ok(())
            }
        }
    }

    /// Display a comparison of two servers
    pub fn display_comparison(&self, comparison: &Comparison) -> CliResult<()> {
        match self.format {
            OutputFormat::Json => self.display(comparison),
            OutputFormat::Pretty => {
                println!("{}", self.render_comparison(comparison));
                Ok(())
            }
        }
    }

    /// Display session history
    pub fn display_history(&self, turns: &[Turn]) -> CliResult<()> {
        match self.format {
            OutputFormat::Json => self.display(turns),
            OutputFormat::Pretty => {
                println!("{}", self.render_history(turns));
                Ok(())
            }
        }
    }

    /// Display negotiated capabilities and server identity
    pub fn display_handshake(
        &self,
        capabilities: &CapabilitySet,
        server: Option<&Implementation>,
    ) -> CliResult<()> {
        match self.format {
            OutputFormat::Json => self.display(&serde_json::json!({
                "server": server,
                "capabilities": capabilities,
            })),
            OutputFormat::Pretty => {
                let mut out = self.header("Connected");
                if let Some(server) = server {
                    let identity = format!("{} {}", server.name, server.version);
                    out.push_str(&self.kv("Server", &identity));
                }
                let features: Vec<&str> = capabilities.features().collect();
                let features = if features.is_empty() {
                    "none".to_string()
                } else {
                    features.join(", ")
                };
                out.push_str(&self.kv("Features", &features));
                println!("{out}");
                Ok(())
            }
        }
    }

    /// Display error with suggestions
    pub fn display_error(&self, error: &CliError) {
        let suggestions = error.suggestions();
        if self.colored {
            eprintln!(
                "{} [{}]: {}",
                "Error".bright_red().bold(),
                error.category(),
                error
            );
            if !suggestions.is_empty() {
                eprintln!("\n{}", "Suggestions:".bright_yellow().bold());
                for suggestion in suggestions {
                    eprintln!("  {} {}", "•".bright_blue(), suggestion);
                }
            }
        } else {
            eprintln!("Error [{}]: {error}", error.category());
            if !suggestions.is_empty() {
                eprintln!("\nSuggestions:");
                for suggestion in suggestions {
                    eprintln!("  • {suggestion}");
                }
            }
        }
    }

    pub(crate) fn render_resources(&self, resources: &[Resource]) -> String {
        if resources.is_empty() {
            return self.info("No resources available");
        }
        let mut table = self.table(vec!["URI", "Name", "Type", "Description"]);
        for resource in resources {
            table.add_row(vec![
                resource.uri.as_str(),
                resource.name.as_deref().unwrap_or("-"),
                resource.mime_type.as_deref().unwrap_or("-"),
                resource.description.as_deref().unwrap_or("-"),
            ]);
        }
        format!("{table}\n{}", self.footer(&format!("Total: {} resources", resources.len())))
    }

    pub(crate) fn render_items(&self, title: &str, items: &[Item]) -> String {
        if items.is_empty() {
            return self.info(&format!("No {title} available"));
        }
        let mut table = self.table(vec!["ID", "Description", "Arguments"]);
        for item in items {
            table.add_row(vec![
                item.id.clone(),
                item.description.clone().unwrap_or_else(|| "-".to_string()),
                argument_summary(item.args.as_ref()),
            ]);
        }
        format!("{table}\n{}", self.footer(&format!("Total: {} {title}", items.len())))
    }

    pub(crate) fn render_outcome(&self, outcome: &ExecutionOutcome) -> String {
        match outcome {
            ExecutionOutcome::Completed { result } => {
                let mut out = self.header("Completed");
                out.push_str(&body(result));
                out
            }
            ExecutionOutcome::Rejected(rejection) => {
                let title = match rejection.code {
                    Some(code) => format!("Rejected ({code})"),
                    None => "Rejected".to_string(),
                };
                let mut out = if self.colored {
                    format!("{}\n", title.bright_red().bold())
                } else {
                    format!("{title}\n")
                };
                out.push_str(&self.kv("Reason", &rejection.message));
                if let Some(data) = &rejection.data {
                    out.push_str(&self.kv("Data", &compact(data)));
                }
                out
            }
        }
    }

    pub(crate) fn render_comparison(&self, comparison: &Comparison) -> String {
        let diff = &comparison.diff;
        let mut table = self.table(vec!["", "Left", "Right"]);
        table.add_row(vec![
            "Connection".to_string(),
            comparison.left.connection.to_string(),
            comparison.right.connection.to_string(),
        ]);
        table.add_row(vec![
            "Outcome".to_string(),
            reply_summary(&comparison.left.reply),
            reply_summary(&comparison.right.reply),
        ]);
        table.add_row(vec![
            "Elapsed".to_string(),
            elapsed(&comparison.left.reply),
            elapsed(&comparison.right.reply),
        ]);

        let mut out = self.header(&comparison.query.to_string());
        out.push_str(&format!("{table}\n"));
        out.push_str(&self.kv("Timing delta", &format!("{} ms", diff.timing_delta_ms)));
        out.push_str(&self.kv("Same outcome", yes_no(diff.outcome_match)));
        out.push_str(&self.kv("Same payload", yes_no(diff.payloads_equal)));
        if !diff.differing_paths.is_empty() {
            out.push_str(&self.kv("Differs at", &diff.differing_paths.join(", ")));
        }
        out
    }

    pub(crate) fn render_history(&self, turns: &[Turn]) -> String {
        if turns.is_empty() {
            return self.info("No requests yet");
        }
        let mut table = self.table(vec!["#", "Id", "Query", "Outcome", "Elapsed"]);
        for turn in turns {
            table.add_row(vec![
                turn.index.to_string(),
                turn.request_id
                    .as_ref()
                    .map_or_else(|| "-".to_string(), ToString::to_string),
                turn.query.to_string(),
                reply_summary(&turn.reply),
                elapsed(&turn.reply),
            ]);
        }
        table.to_string()
    }

    fn table(&self, header: Vec<&str>) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(header);
        table
    }

    fn header(&self, text: &str) -> String {
        if self.colored {
            format!("{}\n", text.bright_cyan().bold())
        } else {
            format!("{text}\n")
        }
    }

    fn footer(&self, text: &str) -> String {
        if self.colored {
            text.bright_black().to_string()
        } else {
            text.to_string()
        }
    }

    fn info(&self, text: &str) -> String {
        if self.colored {
            text.bright_blue().to_string()
        } else {
            text.to_string()
        }
    }

    fn kv(&self, key: &str, value: &str) -> String {
        if self.colored {
            format!("  {}: {}\n", key.bright_green().bold(), value)
        } else {
            format!("  {key}: {value}\n")
        }
    }
}

/// Argument names from a schema-ish value
fn argument_summary(args: Option<&Value>) -> String {
    let names: Vec<&str> = match args {
        Some(Value::Object(map)) => match map.get("properties") {
            Some(Value::Object(props)) => props.keys().map(String::as_str).collect(),
            _ => map.keys().map(String::as_str).collect(),
        },
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|arg| arg.get("name").and_then(Value::as_str).or_else(|| arg.as_str()))
            .collect(),
        _ => Vec::new(),
    };
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

fn reply_summary(reply: &Reply) -> String {
    match reply {
        Reply::Pending => "pending".to_string(),
        Reply::Completed { .. } => "ok".to_string(),
        Reply::Failed {
            code: Some(code),
            message,
            ..
        } => format!("error {code}: {message}"),
        Reply::Failed { kind, message, .. } => format!("{kind}: {message}"),
        Reply::Abandoned => "abandoned".to_string(),
    }
}

fn elapsed(reply: &Reply) -> String {
    reply
        .elapsed_ms()
        .map_or_else(|| "-".to_string(), |ms| format!("{ms} ms"))
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strings verbatim, everything else as pretty JSON
fn body(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
