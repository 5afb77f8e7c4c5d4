//! Transport factory

use std::time::Duration;

use mcpsim_transport::{ClientTransport, PipeConfig, StreamConfig, TransportKind};

use crate::cli::{CompareArgs, Target};
use crate::error::{CliError, CliResult};

/// Which transport a target selects, if any
pub fn determine_transport(target: &Target) -> Option<TransportKind> {
    if target.command.is_some() {
        Some(TransportKind::Pipe)
    } else if target.url.is_some() {
        Some(TransportKind::Stream)
    } else {
        None
    }
}

/// Build the transport for a target
///
/// `timeout` bounds each HTTP POST for stream targets; `None` leaves the
/// transport default in place.
pub fn create_transport(target: &Target, timeout: Option<Duration>) -> CliResult<ClientTransport> {
    match determine_transport(target) {
        Some(TransportKind::Pipe) => Ok(ClientTransport::pipe(pipe_config(target)?)),
        Some(TransportKind::Stream) => {
            Ok(ClientTransport::stream(stream_config(target, timeout)?)?)
        }
        None => Err(CliError::InvalidArguments(
            "no server selected: pass --command <program> or --url <url>".to_string(),
        )),
    }
}

/// Target of the second server in a comparison
///
/// Everything except the command, its arguments and the URL is inherited
/// from the first target.
pub fn right_target(left: &Target, compare: &CompareArgs) -> CliResult<Target> {
    let mut right = left.clone();
    match (&compare.right_command, &compare.right_url) {
        (Some(command), None) => {
            right.command = Some(command.clone());
            right.args = compare.right_args.clone();
            right.url = None;
            right.events_url = None;
        }
        (None, Some(url)) => {
            right.command = None;
            right.args.clear();
            right.url = Some(url.clone());
            right.events_url = None;
        }
        _ => {
            return Err(CliError::InvalidArguments(
                "compare needs the second server: pass --right-command or --right-url".to_string(),
            ));
        }
    }
    Ok(right)
}

fn pipe_config(target: &Target) -> CliResult<PipeConfig> {
    let command = target
        .command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CliError::InvalidArguments("empty --command".to_string()))?;

    let mut config = PipeConfig::new(command)
        .with_args(target.args.iter().cloned())
        .with_framing(target.framing);
    if let Some(cwd) = &target.cwd {
        config = config.with_cwd(cwd.clone());
    }
    for (key, value) in &target.env {
        config = config.with_env(key.clone(), value.clone());
    }
    Ok(config)
}

fn stream_config(target: &Target, timeout: Option<Duration>) -> CliResult<StreamConfig> {
    let url = target
        .url
        .clone()
        .ok_or_else(|| CliError::InvalidArguments("missing --url".to_string()))?;

    let mut config = StreamConfig::new(url);
    if let Some(events_url) = &target.events_url {
        config = config.with_events_url(events_url.clone());
    }
    for (name, value) in &target.headers {
        config = config.with_header(name.clone(), value.clone());
    }
    if let Some(token) = &target.auth_token {
        config = config.with_auth_token(token.clone());
    }
    if let Some(timeout) = timeout {
        config = config.with_request_timeout(timeout);
    }
    Ok(config)
}
