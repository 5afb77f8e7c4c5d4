//! Operator console
//!
//! One task owns the input stream and hands out lines on demand. A sampling
//! question asked while the REPL is waiting for its next command takes the
//! next line first, so the operator can answer it without leaving the REPL.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use mcpsim_client::sampling::{ApprovalAuthority, AuthorityError};
use mcpsim_protocol::types::{SamplingRequest, Verdict};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Line or end of input
type LineReply = oneshot::Sender<Option<String>>;

#[derive(Debug)]
enum Demand {
    /// Answer to a question; served before commands
    Answer(LineReply),
    /// Next REPL command
    Command(LineReply),
}

/// Line-oriented operator input
#[derive(Debug)]
pub struct Console {
    demands: mpsc::UnboundedSender<Demand>,
    reader: JoinHandle<()>,
}

impl Console {
    /// Console over standard input
    pub fn stdin() -> Self {
        Self::new(tokio::io::BufReader::new(tokio::io::stdin()))
    }

    /// Console over any buffered reader
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (demands, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(serve_lines(reader, rx));
        Self { demands, reader }
    }

    /// Print `prompt` and read the next command line; `None` at end of input
    pub async fn read_command(&self, prompt: &str) -> Option<String> {
        show(prompt);
        self.demand(Demand::Command).await
    }

    /// Print `question` and read the answer ahead of any pending command
    pub async fn ask(&self, question: &str) -> Option<String> {
        show(question);
        self.demand(Demand::Answer).await
    }

    async fn demand(&self, kind: fn(LineReply) -> Demand) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.demands.send(kind(tx)).ok()?;
        rx.await.ok().flatten()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn show(text: &str) {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "{text}");
    let _ = stderr.flush();
}

async fn serve_lines<R>(mut reader: R, mut demands: mpsc::UnboundedReceiver<Demand>)
where
    R: AsyncBufRead + Unpin,
{
    let mut answers: VecDeque<LineReply> = VecDeque::new();
    let mut commands: VecDeque<LineReply> = VecDeque::new();
    let mut eof = false;

    loop {
        while let Ok(demand) = demands.try_recv() {
            enqueue(demand, &mut answers, &mut commands);
        }
        if answers.is_empty() && commands.is_empty() {
            match demands.recv().await {
                Some(demand) => enqueue(demand, &mut answers, &mut commands),
                None => return,
            }
            continue;
        }

        let line = if eof {
            None
        } else {
            let mut buf = String::new();
            match reader.read_line(&mut buf).await {
                Ok(0) | Err(_) => {
                    eof = true;
                    None
                }
                Ok(_) => Some(buf.trim_end_matches(['\r', '\n']).to_string()),
            }
        };

        // a question asked during the read takes this line
        while let Ok(demand) = demands.try_recv() {
            enqueue(demand, &mut answers, &mut commands);
        }
        let mut line = Some(line);
        while let Some(waiter) = answers.pop_front().or_else(|| commands.pop_front()) {
            match waiter.send(line.take().flatten()) {
                Ok(()) => break,
                Err(unclaimed) => line = Some(unclaimed),
            }
        }
        if line.is_some() {
            debug!("input line had no reader");
        }
    }
}

fn enqueue(demand: Demand, answers: &mut VecDeque<LineReply>, commands: &mut VecDeque<LineReply>) {
    match demand {
        Demand::Answer(tx) => answers.push_back(tx),
        Demand::Command(tx) => commands.push_back(tx),
    }
}

/// Approval authority that asks the operator on the console
#[derive(Debug)]
pub struct ConsoleAuthority {
    console: Arc<Console>,
}

impl ConsoleAuthority {
    pub fn new(console: Arc<Console>) -> Self {
        Self { console }
    }
}

#[async_trait]
impl ApprovalAuthority for ConsoleAuthority {
    async fn decide(&self, request: SamplingRequest) -> Result<Verdict, AuthorityError> {
        show(&describe(&request));

        let answer = self
            .console
            .ask("Approve this sampling request? [y/N] ")
            .await
            .ok_or("input closed before a verdict")?;
        if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            let reason = self
                .console
                .ask("Reason for denial (empty for default): ")
                .await
                .unwrap_or_default();
            let reason = reason.trim();
            return Ok(Verdict::Deny(if reason.is_empty() {
                "denied by operator".to_string()
            } else {
                reason.to_string()
            }));
        }

        let text = self
            .console
            .ask("Response text: ")
            .await
            .ok_or("input closed before a response")?;
        Ok(Verdict::Approve(json!({
            "role": "assistant",
            "content": {"type": "text", "text": text},
            "model": "human-operator",
            "stopReason": "endTurn"
        })))
    }
}

/// Summary of a sampling request for the operator
fn describe(request: &SamplingRequest) -> String {
    let params = &request.params;
    let mut out = format!("\nSampling request {} from the server\n", request.id);
    if let Some(system) = &params.system_prompt {
        out.push_str(&format!("  system: {system}\n"));
    }
    if let Some(max) = params.max_tokens {
        out.push_str(&format!("  max tokens: {max}\n"));
    }
    for message in &params.messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("?");
        let text = message
            .get("content")
            .and_then(|c| c.get("text").and_then(Value::as_str).or_else(|| c.as_str()))
            .map_or_else(
                || message.get("content").map(Value::to_string).unwrap_or_default(),
                str::to_string,
            );
        out.push_str(&format!("  {role}: {text}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpsim_protocol::RequestId;
    use pretty_assertions::assert_eq;

    fn request() -> SamplingRequest {
        serde_json::from_value(json!({
            "id": 5,
            "params": {
                "messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}],
                "maxTokens": 16
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_commands_read_in_order_then_eof() {
        let console = Console::new(&b"list tools\nexit\n"[..]);
        assert_eq!(console.read_command("> ").await.as_deref(), Some("list tools"));
        assert_eq!(console.read_command("> ").await.as_deref(), Some("exit"));
        assert_eq!(console.read_command("> ").await, None);
        assert_eq!(console.ask("? ").await, None);
    }

    #[tokio::test]
    async fn test_approval_returns_operator_text() {
        let console = Arc::new(Console::new(&b"y\nfour\n"[..]));
        let verdict = ConsoleAuthority::new(console).decide(request()).await.unwrap();
        match verdict {
            Verdict::Approve(content) => {
                assert_eq!(content["content"]["text"], json!("four"));
                assert_eq!(content["role"], json!("assistant"));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_anything_but_yes_denies() {
        let console = Arc::new(Console::new(&b"n\n\n"[..]));
        let verdict = ConsoleAuthority::new(console).decide(request()).await.unwrap();
        assert_eq!(verdict, Verdict::Deny("denied by operator".to_string()));

        let console = Arc::new(Console::new(&b"maybe\ntoo expensive\n"[..]));
        let verdict = ConsoleAuthority::new(console).decide(request()).await.unwrap();
        assert_eq!(verdict, Verdict::Deny("too expensive".to_string()));
    }

    #[tokio::test]
    async fn test_closed_input_is_an_authority_failure() {
        let console = Arc::new(Console::new(&b""[..]));
        assert!(ConsoleAuthority::new(console).decide(request()).await.is_err());
    }

    #[test]
    fn test_description_lists_messages() {
        let text = describe(&request());
        assert!(text.contains(&format!("Sampling request {}", RequestId::Number(5))));
        assert!(text.contains("max tokens: 16"));
        assert!(text.contains("user: hi"));
    }
}
