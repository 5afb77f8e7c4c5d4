//! Incremental server-sent events parser.
//!
//! Chunks from an HTTP body arrive at arbitrary boundaries; [`SseParser`]
//! buffers until a blank line closes an event and hands back whole
//! [`SseEvent`]s in arrival order.

use bytes::{Buf, BytesMut};

/// One dispatched event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, `None` for the default "message" type
    pub event: Option<String>,
    /// Joined `data:` lines
    pub data: String,
    /// `id:` field
    pub id: Option<String>,
}

impl SseEvent {
    /// Event type with the SSE default applied
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Buffering parser fed with raw body chunks
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    current: SseEvent,
    has_data: bool,
    last_event_id: Option<String>,
}

impl SseParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `id:` seen on the stream
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed a chunk and collect every event it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let mut line = &raw[..pos];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event when the body ends without a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            let line = String::from_utf8_lossy(rest.chunk()).trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                self.current.id = Some(value.to_string());
                self.last_event_id = Some(value.to_string());
            }
            // retry and unknown fields
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.current);
        if !std::mem::take(&mut self.has_data) {
            return None;
        }
        Some(event)
    }
}
