//! Stream transport: HTTP POST outbound, server-sent events inbound.
//!
//! `open` subscribes to the event stream and waits for the response headers.
//! An `endpoint` event (plain path or `{"uri": ...}`) redirects subsequent
//! POSTs; every other event carrying data is an inbound frame. A POST answered
//! with a JSON or SSE body contributes its frames to the same inbound queue,
//! so `receive` sees one ordered sequence regardless of where a frame came from.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{TransportError, TransportResult};
use crate::sse::{SseEvent, SseParser};
use crate::traits::{Transport, TransportKind};

const SESSION_HEADER: &str = "mcp-session-id";
const INBOUND_CAPACITY: usize = 1000;
/// Bodies of failed POSTs are cut to this many bytes in errors
const ERROR_BODY_LIMIT: usize = 512;

/// Endpoints and headers for the stream transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Where frames are POSTed until the server announces another endpoint
    pub base_url: Url,
    /// Event stream to subscribe to, `base_url` when unset
    #[serde(default)]
    pub events_url: Option<Url>,
    /// Extra headers sent on every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Bearer token for the `Authorization` header
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Deadline for the response headers of one POST (or the event stream)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// `User-Agent` header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    format!("mcpsim/{}", env!("CARGO_PKG_VERSION"))
}

impl StreamConfig {
    /// Config posting to and listening on `base_url`
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            events_url: None,
            headers: BTreeMap::new(),
            auth_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }

    /// Listen for events on a separate URL
    pub fn with_events_url(mut self, url: Url) -> Self {
        self.events_url = Some(url);
        self
    }

    /// Add a header sent on every request
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Authenticate with a bearer token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Per-request timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Event stream URL with the default applied
    pub fn events_url(&self) -> &Url {
        self.events_url.as_ref().unwrap_or(&self.base_url)
    }

    fn header_map(&self) -> TransportResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::ConfigurationError(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::ConfigurationError(format!("invalid value for header {name}: {e}"))
            })?;
            headers.insert(name, value);
        }
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                TransportError::ConfigurationError(format!("invalid auth token: {e}"))
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

/// State shared with the background tasks
#[derive(Debug)]
struct Shared {
    base_url: Url,
    post_url: RwLock<Url>,
    session_id: RwLock<Option<String>>,
}

impl Shared {
    fn remember_session(&self, headers: &HeaderMap) {
        if let Some(sid) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut session = self.session_id.write();
            if session.as_deref() != Some(sid) {
                info!("Received session ID: {}", sid);
                *session = Some(sid.to_string());
            }
        }
    }

    fn session_header(&self) -> Option<HeaderValue> {
        self.session_id
            .read()
            .as_deref()
            .and_then(|sid| HeaderValue::from_str(sid).ok())
    }

    /// Accepts a bare path or `{"uri": "..."}`
    fn update_endpoint(&self, data: &str) -> TransportResult<()> {
        let raw = if data.trim_start().starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(data).map_err(|e| {
                TransportError::SerializationFailed(format!("invalid endpoint event: {e}"))
            })?;
            value
                .get("uri")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    TransportError::SerializationFailed(
                        "endpoint event without a uri".to_string(),
                    )
                })?
                .to_string()
        } else {
            data.trim().to_string()
        };

        let url = self.base_url.join(&raw).map_err(|e| {
            TransportError::SerializationFailed(format!("invalid endpoint '{raw}': {e}"))
        })?;
        info!("Discovered message endpoint: {}", url);
        *self.post_url.write() = url;
        Ok(())
    }
}

/// POST/SSE transport
///
/// # Examples
///
/// ```rust,no_run
/// use mcpsim_transport::{StreamConfig, StreamTransport, Transport};
///
/// # async fn example() -> Result<(), mcpsim_transport::TransportError> {
/// let url = "http://localhost:8080/mcp".parse().expect("valid url");
/// let transport = StreamTransport::new(StreamConfig::new(url).with_auth_token("secret"))?;
/// transport.open().await?;
/// # Ok(())
/// # }
/// ```
pub struct StreamTransport {
    config: StreamConfig,
    http: reqwest::Client,
    headers: HeaderMap,
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<TransportResult<Bytes>>>>,
    receiver: TokioMutex<Option<mpsc::Receiver<TransportResult<Bytes>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    open: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("base_url", &self.config.base_url.as_str())
            .field("events_url", &self.config.events_url().as_str())
            .field("post_url", &self.shared.post_url.read().as_str())
            .field("open", &self.open.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    /// Create a transport; nothing is contacted until `open`
    pub fn new(config: StreamConfig) -> TransportResult<Self> {
        let headers = config.header_map()?;
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

        let shared = Arc::new(Shared {
            base_url: config.base_url.clone(),
            post_url: RwLock::new(config.base_url.clone()),
            session_id: RwLock::new(None),
        });

        Ok(Self {
            config,
            http,
            headers,
            shared,
            sender: Mutex::new(None),
            receiver: TokioMutex::new(None),
            tasks: Mutex::new(Vec::new()),
            open: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }

    /// Session identifier assigned by the server, if any
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.read().clone()
    }

    /// Current POST target
    pub fn post_url(&self) -> Url {
        self.shared.post_url.read().clone()
    }

    fn request_headers(&self, accept: &'static str) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(header::ACCEPT, HeaderValue::from_static(accept));
        if let Some(sid) = self.shared.session_header() {
            headers.insert(SESSION_HEADER, sid);
        }
        headers
    }

    fn inbound_sender(&self) -> TransportResult<mpsc::Sender<TransportResult<Bytes>>> {
        self.sender.lock().clone().ok_or(TransportError::NotOpen)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn with_timeout<F>(&self, operation: &str, fut: F) -> TransportResult<reqwest::Response>
    where
        F: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_connect() => Err(TransportError::ConnectionFailed(e.to_string())),
            Ok(Err(e)) => Err(TransportError::SendFailed(e.to_string())),
            Err(_) => Err(TransportError::RequestTimeout {
                operation: operation.to_string(),
                timeout,
            }),
        }
    }
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Route one parsed event; `false` once the receiver is gone
async fn route_event(
    event: SseEvent,
    shared: &Shared,
    sender: &mpsc::Sender<TransportResult<Bytes>>,
) -> bool {
    match event.event_type() {
        "endpoint" => {
            if let Err(e) = shared.update_endpoint(&event.data) {
                warn!("Ignoring endpoint event: {}", e);
            }
            true
        }
        kind => {
            trace!(event = kind, "Received event: {} bytes", event.data.len());
            sender.send(Ok(Bytes::from(event.data))).await.is_ok()
        }
    }
}

async fn pump_event_stream(
    response: reqwest::Response,
    shared: Arc<Shared>,
    sender: mpsc::Sender<TransportResult<Bytes>>,
    open: Arc<AtomicBool>,
) {
    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();
    let reason = loop {
        match body.next().await {
            Some(Ok(chunk)) => {
                for event in parser.push(&chunk) {
                    if !route_event(event, &shared, &sender).await {
                        debug!("Receive channel closed, stopping event stream task");
                        open.store(false, Ordering::Release);
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                error!("Error reading event stream: {}", e);
                break format!("event stream failed: {e}");
            }
            None => break "event stream ended".to_string(),
        }
    };
    if let Some(event) = parser.finish() {
        route_event(event, &shared, &sender).await;
    }

    warn!("{}", reason);
    open.store(false, Ordering::Release);
    let _ = sender.send(Err(TransportError::ConnectionLost(reason))).await;
}

/// Forward frames carried in a POST response body
async fn drain_post_body(
    response: reqwest::Response,
    shared: Arc<Shared>,
    sender: mpsc::Sender<TransportResult<Bytes>>,
) {
    let content_type = content_type(&response);
    if content_type.contains("text/event-stream") {
        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.push(&chunk) {
                        if !route_event(event, &shared, &sender).await {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Error reading POST event stream: {}", e);
                    break;
                }
            }
        }
        if let Some(event) = parser.finish() {
            route_event(event, &shared, &sender).await;
        }
    } else {
        match response.bytes().await {
            Ok(body) if body.iter().all(u8::is_ascii_whitespace) => {}
            Ok(body) => {
                let _ = sender.send(Ok(body)).await;
            }
            Err(e) => warn!("Failed to read POST response body: {}", e),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.open.load(Ordering::Acquire) {
            return Ok(());
        }

        let url = self.config.events_url().clone();
        info!("Subscribing to event stream at {}", url);
        let request = self
            .http
            .get(url.clone())
            .headers(self.request_headers("text/event-stream"))
            .send();
        let response = self
            .with_timeout("GET event stream", request)
            .await
            .map_err(|e| match e {
                TransportError::SendFailed(msg) => TransportError::ConnectionFailed(msg),
                other => other,
            })?;

        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed(format!(
                "event stream at {url} answered {}",
                response.status()
            )));
        }
        self.shared.remember_session(response.headers());

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        *self.receiver.lock().await = Some(rx);
        *self.sender.lock() = Some(tx.clone());
        self.open.store(true, Ordering::Release);

        let handle = tokio::spawn(pump_event_stream(
            response,
            self.shared.clone(),
            tx,
            self.open.clone(),
        ));
        self.track(handle);

        debug!("Stream transport open");
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let sender = self.inbound_sender()?;
        let size = frame.len();
        let url = self.post_url();

        let request = self
            .http
            .post(url.clone())
            .headers(self.request_headers("application/json, text/event-stream"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(frame)
            .send();
        let response = self.with_timeout("POST", request).await?;
        self.shared.remember_session(response.headers());

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        trace!(%url, status = status.as_u16(), "Posted frame: {} bytes", size);

        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }

        // Long-lived SSE bodies must not hold up the caller
        let handle = tokio::spawn(drain_post_body(response, self.shared.clone(), sender));
        self.track(handle);
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<Bytes>> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or(TransportError::NotOpen)?;
        match receiver.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let was_open = self.open.swap(false, Ordering::AcqRel);

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        // The receiver drains what is queued, then sees the end of the channel
        self.sender.lock().take();

        if was_open && let Some(sid) = self.shared.session_header() {
            let mut headers = self.headers.clone();
            headers.insert(SESSION_HEADER, sid);
            let request = self
                .http
                .delete(self.config.base_url.clone())
                .headers(headers)
                .send();
            if let Err(e) = self.with_timeout("DELETE session", request).await {
                debug!("Session termination failed: {}", e);
            }
        }

        debug!("Stream transport closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.config.base_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn shared(base: &str) -> Shared {
        Shared {
            base_url: url(base),
            post_url: RwLock::new(url(base)),
            session_id: RwLock::new(None),
        }
    }

    #[test]
    fn test_endpoint_event_plain_path() {
        let shared = shared("http://localhost:8080/sse");
        shared.update_endpoint("/messages?session=abc").unwrap();
        assert_eq!(
            shared.post_url.read().as_str(),
            "http://localhost:8080/messages?session=abc"
        );
    }

    #[test]
    fn test_endpoint_event_json() {
        let shared = shared("http://localhost:8080/sse");
        shared
            .update_endpoint(r#"{"uri":"http://other:9000/mcp"}"#)
            .unwrap();
        assert_eq!(shared.post_url.read().as_str(), "http://other:9000/mcp");
        assert!(shared.update_endpoint(r#"{"path":"/x"}"#).is_err());
    }

    #[test]
    fn test_invalid_header_is_configuration_error() {
        let config = StreamConfig::new(url("http://localhost")).with_header("bad header", "x");
        let err = StreamTransport::new(config).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[test]
    fn test_config_defaults() {
        let config: StreamConfig =
            serde_json::from_str(r#"{"base_url":"http://localhost:3000/mcp"}"#).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.events_url().as_str(), "http://localhost:3000/mcp");
        assert!(config.user_agent.starts_with("mcpsim/"));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let transport = StreamTransport::new(StreamConfig::new(url("http://localhost:1"))).unwrap();
        let err = transport.send(Bytes::from_static(b"{}")).await.unwrap_err();
        assert_eq!(err, TransportError::NotOpen);
    }
}
