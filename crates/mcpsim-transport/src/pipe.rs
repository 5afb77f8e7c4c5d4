//! Pipe transport: framed JSON over the stdio of a spawned process.
//!
//! # Interior Mutability Pattern
//!
//! - **parking_lot::Mutex** for the stream source and task handles (never held across .await)
//! - **tokio::sync::Mutex** for the writer and the inbound channel (held across .await)
//! - **AtomicBool** for the open/closed flags
//! - **CancellationToken** to release a `send` blocked on a peer that stopped reading
//!
//! The writer mutex doubles as the send lock: one frame is fully written and
//! flushed before the next `send` can start.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::framing::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, Framing};
use crate::traits::{Transport, TransportKind};

type BoxedAsyncRead = Pin<Box<dyn AsyncRead + Send + Sync + 'static>>;
type BoxedAsyncWrite = Pin<Box<dyn AsyncWrite + Send + Sync + 'static>>;
type FrameWriter = FramedWrite<BoxedAsyncWrite, FrameCodec>;
type OpenedStreams = (BoxedAsyncRead, BoxedAsyncWrite, Framing, usize);

/// Inbound queue depth between the reader task and `receive`
const INBOUND_CAPACITY: usize = 1000;

/// How long `close` waits to flush and close the peer's stdin
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// How to launch the peer process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Program to run
    pub command: String,
    /// Program arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, inherited when unset
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Frame delimiting on stdin/stdout
    #[serde(default)]
    pub framing: Framing,
    /// Upper bound on a single frame
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_max_frame_length() -> usize {
    DEFAULT_MAX_FRAME_LENGTH
}

impl PipeConfig {
    /// Launch `command` with no arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            framing: Framing::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Append an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Choose the framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Bound the frame size
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    fn validate(&self) -> TransportResult<()> {
        if self.command.trim().is_empty() {
            return Err(TransportError::ConfigurationError(
                "pipe transport needs a command".to_string(),
            ));
        }
        if self.max_frame_length == 0 {
            return Err(TransportError::ConfigurationError(
                "max_frame_length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the byte streams come from
enum StreamSource {
    /// Spawn a process on open
    Command(PipeConfig),
    /// Pre-built streams (tests, in-process peers)
    Raw {
        reader: Option<BoxedAsyncRead>,
        writer: Option<BoxedAsyncWrite>,
        framing: Framing,
        max_frame_length: usize,
    },
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(config) => f.debug_tuple("Command").field(config).finish(),
            Self::Raw { framing, .. } => f
                .debug_struct("Raw")
                .field("framing", framing)
                .finish_non_exhaustive(),
        }
    }
}

/// Framed duplex channel over a child process's stdin/stdout
///
/// # Examples
///
/// ```rust,no_run
/// use mcpsim_transport::{PipeConfig, PipeTransport, Transport};
///
/// # async fn example() -> Result<(), mcpsim_transport::TransportError> {
/// let transport = PipeTransport::new(
///     PipeConfig::new("python3").with_arg("server.py"),
/// );
/// transport.open().await?;
/// transport.send(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.to_vec().into()).await?;
/// let reply = transport.receive().await?;
/// # Ok(())
/// # }
/// ```
pub struct PipeTransport {
    source: Mutex<StreamSource>,
    writer: TokioMutex<Option<FrameWriter>>,
    inbound: TokioMutex<Option<mpsc::Receiver<TransportResult<Bytes>>>>,
    child: TokioMutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    open: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    endpoint: String,
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("source", &*self.source.lock())
            .field("open", &self.open.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl PipeTransport {
    /// Create a transport that spawns the configured process on `open`
    pub fn new(config: PipeConfig) -> Self {
        let endpoint = format!("pipe://{}", config.command);
        Self::with_source(StreamSource::Command(config), endpoint)
    }

    /// Create a transport over existing streams
    ///
    /// `reader` is what the peer writes to (its stdout), `writer` is what it
    /// reads from (its stdin).
    pub fn from_raw<R, W>(reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
        W: AsyncWrite + Send + Sync + 'static,
    {
        Self::with_source(
            StreamSource::Raw {
                reader: Some(Box::pin(reader)),
                writer: Some(Box::pin(writer)),
                framing,
                max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            },
            "pipe://raw".to_string(),
        )
    }

    fn with_source(source: StreamSource, endpoint: String) -> Self {
        Self {
            source: Mutex::new(source),
            writer: TokioMutex::new(None),
            inbound: TokioMutex::new(None),
            child: TokioMutex::new(None),
            tasks: Mutex::new(Vec::new()),
            open: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            endpoint,
        }
    }

    /// Raw streams are handed out once; a command source yields its config
    fn take_source(&self) -> TransportResult<Result<OpenedStreams, PipeConfig>> {
        let mut source = self.source.lock();
        match &mut *source {
            StreamSource::Raw {
                reader,
                writer,
                framing,
                max_frame_length,
            } => {
                let reader = reader.take().ok_or_else(|| {
                    TransportError::ConfigurationError(
                        "Raw reader stream already consumed".to_string(),
                    )
                })?;
                let writer = writer.take().ok_or_else(|| {
                    TransportError::ConfigurationError(
                        "Raw writer stream already consumed".to_string(),
                    )
                })?;
                Ok(Ok((reader, writer, *framing, *max_frame_length)))
            }
            StreamSource::Command(config) => Ok(Err(config.clone())),
        }
    }

    /// Take the streams out of the source, spawning the process if needed
    async fn take_streams(&self) -> TransportResult<OpenedStreams> {
        let config = match self.take_source()? {
            Ok(streams) => return Ok(streams),
            Err(config) => config,
        };

        config.validate()?;
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!("failed to spawn '{}': {e}", config.command))
        })?;
        debug!(command = %config.command, pid = ?child.id(), "Spawned peer process");

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConfigurationError("Child process stdin was not piped".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConfigurationError("Child process stdout was not piped".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            self.tasks.lock().push(spawn_stderr_forwarder(stderr));
        }
        *self.child.lock().await = Some(child);

        Ok((
            Box::pin(stdout),
            Box::pin(stdin),
            config.framing,
            config.max_frame_length,
        ))
    }
}

/// Peer diagnostics go to the log, never into the protocol stream
fn spawn_stderr_forwarder<R>(stderr: R) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "mcpsim::peer", "{}", line);
        }
    })
}

/// Anything that cannot start a JSON document is peer output, not a frame
fn classify_frame(frame: Bytes) -> Option<TransportResult<Bytes>> {
    let first = frame.iter().find(|b| !b.is_ascii_whitespace())?;
    if matches!(first, b'{' | b'[') {
        Some(Ok(frame))
    } else {
        Some(Err(TransportError::NonProtocolOutput(
            String::from_utf8_lossy(&frame).trim().to_string(),
        )))
    }
}

fn spawn_reader<R>(
    reader: R,
    codec: FrameCodec,
    sender: mpsc::Sender<TransportResult<Bytes>>,
    open: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, codec);
        while let Some(result) = frames.next().await {
            let item = match result {
                Ok(frame) => {
                    trace!("Received frame: {} bytes", frame.len());
                    match classify_frame(frame) {
                        Some(item) => item,
                        None => continue,
                    }
                }
                Err(e) => {
                    error!("Pipe framing failed: {}", e);
                    let _ = sender.send(Err(e)).await;
                    break;
                }
            };
            if let Err(ref e) = item {
                warn!("Peer wrote non-protocol output: {}", e);
            }
            if sender.send(item).await.is_err() {
                debug!("Receive channel closed, stopping reader task");
                break;
            }
        }
        open.store(false, Ordering::Release);
        debug!("Pipe reader task completed");
    })
}

#[async_trait]
impl Transport for PipeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.open.load(Ordering::Acquire) {
            return Ok(());
        }

        let (reader, writer, framing, max_frame_length) = self.take_streams().await?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        *self.inbound.lock().await = Some(rx);
        *self.writer.lock().await = Some(FramedWrite::new(
            writer,
            FrameCodec::new(framing, max_frame_length),
        ));

        self.open.store(true, Ordering::Release);
        let handle = spawn_reader(
            reader,
            FrameCodec::new(framing, max_frame_length),
            tx,
            self.open.clone(),
        );
        self.tasks.lock().push(handle);

        debug!(endpoint = %self.endpoint, ?framing, "Pipe transport open");
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let size = frame.len();
        let write = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(TransportError::NotOpen)?;
            // `send` flushes, so the frame is on the pipe before the lock is released
            writer.send(frame).await.map_err(|e| match e {
                TransportError::Io(msg) => TransportError::ConnectionLost(msg),
                other => other,
            })
        };

        tokio::select! {
            result = write => result?,
            () = self.shutdown.cancelled() => return Err(TransportError::Closed),
        }

        trace!("Sent frame: {} bytes", size);
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        let receiver = inbound.as_mut().ok_or(TransportError::NotOpen)?;
        match receiver.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.open.store(false, Ordering::Release);
        self.shutdown.cancel();

        // Dropping the writer closes the peer's stdin, the polite way to ask it to exit
        let release = async {
            if let Some(mut writer) = self.writer.lock().await.take() {
                let _ = writer.close().await;
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, release).await.is_err() {
            debug!("Peer stdin did not drain within {:?}", CLOSE_GRACE);
            if let Ok(mut writer) = self.writer.try_lock() {
                writer.take();
            }
        }

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Peer process already gone: {}", e);
            }
        }

        debug!(endpoint = %self.endpoint, "Pipe transport closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn duplex_transport(framing: Framing) -> (PipeTransport, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(client);
        (PipeTransport::from_raw(read, write, framing), server)
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (transport, _server) = duplex_transport(Framing::Newline);
        let err = transport.send(Bytes::from_static(b"{}")).await.unwrap_err();
        assert_eq!(err, TransportError::NotOpen);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (transport, mut server) = duplex_transport(Framing::Newline);
        transport.open().await.unwrap();
        assert!(transport.is_open());

        transport
            .send(Bytes::from_static(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#))
            .await
            .unwrap();

        let mut buf = vec![0u8; 128];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(
            &buf[..n],
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n"
        );

        server
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[]}}\n")
            .await
            .unwrap();
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#);
    }

    #[tokio::test]
    async fn test_non_protocol_output_is_reported_not_parsed() {
        let (transport, mut server) = duplex_transport(Framing::Newline);
        transport.open().await.unwrap();

        server
            .write_all(b"Client connected: MCP Client Simulator 1.0.0\n\n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n")
            .await
            .unwrap();

        let err = transport.receive().await.unwrap_err();
        assert_eq!(
            err,
            TransportError::NonProtocolOutput("Client connected: MCP Client Simulator 1.0.0".into())
        );
        assert!(!err.is_fatal());

        // the blank line is skipped and the next frame still arrives
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"jsonrpc":"2.0","method":"x"}"#);
    }

    #[tokio::test]
    async fn test_peer_eof_ends_receive() {
        let (transport, server) = duplex_transport(Framing::Newline);
        transport.open().await.unwrap();
        drop(server);
        assert_eq!(transport.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_length_delimited_pipe() {
        let (transport, mut server) = duplex_transport(Framing::LengthDelimited);
        transport.open().await.unwrap();

        server.write_all(&[0, 0, 0, 2]).await.unwrap();
        server.write_all(b"{}").await.unwrap();
        assert_eq!(
            transport.receive().await.unwrap(),
            Some(Bytes::from_static(b"{}"))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _server) = duplex_transport(Framing::Newline);
        transport.open().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert_eq!(
            transport.send(Bytes::from_static(b"{}")).await.unwrap_err(),
            TransportError::Closed
        );
        assert_eq!(transport.open().await.unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn test_close_releases_a_send_the_peer_never_reads() {
        let (client, _server) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(client);
        let transport = Arc::new(PipeTransport::from_raw(read, write, Framing::Newline));
        transport.open().await.unwrap();

        let sending = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move {
                let frame = format!("{{\"pad\":\"{}\"}}", "x".repeat(10 * 1024));
                transport.send(Bytes::from(frame)).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sending.is_finished());

        tokio::time::timeout(Duration::from_secs(2), transport.close())
            .await
            .expect("close hung behind the blocked send")
            .unwrap();
        assert_eq!(sending.await.unwrap().unwrap_err(), TransportError::Closed);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_reported_and_reading_continues() {
        let (transport, mut server) = duplex_transport(Framing::Newline);
        transport.open().await.unwrap();

        server
            .write_all(b"\xff\xfe garbage\n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n")
            .await
            .unwrap();

        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::NonProtocolOutput(_)));
        assert!(!err.is_fatal());
        let frame = transport.receive().await.unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"jsonrpc":"2.0","method":"x"}"#);
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_failure() {
        let transport = PipeTransport::new(PipeConfig::new("/definitely/not/a/binary"));
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[test]
    fn test_empty_command_is_configuration_error() {
        let err = PipeConfig::new("  ").validate().unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[test]
    fn test_classify_frame() {
        assert!(classify_frame(Bytes::from_static(b"   ")).is_none());
        assert!(matches!(
            classify_frame(Bytes::from_static(b" {\"a\":1}")),
            Some(Ok(_))
        ));
        assert!(matches!(
            classify_frame(Bytes::from_static(b"INFO starting")),
            Some(Err(TransportError::NonProtocolOutput(_)))
        ));
    }
}
