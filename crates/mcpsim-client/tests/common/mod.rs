//! In-memory peer for connection tests.
//!
//! `MockTransport` hands every outbound frame to the test as JSON and
//! delivers whatever the test injects as inbound frames, in order.

#![allow(dead_code)]

use std::sync::{Arc, Mutex as StdMutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mcpsim_client::{Connection, ConnectionConfig};
use mcpsim_transport::{Transport, TransportError, TransportKind, TransportResult};
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, mpsc};

#[derive(Debug)]
pub enum Inbound {
    Frame(Bytes),
    Error(TransportError),
    HangUp,
}

#[derive(Debug)]
pub struct MockTransport {
    outbound: mpsc::UnboundedSender<Value>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    open: AtomicBool,
    pub sends: Arc<AtomicUsize>,
    held: Held,
}

/// Method whose outbound frames stall until the gate opens
type Held = Arc<StdMutex<Option<(String, Arc<Notify>)>>>;

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn open(&self) -> TransportResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        let value: Value = serde_json::from_slice(&frame)
            .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
        let gate = self
            .held
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(method, _)| value["method"] == method.as_str())
            .map(|(_, gate)| Arc::clone(gate));
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.outbound
            .send(value)
            .map_err(|_| TransportError::ConnectionLost("peer gone".into()))
    }

    async fn receive(&self) -> TransportResult<Option<Bytes>> {
        match self.inbound.lock().await.recv().await {
            Some(Inbound::Frame(frame)) => Ok(Some(frame)),
            Some(Inbound::Error(err)) => Err(err),
            Some(Inbound::HangUp) | None => Ok(None),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> Option<String> {
        Some("mock://peer".to_string())
    }
}

/// Test side of a `MockTransport`
#[derive(Debug)]
pub struct Peer {
    sent: mpsc::UnboundedReceiver<Value>,
    inject: mpsc::UnboundedSender<Inbound>,
    sends: Arc<AtomicUsize>,
    held: Held,
}

/// Route client logs to the test harness; `RUST_LOG` selects what shows
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn mock_pair() -> (MockTransport, Peer) {
    init_tracing();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let sends = Arc::new(AtomicUsize::new(0));
    let held: Held = Arc::default();
    (
        MockTransport {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            open: AtomicBool::new(false),
            sends: Arc::clone(&sends),
            held: Arc::clone(&held),
        },
        Peer {
            sent: out_rx,
            inject: in_tx,
            sends,
            held,
        },
    )
}

impl Peer {
    /// Next envelope the client wrote
    pub async fn next_sent(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("client sent nothing")
            .expect("transport dropped")
    }

    /// Next envelope, which must be a request or notification for `method`
    pub async fn expect(&mut self, method: &str) -> Value {
        let envelope = self.next_sent().await;
        assert_eq!(envelope["method"], json!(method), "unexpected envelope {envelope}");
        envelope
    }

    /// Number of frames the client has written so far
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Stall the client's writes of `method` until the returned gate is notified
    ///
    /// Stands in for a transport write that takes a full server round trip.
    pub fn hold(&self, method: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.held.lock().unwrap() = Some((method.to_string(), Arc::clone(&gate)));
        gate
    }

    pub fn send_json(&self, value: Value) {
        self.send_raw(&value.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self
            .inject
            .send(Inbound::Frame(Bytes::copy_from_slice(text.as_bytes())));
    }

    pub fn reply(&self, id: &Value, result: Value) {
        self.send_json(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    pub fn reply_error(&self, id: &Value, code: i32, message: &str) {
        self.send_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }));
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send_json(json!({"jsonrpc": "2.0", "method": method, "params": params}));
    }

    pub fn request(&self, id: Value, method: &str, params: Value) {
        self.send_json(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}));
    }

    pub fn fail(&self, err: TransportError) {
        let _ = self.inject.send(Inbound::Error(err));
    }

    pub fn hang_up(&self) {
        let _ = self.inject.send(Inbound::HangUp);
    }
}

/// Capabilities of a server that supports everything
pub fn full_server() -> Value {
    json!({"resources": {}, "prompts": {}, "tools": {}, "sampling": {}})
}

/// Connect over a mock transport, answering the handshake with `server_caps`
pub async fn ready_connection(
    server_caps: Value,
    config: ConnectionConfig,
) -> (Connection<MockTransport>, Peer) {
    let (transport, mut peer) = mock_pair();
    let connection = Connection::new(transport, config);

    let connecting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.connect().await })
    };

    let init = peer.expect("initialize").await;
    assert_eq!(init["id"], json!(1));
    peer.reply(
        &init["id"],
        json!({
            "capabilities": server_caps,
            "serverInfo": {"name": "mock-server", "version": "1.0.0"}
        }),
    );
    peer.expect("notifications/initialized").await;
    connecting
        .await
        .expect("connect task panicked")
        .expect("connect failed");

    (connection, peer)
}
