//! Core `Connection` implementation.
//!
//! # Architecture
//!
//! `Connection<T>` is a cheaply cloneable handle over `Arc<ConnectionInner<T>>`:
//!
//! - **watch channel** for the lifecycle state (observable, atomically transitioned)
//! - **OnceLock** for the negotiated capabilities (set exactly once)
//! - **AtomicI64** for the identifier counter
//!
//! Sends take no connection-wide lock: the transport keeps frames whole.
//!
//! One reader task per connection consumes `transport.receive()` and routes
//! every inbound envelope (see `dispatcher.rs`); a sweep task expires
//! overdue requests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mcpsim_protocol::codec;
use mcpsim_protocol::types::{InitializeParams, InitializeResult, Implementation};
use mcpsim_protocol::{
    CapabilitySet, Envelope, Error, JsonRpcNotification, JsonRpcRequest, RequestId, Result,
    feature, methods, negotiate,
};
use mcpsim_transport::Transport;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::correlator::{Completion, Correlator};
use crate::events::{AnomalyKind, Event, EventKind, EventSink, Outcome};
use crate::query::Query;
use crate::sampling::{ApprovalAuthority, SamplingRelay};
use crate::state::ConnectionState;

/// Shared connection state
pub(crate) struct ConnectionInner<T: Transport + 'static> {
    pub(crate) id: Uuid,
    pub(crate) transport: Arc<T>,
    pub(crate) config: ConnectionConfig,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) correlator: Correlator,
    pub(crate) capabilities: OnceLock<CapabilitySet>,
    pub(crate) server_info: OnceLock<Option<Implementation>>,
    next_id: AtomicI64,
    pub(crate) events: EventSink,
    pub(crate) relay: SamplingRelay,
    pub(crate) notification_subscribers: Mutex<Vec<mpsc::UnboundedSender<JsonRpcNotification>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Drop for ConnectionInner<T> {
    fn drop(&mut self) {
        // Stop background work when the last handle goes away
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// One logical session with a server, bound to one transport
///
/// # Clone Pattern
///
/// Cloning is cheap and every clone drives the same connection, so requests
/// can be issued concurrently from several tasks:
///
/// ```rust,no_run
/// use mcpsim_client::{Connection, ConnectionConfig};
/// use mcpsim_transport::{PipeConfig, PipeTransport};
///
/// # async fn example() -> mcpsim_protocol::Result<()> {
/// let transport = PipeTransport::new(PipeConfig::new("python3").with_arg("server.py"));
/// let connection = Connection::new(transport, ConnectionConfig::default());
/// connection.connect().await?;
///
/// let other = connection.clone();
/// let tools = tokio::spawn(async move { other.list_tools().await });
/// let prompts = connection.list_prompts().await?;
/// let tools = tools.await.expect("task panicked")?;
/// println!("{} prompts, {} tools", prompts.len(), tools.len());
///
/// connection.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection<T: Transport + 'static> {
    pub(crate) inner: Arc<ConnectionInner<T>>,
}

impl<T: Transport + 'static> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport + 'static> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .field("transport", &self.inner.transport)
            .field("pending", &self.inner.correlator.len())
            .finish_non_exhaustive()
    }
}

/// A submitted request that has not been awaited yet
///
/// Dropping a `Call` does not cancel the request; its outcome is discarded
/// when it arrives.
#[derive(Debug)]
pub struct Call<T: Transport + 'static> {
    connection: Connection<T>,
    completion: Completion,
}

impl<T: Transport + 'static> Call<T> {
    /// Identifier on the wire
    pub fn id(&self) -> &RequestId {
        self.completion.id()
    }

    /// Cancel the request; `false` when it had already settled
    pub fn cancel(&self) -> bool {
        self.connection.cancel(self.completion.id())
    }

    /// Wait for the reply
    pub async fn wait(self) -> Result<Value> {
        self.completion.wait().await
    }
}

impl<T: Transport + 'static> Connection<T> {
    /// Create a disconnected connection over `transport`
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        let id = Uuid::new_v4();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let events = EventSink::new(id, config.event_buffer);

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                transport: Arc::new(transport),
                config,
                state,
                correlator: Correlator::new(),
                capabilities: OnceLock::new(),
                server_info: OnceLock::new(),
                next_id: AtomicI64::new(1),
                events,
                relay: SamplingRelay::default(),
                notification_subscribers: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connection identity stamped on events
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observe lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Effective capability set, once negotiated
    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.inner.capabilities.get()
    }

    /// Identity the server reported during negotiation
    pub fn server_info(&self) -> Option<&Implementation> {
        self.inner.server_info.get().and_then(Option::as_ref)
    }

    /// Configuration in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Number of outstanding requests
    pub fn pending(&self) -> usize {
        self.inner.correlator.len()
    }

    /// Receive every event emitted from now on
    pub fn subscribe_events(&self, buffer: usize) -> mpsc::Receiver<Event> {
        self.inner.events.subscribe(buffer)
    }

    /// Up to `limit` most recent events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.inner.events.recent(limit)
    }

    /// Receive server notifications in wire order
    pub fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<JsonRpcNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.notification_subscribers.lock().push(tx);
        rx
    }

    /// Install (or with `None`, remove) the authority deciding sampling requests
    ///
    /// Without an authority every sampling request is answered with
    /// "Sampling not supported".
    pub fn set_approval_authority(&self, authority: Option<Arc<dyn ApprovalAuthority>>) {
        self.inner.relay.set_authority(authority);
    }

    /// Whether an approval authority is installed
    pub fn has_approval_authority(&self) -> bool {
        self.inner.relay.has_authority()
    }

    /// Open the transport and negotiate capabilities
    ///
    /// Returns the effective capability set. On any failure the connection
    /// ends up `Failed` and the transport is closed.
    pub async fn connect(&self) -> Result<CapabilitySet> {
        if !self.inner.transition(ConnectionState::Connecting) {
            return Err(Error::invalid_state(format!(
                "connect requires a disconnected connection (state: {})",
                self.state()
            )));
        }

        info!(connection = %self.inner.id, endpoint = ?self.inner.transport.endpoint(), "Connecting");
        if let Err(e) = self.inner.transport.open().await {
            let err = Error::from(e);
            self.inner.fail(format!("transport open failed: {err}")).await;
            return Err(err);
        }

        self.spawn_background_tasks();

        if !self.inner.transition(ConnectionState::Negotiating) {
            return Err(Error::invalid_state(format!(
                "connection left the handshake (state: {})",
                self.state()
            )));
        }

        match self.negotiate().await {
            Ok(effective) => Ok(effective),
            Err(err) => {
                self.inner.fail(format!("negotiation failed: {err}")).await;
                Err(err)
            }
        }
    }

    async fn negotiate(&self) -> Result<CapabilitySet> {
        let config = &self.inner.config;
        let params = serde_json::to_value(InitializeParams {
            capabilities: config.offer.clone(),
            client_info: config.client_info.clone(),
        })?;

        let deadline = Instant::now() + config.negotiation_timeout();
        let reply = self
            .submit(methods::INITIALIZE, Some(params), Some(deadline))
            .await?
            .wait()
            .await?;
        let result: InitializeResult = serde_json::from_value(reply)?;

        let effective = negotiate(&config.offer, &result.capabilities);
        if self.inner.capabilities.set(effective.clone()).is_err() {
            return Err(Error::internal("capabilities negotiated twice"));
        }
        let _ = self.inner.server_info.set(result.server_info.clone());

        if !self.inner.transition(ConnectionState::Ready) {
            return Err(Error::invalid_state(format!(
                "connection left the handshake (state: {})",
                self.state()
            )));
        }

        info!(
            connection = %self.inner.id,
            server = ?result.server_info,
            features = ?effective.features().collect::<Vec<_>>(),
            "Connection ready"
        );
        self.inner
            .send_envelope(JsonRpcNotification::new(methods::INITIALIZED, None).into())
            .await?;
        Ok(effective)
    }

    fn spawn_background_tasks(&self) {
        let reader = super::dispatcher::spawn_reader(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.transport),
        );
        let sweeper = spawn_sweeper(Arc::downgrade(&self.inner), self.inner.config.sweep_interval());
        let mut tasks = self.inner.tasks.lock();
        tasks.push(reader);
        tasks.push(sweeper);
    }

    /// Register and send one request without any state or capability check
    pub(crate) async fn submit(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Instant>,
    ) -> Result<Call<T>> {
        let inner = &self.inner;
        let id = RequestId::Number(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let completion = inner.correlator.register(id.clone(), method, deadline)?;

        // A failure that raced the registration has already drained the table
        let state = self.state();
        if state.is_terminal() || state == ConnectionState::Closing {
            inner.correlator.cancel(&id);
            return Err(
                Error::invalid_state(format!("connection is {state}")).with_request_id(id)
            );
        }

        let request = JsonRpcRequest::new(method, params, id.clone());
        if let Err(err) = inner.send_envelope(request.into()).await {
            // Only this request is affected unless the transport itself died
            let _ = inner.correlator.reject(&id, err.clone());
            return Err(err.with_request_id(id));
        }

        Ok(Call {
            connection: self.clone(),
            completion,
        })
    }

    /// Submit a query without waiting for its reply
    ///
    /// Requires `Ready` and, for feature methods, the matching negotiated
    /// capability. Either failure returns immediately without touching the
    /// transport.
    pub async fn start(&self, query: &Query) -> Result<Call<T>> {
        self.start_with_timeout(query, self.inner.config.request_timeout())
            .await
    }

    /// [`start`](Self::start) with an explicit deadline (`None` waits forever)
    pub async fn start_with_timeout(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> Result<Call<T>> {
        self.ensure_ready(&query.method)?;
        if let Some(feature) = query.feature() {
            self.ensure_capability(feature)?;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        self.submit(&query.method, query.params.clone(), deadline)
            .await
    }

    /// Submit a query and wait for its reply
    pub async fn invoke(&self, query: &Query) -> Result<Value> {
        self.start(query).await?.wait().await
    }

    /// [`invoke`](Self::invoke) with an explicit deadline
    pub async fn invoke_with_timeout(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.start_with_timeout(query, timeout).await?.wait().await
    }

    /// Cancel one outstanding request; `false` when it had already settled
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.inner.correlator.cancel(id) {
            Some(settled) => {
                debug!(connection = %self.inner.id, %id, "Request cancelled");
                self.inner.events.emit(EventKind::RequestAbandoned {
                    id: settled.id.clone(),
                    method: settled.method.clone(),
                    elapsed_ms: settled.elapsed_ms(),
                    outcome: Outcome::Cancelled,
                });
                true
            }
            None => false,
        }
    }

    pub(crate) fn ensure_ready(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "{operation} requires a ready connection (state: {state})"
            )))
        }
    }

    pub(crate) fn ensure_capability(&self, name: &str) -> Result<()> {
        match self.inner.capabilities.get() {
            Some(caps) if caps.supports(name) => Ok(()),
            _ => Err(Error::capability_not_supported(name)),
        }
    }

    /// Whether a feature was negotiated
    pub fn supports(&self, name: &str) -> bool {
        self.ensure_capability(name).is_ok()
    }

    /// Whether the server may send sampling requests on this connection
    pub fn sampling_enabled(&self) -> bool {
        self.supports(feature::SAMPLING)
    }

    /// Close the connection
    ///
    /// Pending requests fail with `Cancelled` before the transport is closed.
    /// Idempotent; closing a failed connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.transition(ConnectionState::Closing) {
            return Ok(());
        }

        let cancelled = inner
            .correlator
            .fail_all(&Error::cancelled("connection closed"));
        for settled in cancelled {
            inner.events.emit(EventKind::RequestAbandoned {
                id: settled.id.clone(),
                method: settled.method.clone(),
                elapsed_ms: settled.elapsed_ms(),
                outcome: Outcome::Cancelled,
            });
        }

        inner.stop_tasks();
        if let Err(e) = inner.transport.close().await {
            warn!(connection = %inner.id, "Transport close failed: {}", e);
        }
        inner.transition(ConnectionState::Closed);
        info!(connection = %inner.id, "Connection closed");
        Ok(())
    }

    /// Send `shutdown` when ready, then close
    pub async fn shutdown(&self) -> Result<()> {
        if self.state().is_ready() {
            let deadline = self
                .inner
                .config
                .request_timeout()
                .map(|t| Instant::now() + t);
            match self.submit(methods::SHUTDOWN, None, deadline).await {
                Ok(call) => {
                    if let Err(e) = call.wait().await {
                        debug!(connection = %self.inner.id, "Shutdown request failed: {}", e);
                    }
                }
                Err(e) => debug!(connection = %self.inner.id, "Shutdown request not sent: {}", e),
            }
        }
        self.close().await
    }
}

impl<T: Transport + 'static> ConnectionInner<T> {
    /// Apply a lifecycle transition if the state machine allows it
    ///
    /// The check, the update and the event emission happen under the watch
    /// channel's lock, so transitions are totally ordered in the event stream.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let events = &self.events;
        self.state.send_if_modified(|current| {
            // failure during an explicit close is just the close finishing
            if matches!(next, ConnectionState::Failed { .. })
                && *current == ConnectionState::Closing
            {
                return false;
            }
            if !current.can_transition_to(&next) {
                return false;
            }
            let from = std::mem::replace(current, next.clone());
            debug!(connection = %self.id, %from, to = %next, "State transition");
            events.emit(EventKind::StateChanged { from, to: next });
            true
        })
    }

    /// Drive the connection to `Failed`, once
    ///
    /// Every waiter receives the same transport error and a single anomaly
    /// records the failure.
    pub(crate) async fn fail(&self, reason: String) {
        if !self.transition(ConnectionState::Failed {
            reason: reason.clone(),
        }) {
            return;
        }
        error!(connection = %self.id, "Connection failed: {}", reason);

        let err = Error::transport(reason.clone());
        for settled in self.correlator.fail_all(&err) {
            self.events.emit(EventKind::RequestAbandoned {
                id: settled.id.clone(),
                method: settled.method.clone(),
                elapsed_ms: settled.elapsed_ms(),
                outcome: Outcome::Failed,
            });
        }
        self.events.emit(EventKind::Anomaly {
            anomaly: AnomalyKind::ConnectionFailed,
            detail: reason,
        });

        if let Err(e) = self.transport.close().await {
            debug!(connection = %self.id, "Transport close after failure: {}", e);
        }
        // The caller may itself be one of these tasks, so nothing may await after this
        self.stop_tasks();
    }

    fn stop_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Encode and write one envelope
    ///
    /// Concurrent calls are allowed; the transport keeps each frame whole.
    ///
    /// A fatal transport error fails the whole connection.
    pub(crate) async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let frame = codec::encode(&envelope)?;
        match self.transport.send(frame).await {
            Ok(()) => {
                self.events.emit(EventKind::EnvelopeSent {
                    envelope: envelope.kind().to_string(),
                    method: envelope.method().map(str::to_string),
                    id: envelope.id().cloned(),
                });
                Ok(())
            }
            Err(e) => {
                let fatal = e.is_fatal();
                let err = Error::from(e);
                if fatal {
                    self.fail(format!("send failed: {err}")).await;
                } else {
                    warn!(connection = %self.id, "Send failed: {}", err);
                }
                Err(err)
            }
        }
    }
}

/// Periodically expire overdue requests
fn spawn_sweeper<T: Transport + 'static>(
    inner: std::sync::Weak<ConnectionInner<T>>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.state.borrow().is_terminal() {
                break;
            }
            for settled in inner.correlator.expire_overdue(Instant::now()) {
                warn!(
                    connection = %inner.id,
                    id = %settled.id,
                    method = %settled.method,
                    "Request timed out after {}ms",
                    settled.elapsed_ms()
                );
                inner.events.emit(EventKind::RequestAbandoned {
                    id: settled.id.clone(),
                    method: settled.method.clone(),
                    elapsed_ms: settled.elapsed_ms(),
                    outcome: Outcome::Timeout,
                });
            }
        }
    })
}
