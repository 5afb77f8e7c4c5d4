//! Structured event sink.
//!
//! Every connection emits [`Event`]s for state transitions, each envelope it
//! sends or receives, and anomalies. Events carry a per-connection sequence
//! number and timestamp, and are handed to subscribers in emission order.
//! A bounded ring of recent events is kept for inspection.
//!
//! Subscribers get a bounded channel. When one falls behind, events for it
//! are dropped and counted; the count is delivered to it as an
//! [`AnomalyKind::EventsLost`] event ahead of the next event that fits.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use mcpsim_protocol::RequestId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::ConnectionState;

/// One emitted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in this connection's event sequence, from 1
    pub sequence: u64,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Connection that emitted the event
    pub connection: Uuid,
    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// Lifecycle transition
    StateChanged {
        /// Previous state
        from: ConnectionState,
        /// New state
        to: ConnectionState,
    },
    /// An envelope went out
    EnvelopeSent {
        /// request, response, error or notification
        envelope: String,
        /// Method, for requests and notifications
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        /// Identifier, when the envelope has one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
    },
    /// An envelope came in
    EnvelopeReceived {
        /// request, response, error or notification
        envelope: String,
        /// Method of the envelope, or of the request a reply answers
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        /// Identifier, when the envelope has one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        /// Time since the answered request was submitted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
        /// How the answered request ended
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<Outcome>,
    },
    /// A request ended without a reply
    RequestAbandoned {
        /// Request identifier
        id: RequestId,
        /// Request method
        method: String,
        /// Time since submission
        elapsed_ms: u64,
        /// Timeout, cancellation or connection failure
        outcome: Outcome,
    },
    /// Something that should not have happened
    Anomaly {
        /// Classification
        anomaly: AnomalyKind,
        /// Human-readable detail
        detail: String,
    },
}

/// Terminal outcome of a request, as recorded in events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Result envelope
    Success,
    /// Error envelope
    Error,
    /// Deadline passed
    Timeout,
    /// Cancelled by the caller or by close
    Cancelled,
    /// Connection failed underneath it
    Failed,
}

/// Anomaly classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Reply for an identifier that is not outstanding
    UnknownResponseId,
    /// Server request reusing an identifier still being handled
    DuplicateRequestId,
    /// Frame that is not a valid envelope
    UndecodableFrame,
    /// Non-protocol bytes on the protocol channel
    NonProtocolOutput,
    /// Envelope that cannot be attributed to anything
    UnexpectedEnvelope,
    /// A transport error that did not end the connection
    TransportWarning,
    /// The connection failed; recorded once
    ConnectionFailed,
    /// Events dropped for a slow subscriber
    EventsLost {
        /// How many
        count: u64,
    },
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<Event>,
    lost: u64,
}

#[derive(Debug)]
struct SinkState {
    sequence: u64,
    recent: VecDeque<Event>,
    subscribers: Vec<Subscriber>,
}

/// Per-connection event sink
#[derive(Debug)]
pub struct EventSink {
    connection: Uuid,
    capacity: usize,
    state: Mutex<SinkState>,
}

impl EventSink {
    /// Create a sink for `connection` keeping `capacity` recent events
    pub fn new(connection: Uuid, capacity: usize) -> Self {
        Self {
            connection,
            capacity,
            state: Mutex::new(SinkState {
                sequence: 0,
                recent: VecDeque::with_capacity(capacity.min(4096)),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Connection identity stamped on every event
    pub fn connection(&self) -> Uuid {
        self.connection
    }

    /// Receive every event emitted from now on through a channel of `buffer` slots
    pub fn subscribe(&self, buffer: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.state.lock().subscribers.push(Subscriber { tx, lost: 0 });
        rx
    }

    /// Up to `limit` most recent events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let state = self.state.lock();
        let skip = state.recent.len().saturating_sub(limit);
        state.recent.iter().skip(skip).cloned().collect()
    }

    /// Emit one event
    ///
    /// Sequence assignment and delivery happen under one lock, so every
    /// subscriber sees events in sequence order. A loss report takes a
    /// sequence number of its own ahead of the event that carries it, so the
    /// ring and other subscribers see a gap there.
    pub fn emit(&self, kind: EventKind) {
        tracing::trace!(connection = %self.connection, ?kind, "event");

        let connection = self.connection;
        let timestamp = Utc::now();
        let mut guard = self.state.lock();
        let SinkState {
            sequence,
            recent,
            subscribers,
        } = &mut *guard;

        subscribers.retain_mut(|sub| report_losses(sub, sequence, connection, timestamp));

        *sequence += 1;
        let event = Event {
            sequence: *sequence,
            timestamp,
            connection,
            kind,
        };

        if self.capacity > 0 {
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        subscribers.retain_mut(|sub| deliver(sub, &event));
    }
}

/// Tell a subscriber how many events it missed; `false` once it is gone
fn report_losses(
    sub: &mut Subscriber,
    sequence: &mut u64,
    connection: Uuid,
    timestamp: DateTime<Utc>,
) -> bool {
    use mpsc::error::TrySendError;

    if sub.lost == 0 {
        return true;
    }
    let permit = match sub.tx.try_reserve() {
        Ok(permit) => permit,
        Err(TrySendError::Full(())) => return true,
        Err(TrySendError::Closed(())) => return false,
    };
    *sequence += 1;
    permit.send(Event {
        sequence: *sequence,
        timestamp,
        connection,
        kind: EventKind::Anomaly {
            anomaly: AnomalyKind::EventsLost { count: sub.lost },
            detail: format!("{} event(s) dropped for a slow subscriber", sub.lost),
        },
    });
    sub.lost = 0;
    true
}

/// Returns `false` once the subscriber is gone
fn deliver(sub: &mut Subscriber, event: &Event) -> bool {
    use mpsc::error::TrySendError;

    // Nothing overtakes a pending loss report
    if sub.lost > 0 {
        sub.lost += 1;
        return !sub.tx.is_closed();
    }
    match sub.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            sub.lost += 1;
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
