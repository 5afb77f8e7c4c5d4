//! Multi-turn session tracking.
//!
//! A [`Session`] records (query, reply) pairs in **submission** order, no
//! matter in which order the replies arrive. The slot for a turn is reserved
//! when the query is submitted and filled when its outcome is known, so
//! concurrent traffic can neither drop nor duplicate a turn.
//!
//! Sessions belong to the caller and are independent of any connection: one
//! session may record turns from several connections, or from successive
//! connections to the same server. A request that dies with its connection
//! is recorded as failed.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mcpsim_protocol::{Error, ErrorKind, RequestId, Result};
use mcpsim_transport::Transport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::connection::Connection;
use crate::query::Query;

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    /// Submitted, no outcome yet
    Pending,
    /// The peer answered with a result
    Completed {
        /// Result payload
        value: Value,
        /// Time from submission to reply
        elapsed_ms: u64,
    },
    /// The request ended with an error
    Failed {
        /// Error classification
        kind: ErrorKind,
        /// Error message
        message: String,
        /// Peer error code, for error envelopes
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        /// Time from submission to failure
        elapsed_ms: u64,
    },
    /// The caller stopped waiting before an outcome was recorded
    Abandoned,
}

impl Reply {
    fn from_outcome(outcome: &Result<Value>, elapsed_ms: u64) -> Self {
        match outcome {
            Ok(value) => Self::Completed {
                value: value.clone(),
                elapsed_ms,
            },
            Err(err) => Self::Failed {
                kind: err.kind,
                message: err.message.clone(),
                code: err.rpc_code(),
                elapsed_ms,
            },
        }
    }

    /// True once an outcome is recorded
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Result payload of a completed turn
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Submission-to-outcome time, when known
    pub fn elapsed_ms(&self) -> Option<u64> {
        match self {
            Self::Completed { elapsed_ms, .. } | Self::Failed { elapsed_ms, .. } => {
                Some(*elapsed_ms)
            }
            Self::Pending | Self::Abandoned => None,
        }
    }
}

/// One (query, reply) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Position in the session, from 0
    pub index: usize,
    /// Connection the query went to
    pub connection: Uuid,
    /// What was asked
    pub query: Query,
    /// Wire identifier, once the request was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// Outcome
    pub reply: Reply,
}

/// Free-form note attached to a session or one of its turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Turn the note refers to; `None` for the session as a whole
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn: Option<usize>,
    /// Note text
    pub note: String,
    /// When the note was added
    pub timestamp: DateTime<Utc>,
}

/// Serializable copy of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identity
    pub id: Uuid,
    /// Turns in submission order
    pub turns: Vec<Turn>,
    /// Notes in the order they were added
    pub annotations: Vec<Annotation>,
}

#[derive(Debug)]
struct SessionInner {
    id: Uuid,
    turns: Mutex<Vec<Turn>>,
    annotations: Mutex<Vec<Annotation>>,
}

/// Ordered record of a conversation with one or more servers
///
/// Cheap to clone; clones share the same record.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Start an empty session
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                turns: Mutex::new(Vec::new()),
                annotations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Session identity
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Reserve the next turn for `query` sent over `connection`
    ///
    /// The returned ticket fills the turn in; dropping it unfilled records the
    /// turn as abandoned.
    pub fn begin(&self, connection: Uuid, query: Query) -> Ticket {
        let mut turns = self.inner.turns.lock();
        let index = turns.len();
        turns.push(Turn {
            index,
            connection,
            query,
            request_id: None,
            submitted_at: Utc::now(),
            reply: Reply::Pending,
        });
        trace!(session = %self.inner.id, index, "Turn reserved");
        Ticket {
            session: Arc::clone(&self.inner),
            index,
            started: Instant::now(),
            settled: false,
        }
    }

    /// Submit `query` on `connection` and record the exchange
    ///
    /// The turn is reserved before this returns, so the order of `track`
    /// calls is the order of turns even when the futures run concurrently.
    pub fn track<T: Transport + 'static>(
        &self,
        connection: &Connection<T>,
        query: Query,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let mut ticket = self.begin(connection.id(), query.clone());
        let connection = connection.clone();
        async move {
            let outcome = match connection.start(&query).await {
                Ok(call) => {
                    ticket.set_request_id(call.id().clone());
                    call.wait().await
                }
                Err(err) => {
                    if let Some(id) = &err.request_id {
                        ticket.set_request_id(id.clone());
                    }
                    Err(err)
                }
            };
            ticket.complete(&outcome);
            outcome
        }
    }

    /// Attach a note to the session (`turn: None`) or to one turn
    pub fn annotate(&self, turn: Option<usize>, note: impl Into<String>) -> Result<()> {
        if let Some(index) = turn
            && index >= self.inner.turns.lock().len()
        {
            return Err(Error::invalid_state(format!(
                "session has no turn {index}"
            )));
        }
        self.inner.annotations.lock().push(Annotation {
            turn,
            note: note.into(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Turns in submission order
    pub fn turns(&self) -> Vec<Turn> {
        self.inner.turns.lock().clone()
    }

    /// One turn
    pub fn turn(&self, index: usize) -> Option<Turn> {
        self.inner.turns.lock().get(index).cloned()
    }

    /// Notes in the order they were added
    pub fn annotations(&self) -> Vec<Annotation> {
        self.inner.annotations.lock().clone()
    }

    /// Number of turns
    pub fn len(&self) -> usize {
        self.inner.turns.lock().len()
    }

    /// True when no turn was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the whole session for serialization
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.inner.id,
            turns: self.turns(),
            annotations: self.annotations(),
        }
    }
}

/// Reserved turn waiting for its outcome
#[derive(Debug)]
pub struct Ticket {
    session: Arc<SessionInner>,
    index: usize,
    started: Instant,
    settled: bool,
}

impl Ticket {
    /// Position of the reserved turn
    pub fn index(&self) -> usize {
        self.index
    }

    /// Record the wire identifier of the request
    pub fn set_request_id(&mut self, id: RequestId) {
        if let Some(turn) = self.session.turns.lock().get_mut(self.index) {
            turn.request_id = Some(id);
        }
    }

    /// Record the outcome
    pub fn complete(mut self, outcome: &Result<Value>) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.settle(Reply::from_outcome(outcome, elapsed_ms));
    }

    fn settle(&mut self, reply: Reply) {
        if let Some(turn) = self.session.turns.lock().get_mut(self.index) {
            turn.reply = reply;
        }
        self.settled = true;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Reply::Abandoned);
        }
    }
}
