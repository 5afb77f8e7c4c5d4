//! Request/response correlation.
//!
//! The [`Correlator`] owns the pending-request table of one connection. Each
//! registered identifier gets exactly one terminal transition (resolve,
//! reject, cancel or expire); the entry is removed in the same critical
//! section that fires its completion slot, so no identifier can be settled
//! twice.

use std::collections::HashMap;
use std::time::Duration;

use mcpsim_protocol::{Error, RequestId, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug)]
struct PendingRequest {
    method: String,
    submitted_at: Instant,
    deadline: Option<Instant>,
    slot: oneshot::Sender<Result<Value>>,
}

/// A request that reached its terminal transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    /// Request identifier
    pub id: RequestId,
    /// Request method
    pub method: String,
    /// Time from registration to settlement
    pub elapsed: Duration,
}

impl Settled {
    /// Elapsed time in whole milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Handle resolved when the request settles
#[derive(Debug)]
pub struct Completion {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl Completion {
    /// Identifier this handle waits on
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> Result<Value> {
        let id = self.id;
        match self.rx.await {
            Ok(outcome) => outcome.map_err(|e| e.with_request_id(id)),
            Err(_) => Err(Error::cancelled("request dropped without an outcome").with_request_id(id)),
        }
    }
}

/// Pending-request table
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl Correlator {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`
    ///
    /// Fails with a protocol violation when `id` is already outstanding.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
        deadline: Option<Instant>,
    ) -> Result<Completion> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(Error::protocol_violation(format!(
                "request id {id} is already outstanding"
            ))
            .with_request_id(id));
        }
        let (slot, rx) = oneshot::channel();
        pending.insert(
            id.clone(),
            PendingRequest {
                method: method.into(),
                submitted_at: Instant::now(),
                deadline,
                slot,
            },
        );
        Ok(Completion { id, rx })
    }

    fn settle(&self, id: &RequestId, outcome: Result<Value>) -> Result<Settled> {
        let entry = self.pending.lock().remove(id).ok_or_else(|| {
            Error::protocol_violation(format!("no outstanding request with id {id}"))
                .with_request_id(id.clone())
        })?;
        let settled = Settled {
            id: id.clone(),
            method: entry.method,
            elapsed: entry.submitted_at.elapsed(),
        };
        // the waiter may have gone away; the transition still counts
        let _ = entry.slot.send(outcome);
        Ok(settled)
    }

    /// Complete `id` with a result
    pub fn resolve(&self, id: &RequestId, result: Value) -> Result<Settled> {
        self.settle(id, Ok(result))
    }

    /// Complete `id` with an error
    pub fn reject(&self, id: &RequestId, error: Error) -> Result<Settled> {
        self.settle(id, Err(error))
    }

    /// Cancel `id`; `None` when it already settled
    pub fn cancel(&self, id: &RequestId) -> Option<Settled> {
        self.settle(id, Err(Error::cancelled("request cancelled")))
            .ok()
    }

    /// Expire every request whose deadline is at or before `now`
    pub fn expire_overdue(&self, now: Instant) -> Vec<Settled> {
        let mut pending = self.pending.lock();
        let overdue: Vec<RequestId> = pending
            .iter()
            .filter(|(_, req)| req.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        overdue
            .into_iter()
            .filter_map(|id| {
                let entry = pending.remove(&id)?;
                let elapsed = now.saturating_duration_since(entry.submitted_at);
                let _ = entry.slot.send(Err(Error::timeout(format!(
                    "{} timed out after {}ms",
                    entry.method,
                    elapsed.as_millis()
                ))));
                Some(Settled {
                    id,
                    method: entry.method,
                    elapsed,
                })
            })
            .collect()
    }

    /// Fail every outstanding request with `error`
    pub fn fail_all(&self, error: &Error) -> Vec<Settled> {
        let drained: Vec<(RequestId, PendingRequest)> = self.pending.lock().drain().collect();
        drained
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry.slot.send(Err(error.clone()));
                Settled {
                    id,
                    method: entry.method,
                    elapsed: entry.submitted_at.elapsed(),
                }
            })
            .collect()
    }

    /// Method of an outstanding request
    pub fn method_of(&self, id: &RequestId) -> Option<String> {
        self.pending.lock().get(id).map(|req| req.method.clone())
    }

    /// Whether `id` is outstanding
    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True when nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline among outstanding requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.lock().values().filter_map(|req| req.deadline).min()
    }
}
