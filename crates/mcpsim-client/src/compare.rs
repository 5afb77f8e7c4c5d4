//! Comparative invocation.
//!
//! The same [`Query`] goes to two connections at once; both replies come back
//! together with a structural diff.

use std::time::Duration;

use mcpsim_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::connection::Connection;
use crate::query::Query;
use crate::session::Reply;

/// One side of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Side {
    /// Connection the query went to
    pub connection: Uuid,
    /// What came back
    pub reply: Reply,
}

/// Structural difference between two replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    /// Left elapsed time minus right elapsed time
    pub timing_delta_ms: i64,
    /// Left side produced a result payload
    pub left_has_payload: bool,
    /// Right side produced a result payload
    pub right_has_payload: bool,
    /// Both sides completed, or both failed with the same error kind
    pub outcome_match: bool,
    /// Both payloads are present and equal
    pub payloads_equal: bool,
    /// JSON pointers at which the payloads differ (`/` for the root)
    pub differing_paths: Vec<String>,
}

/// Result of one comparative invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// What was asked
    pub query: Query,
    /// First connection's reply
    pub left: Side,
    /// Second connection's reply
    pub right: Side,
    /// Structural diff
    pub diff: Diff,
}

/// Submit `query` to both connections concurrently and diff the replies
///
/// Failures on either side are part of the comparison, never an `Err`.
pub async fn compare<L, R>(left: &Connection<L>, right: &Connection<R>, query: &Query) -> Comparison
where
    L: Transport + 'static,
    R: Transport + 'static,
{
    let (left_reply, right_reply) = tokio::join!(timed(left, query), timed(right, query));
    let diff = diff_replies(&left_reply, &right_reply);
    debug!(
        method = %query.method,
        timing_delta_ms = diff.timing_delta_ms,
        payloads_equal = diff.payloads_equal,
        "Comparison finished"
    );

    Comparison {
        query: query.clone(),
        left: Side {
            connection: left.id(),
            reply: left_reply,
        },
        right: Side {
            connection: right.id(),
            reply: right_reply,
        },
        diff,
    }
}

async fn timed<T: Transport + 'static>(connection: &Connection<T>, query: &Query) -> Reply {
    let started = Instant::now();
    let outcome = connection.invoke(query).await;
    let elapsed_ms = millis(started.elapsed());
    match outcome {
        Ok(value) => Reply::Completed { value, elapsed_ms },
        Err(err) => Reply::Failed {
            kind: err.kind,
            code: err.rpc_code(),
            message: err.message,
            elapsed_ms,
        },
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Diff two replies
pub fn diff_replies(left: &Reply, right: &Reply) -> Diff {
    let left_ms = left.elapsed_ms().unwrap_or(0);
    let right_ms = right.elapsed_ms().unwrap_or(0);
    let timing_delta_ms = i64::try_from(left_ms)
        .unwrap_or(i64::MAX)
        .saturating_sub(i64::try_from(right_ms).unwrap_or(i64::MAX));

    let outcome_match = match (left, right) {
        (Reply::Completed { .. }, Reply::Completed { .. }) => true,
        (Reply::Failed { kind: a, .. }, Reply::Failed { kind: b, .. }) => a == b,
        _ => false,
    };

    let mut differing_paths = Vec::new();
    let (left_value, right_value) = (left.value(), right.value());
    if let (Some(a), Some(b)) = (left_value, right_value) {
        collect_differences(a, b, String::new(), &mut differing_paths);
    }

    Diff {
        timing_delta_ms,
        left_has_payload: left_value.is_some(),
        right_has_payload: right_value.is_some(),
        outcome_match,
        payloads_equal: left_value.is_some() && left_value == right_value,
        differing_paths,
    }
}

fn collect_differences(left: &Value, right: &Value, path: String, out: &mut Vec<String>) {
    match (left, right) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in a {
                let child = format!("{path}/{}", escape_pointer(key));
                match b.get(key) {
                    Some(other) => collect_differences(value, other, child, out),
                    None => out.push(child),
                }
            }
            for key in b.keys().filter(|key| !a.contains_key(*key)) {
                out.push(format!("{path}/{}", escape_pointer(key)));
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for index in 0..a.len().max(b.len()) {
                let child = format!("{path}/{index}");
                match (a.get(index), b.get(index)) {
                    (Some(x), Some(y)) => collect_differences(x, y, child, out),
                    _ => out.push(child),
                }
            }
        }
        _ if left != right => out.push(if path.is_empty() { "/".to_string() } else { path }),
        _ => {}
    }
}

// RFC 6901
fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
