//! Sampling relay.
//!
//! A server may ask the client to obtain a model completion
//! (`sampling/createMessage`). The client never produces one itself: each
//! request is handed to an external [`ApprovalAuthority`] and the reply waits
//! for its [`Verdict`]. Only that request's handling waits; the connection
//! keeps reading and correlating other traffic meanwhile.
//!
//! Reply mapping:
//!
//! | Situation | Reply |
//! |-----------|-------|
//! | approved | the authority's content as the result |
//! | denied | error `-1` "Sampling request denied", `data.reason` |
//! | sampling not negotiated, or no authority installed | error `-32601` |
//! | connection not ready | error `-32600` |
//! | unparseable parameters | error `-32602` |
//! | authority failed or timed out | error `-32603` |

use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpsim_protocol::types::{CreateMessageParams, SamplingRequest, Verdict};
use mcpsim_protocol::{JsonRpcError, JsonRpcErrorCode, RequestId};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Error code of a denied sampling request
pub const DENIED_CODE: i32 = -1;

/// Boxed error returned by an approval authority
pub type AuthorityError = Box<dyn StdError + Send + Sync>;

/// External decision maker for sampling requests
///
/// Called concurrently when several sampling requests are in flight.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use mcpsim_client::sampling::{ApprovalAuthority, AuthorityError};
/// use mcpsim_protocol::types::{SamplingRequest, Verdict};
///
/// #[derive(Debug)]
/// struct RefuseLongRequests;
///
/// #[async_trait]
/// impl ApprovalAuthority for RefuseLongRequests {
///     async fn decide(&self, request: SamplingRequest) -> Result<Verdict, AuthorityError> {
///         if request.params.max_tokens.unwrap_or(0) > 1000 {
///             return Ok(Verdict::Deny("too many tokens".into()));
///         }
///         Ok(Verdict::Approve(serde_json::json!({
///             "role": "assistant",
///             "content": {"type": "text", "text": "reviewed by a human"}
///         })))
///     }
/// }
/// ```
#[async_trait]
pub trait ApprovalAuthority: Send + Sync + fmt::Debug {
    /// Decide one request
    async fn decide(&self, request: SamplingRequest) -> Result<Verdict, AuthorityError>;
}

/// Authority that refuses everything with a fixed reason
#[derive(Debug, Clone)]
pub struct DenyAll {
    reason: String,
}

impl DenyAll {
    /// Refuse with `reason`
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ApprovalAuthority for DenyAll {
    async fn decide(&self, _request: SamplingRequest) -> Result<Verdict, AuthorityError> {
        Ok(Verdict::Deny(self.reason.clone()))
    }
}

/// Per-connection relay state
#[derive(Debug, Default)]
pub(crate) struct SamplingRelay {
    authority: RwLock<Option<Arc<dyn ApprovalAuthority>>>,
    in_flight: Mutex<HashSet<RequestId>>,
}

/// Removes the identifier from the in-flight set however handling ends
pub(crate) struct InFlightGuard<'a> {
    relay: &'a SamplingRelay,
    id: RequestId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.relay.in_flight.lock().remove(&self.id);
    }
}

impl SamplingRelay {
    pub(crate) fn set_authority(&self, authority: Option<Arc<dyn ApprovalAuthority>>) {
        *self.authority.write() = authority;
    }

    pub(crate) fn has_authority(&self) -> bool {
        self.authority.read().is_some()
    }

    /// `false` when a request with this identifier is already being handled
    pub(crate) fn begin(&self, id: &RequestId) -> bool {
        self.in_flight.lock().insert(id.clone())
    }

    pub(crate) fn guard(&self, id: RequestId) -> InFlightGuard<'_> {
        InFlightGuard { relay: self, id }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Obtain the verdict for one request and turn it into a reply
    pub(crate) async fn relay(
        &self,
        id: RequestId,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, JsonRpcError> {
        let authority = self
            .authority
            .read()
            .clone()
            .ok_or_else(not_supported)?;

        let params: CreateMessageParams =
            serde_json::from_value(params.unwrap_or_else(|| json!({}))).map_err(|e| {
                JsonRpcError::invalid_params(&format!("invalid sampling parameters: {e}"))
            })?;
        let request = SamplingRequest {
            id: id.clone(),
            params,
        };

        debug!(%id, "Waiting for approval verdict");
        let decision = authority.decide(request);
        let verdict = match timeout {
            Some(limit) => tokio::time::timeout(limit, decision).await.map_err(|_| {
                warn!(%id, "Approval verdict timed out after {:?}", limit);
                JsonRpcError::internal_error(&format!(
                    "no approval verdict within {}ms",
                    limit.as_millis()
                ))
            })?,
            None => decision.await,
        };

        match verdict {
            Ok(Verdict::Approve(content)) => {
                debug!(%id, "Sampling request approved");
                Ok(content)
            }
            Ok(Verdict::Deny(reason)) => {
                debug!(%id, %reason, "Sampling request denied");
                Err(denied(&reason))
            }
            Err(e) => {
                warn!(%id, "Approval authority failed: {}", e);
                Err(JsonRpcError::internal_error(&format!(
                    "approval authority failed: {e}"
                )))
            }
        }
    }
}

/// Reply for sampling on a connection that did not negotiate it
pub(crate) fn not_supported() -> JsonRpcError {
    JsonRpcError::new(
        JsonRpcErrorCode::MethodNotFound.code(),
        "Sampling not supported",
    )
}

/// Structured refusal
pub fn denied(reason: &str) -> JsonRpcError {
    JsonRpcError::with_data(
        DENIED_CODE,
        "Sampling request denied",
        json!({ "reason": reason }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl ApprovalAuthority for Echo {
        async fn decide(&self, request: SamplingRequest) -> Result<Verdict, AuthorityError> {
            Ok(Verdict::Approve(json!({"echo": request.params.messages})))
        }
    }

    #[derive(Debug)]
    struct Never;

    #[async_trait]
    impl ApprovalAuthority for Never {
        async fn decide(&self, _request: SamplingRequest) -> Result<Verdict, AuthorityError> {
            std::future::pending().await
        }
    }

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl ApprovalAuthority for Broken {
        async fn decide(&self, _request: SamplingRequest) -> Result<Verdict, AuthorityError> {
            Err("console closed".into())
        }
    }

    fn relay_with(authority: impl ApprovalAuthority + 'static) -> SamplingRelay {
        let relay = SamplingRelay::default();
        relay.set_authority(Some(Arc::new(authority)));
        relay
    }

    #[tokio::test]
    async fn test_no_authority_is_not_supported() {
        let relay = SamplingRelay::default();
        let err = relay.relay(RequestId::from(1), None, None).await.unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn test_approve_returns_authority_content() {
        let relay = relay_with(Echo);
        let reply = relay
            .relay(
                RequestId::from(1),
                Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"echo": [{"role": "user", "content": "hi"}]}));
    }

    #[tokio::test]
    async fn test_deny_is_structured_refusal() {
        let relay = relay_with(DenyAll::new("not today"));
        let err = relay.relay(RequestId::from(2), None, None).await.unwrap_err();
        assert_eq!(err, denied("not today"));
        assert_eq!(err.data, Some(json!({"reason": "not today"})));
    }

    #[tokio::test]
    async fn test_bad_params_are_invalid_params() {
        let relay = relay_with(Echo);
        let err = relay
            .relay(RequestId::from(3), Some(json!({"messages": "nope"})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verdict_deadline() {
        let relay = relay_with(Never);
        let err = relay
            .relay(RequestId::from(4), None, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32603);
    }

    #[tokio::test]
    async fn test_authority_failure_is_internal_error() {
        let relay = relay_with(Broken);
        let err = relay.relay(RequestId::from(5), None, None).await.unwrap_err();
        assert_eq!(err.code, -32603);
        assert!(err.message.contains("console closed"));
    }

    #[test]
    fn test_in_flight_tracking() {
        let relay = SamplingRelay::default();
        let id = RequestId::from(7);
        assert!(relay.begin(&id));
        assert!(!relay.begin(&id));
        {
            let _guard = relay.guard(id.clone());
            assert_eq!(relay.in_flight(), 1);
        }
        assert_eq!(relay.in_flight(), 0);
        assert!(relay.begin(&id));
    }
}
