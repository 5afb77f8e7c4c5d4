//! Inbound routing for one connection.
//!
//! A single reader task is the only consumer of `transport.receive()`.
//! Routing by envelope kind:
//!
//! - **Response / ErrorResponse** → the correlator, which resolves the
//!   waiting caller; an identifier that is not outstanding is an anomaly
//! - **Request** → the sampling relay (`sampling/createMessage`) in its own
//!   task, or an immediate "method not found" reply
//! - **Notification** → notification subscribers, in wire order
//! - **Undecodable** → if reply-shaped, fails only the request it names; if
//!   request-shaped, the peer gets an invalid request/params error
//!
//! The task holds only a weak reference to the connection, so dropping the
//! last `Connection` handle ends it. Failure and close abort it.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use mcpsim_protocol::codec::{self, DecodeError, Salvaged};
use mcpsim_protocol::{
    Envelope, Error, JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, Result, feature, methods,
};
use mcpsim_transport::{Transport, TransportError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::core::{Connection, ConnectionInner};
use crate::correlator::Settled;
use crate::events::{AnomalyKind, EventKind, Outcome};
use crate::sampling;
use crate::state::ConnectionState;

pub(super) fn spawn_reader<T: Transport + 'static>(
    inner: Weak<ConnectionInner<T>>,
    transport: Arc<T>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Connection reader task started");
        loop {
            // No strong reference is held while waiting for the next frame
            let result = transport.receive().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match result {
                Ok(Some(frame)) => inner.route_frame(frame).await,
                Ok(None) => {
                    inner.fail("transport closed by peer".to_string()).await;
                    break;
                }
                Err(e) if e.is_fatal() => {
                    inner.fail(e.to_string()).await;
                    break;
                }
                Err(e) => inner.transport_warning(e),
            }
        }
        debug!("Connection reader task terminated");
    })
}

impl<T: Transport + 'static> ConnectionInner<T> {
    fn transport_warning(&self, err: TransportError) {
        let anomaly = match err {
            TransportError::NonProtocolOutput(_) => AnomalyKind::NonProtocolOutput,
            _ => AnomalyKind::TransportWarning,
        };
        warn!(connection = %self.id, "{}", err);
        self.events.emit(EventKind::Anomaly {
            anomaly,
            detail: Error::from(err).to_string(),
        });
    }

    async fn route_frame(self: &Arc<Self>, frame: Bytes) {
        trace!(connection = %self.id, "Routing frame: {} bytes", frame.len());
        let envelope = match codec::decode(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.undecodable(&frame, err).await;
                return;
            }
        };

        match envelope {
            Envelope::Response(JsonRpcResponse { result, id, .. }) => {
                let settled = self.correlator.resolve(&id, result);
                self.reply_received("response", id, settled, Outcome::Success)
                    .await;
            }
            Envelope::ErrorResponse(JsonRpcErrorResponse {
                error, id: Some(id), ..
            }) => {
                let settled = self.correlator.reject(&id, Error::application(error));
                self.reply_received("error", id, settled, Outcome::Error)
                    .await;
            }
            Envelope::ErrorResponse(JsonRpcErrorResponse { error, id: None, .. }) => {
                self.events.emit(EventKind::EnvelopeReceived {
                    envelope: "error".to_string(),
                    method: None,
                    id: None,
                    elapsed_ms: None,
                    outcome: None,
                });
                let detail = format!("error response without an id: {} {}", error.code, error.message);
                if *self.state.borrow() == ConnectionState::Negotiating {
                    self.fail(detail).await;
                } else {
                    self.anomaly(AnomalyKind::UnexpectedEnvelope, detail);
                }
            }
            Envelope::Request(request) => {
                self.events.emit(EventKind::EnvelopeReceived {
                    envelope: "request".to_string(),
                    method: Some(request.method.clone()),
                    id: Some(request.id.clone()),
                    elapsed_ms: None,
                    outcome: None,
                });
                self.server_request(request).await;
            }
            Envelope::Notification(notification) => {
                self.events.emit(EventKind::EnvelopeReceived {
                    envelope: "notification".to_string(),
                    method: Some(notification.method.clone()),
                    id: None,
                    elapsed_ms: None,
                    outcome: None,
                });
                self.notify_subscribers(notification);
            }
        }
    }

    async fn reply_received(
        &self,
        envelope: &str,
        id: RequestId,
        settled: Result<Settled>,
        outcome: Outcome,
    ) {
        match settled {
            Ok(settled) => {
                trace!(connection = %self.id, %id, method = %settled.method, "Reply correlated");
                self.events.emit(EventKind::EnvelopeReceived {
                    envelope: envelope.to_string(),
                    method: Some(settled.method.clone()),
                    id: Some(id),
                    elapsed_ms: Some(settled.elapsed_ms()),
                    outcome: Some(outcome),
                });
            }
            Err(violation) => {
                self.events.emit(EventKind::EnvelopeReceived {
                    envelope: envelope.to_string(),
                    method: None,
                    id: Some(id),
                    elapsed_ms: None,
                    outcome: None,
                });
                self.violation(violation).await;
            }
        }
    }

    /// Unknown or duplicate reply identifiers
    async fn violation(&self, violation: Error) {
        let detail = violation.message.clone();
        self.anomaly(AnomalyKind::UnknownResponseId, detail.clone());
        if self.config.strict_violations {
            self.fail(format!("protocol violation: {detail}")).await;
        }
    }

    async fn undecodable(&self, frame: &[u8], err: DecodeError) {
        let detail = format!("undecodable frame ({} bytes): {}", frame.len(), err);
        self.anomaly(AnomalyKind::UndecodableFrame, detail.clone());

        if *self.state.borrow() == ConnectionState::Negotiating {
            self.fail(detail).await;
            return;
        }

        match codec::salvage(frame) {
            // A reply we can still attribute fails only its own request
            Some(Salvaged::Reply(Some(id))) if self.correlator.contains(&id) => {
                if let Ok(settled) = self.correlator.reject(&id, err.into()) {
                    self.events.emit(EventKind::EnvelopeReceived {
                        envelope: "invalid".to_string(),
                        method: Some(settled.method.clone()),
                        id: Some(id),
                        elapsed_ms: Some(settled.elapsed_ms()),
                        outcome: Some(Outcome::Error),
                    });
                }
            }
            // The peer's own ids never touch the pending table
            Some(Salvaged::Inbound(Some(id))) => {
                let error = match err {
                    DecodeError::InvalidField {
                        field: "params", ..
                    } => JsonRpcError::invalid_params(&err.to_string()),
                    _ => JsonRpcError::invalid_request(err.to_string()),
                };
                debug!(
                    connection = %self.id,
                    %id,
                    code = error.code,
                    "Rejecting malformed server request"
                );
                if let Err(e) = self
                    .send_envelope(JsonRpcErrorResponse::new(error, id).into())
                    .await
                {
                    warn!(connection = %self.id, "Failed to reject malformed request: {}", e);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn anomaly(&self, anomaly: AnomalyKind, detail: String) {
        warn!(connection = %self.id, ?anomaly, "{}", detail);
        self.events.emit(EventKind::Anomaly { anomaly, detail });
    }

    fn notify_subscribers(&self, notification: JsonRpcNotification) {
        debug!(connection = %self.id, method = %notification.method, "Server notification");
        self.notification_subscribers
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    async fn server_request(self: &Arc<Self>, request: JsonRpcRequest) {
        if request.method != methods::SAMPLING_CREATE_MESSAGE {
            info!(connection = %self.id, method = %request.method, "Unsupported server request");
            let reply = JsonRpcErrorResponse::new(
                JsonRpcError::method_not_found(&request.method),
                request.id,
            );
            let _ = self.send_envelope(reply.into()).await;
            return;
        }

        if !self.relay.begin(&request.id) {
            self.anomaly(
                AnomalyKind::DuplicateRequestId,
                format!("sampling request {} is already being handled", request.id),
            );
            return;
        }

        let connection = Connection {
            inner: Arc::clone(self),
        };
        let handle = tokio::spawn(async move { connection.answer_sampling(request).await });
        self.track_task(handle);
    }
}

impl<T: Transport + 'static> Connection<T> {
    /// Relay one sampling request and send the reply
    async fn answer_sampling(&self, request: JsonRpcRequest) {
        let inner = &self.inner;
        let _in_flight = inner.relay.guard(request.id.clone());
        let JsonRpcRequest { id, params, .. } = request;

        let outcome = if let Err(e) = self.ensure_ready(methods::SAMPLING_CREATE_MESSAGE) {
            Err(JsonRpcError::invalid_request(e.message))
        } else if !self.supports(feature::SAMPLING) {
            Err(sampling::not_supported())
        } else {
            inner
                .relay
                .relay(id.clone(), params, inner.config.sampling_timeout())
                .await
        };

        // The verdict may outlive the connection
        let state = self.state();
        if state.is_terminal() || state == ConnectionState::Closing {
            debug!(connection = %inner.id, %id, "Dropping sampling reply, connection is {}", state);
            return;
        }

        let reply: Envelope = match outcome {
            Ok(result) => JsonRpcResponse::success(result, id).into(),
            Err(error) => JsonRpcErrorResponse::new(error, id).into(),
        };
        if let Err(e) = inner.send_envelope(reply).await {
            warn!(connection = %inner.id, "Failed to send sampling reply: {}", e);
        }
    }
}
