//! Envelope codec.
//!
//! Pure functions turning [`Envelope`]s into bytes and back. Nothing here
//! performs I/O or keeps state; framing is the transport's business.
//!
//! ```rust
//! use mcpsim_protocol::codec::{decode, encode};
//! use mcpsim_protocol::jsonrpc::{Envelope, JsonRpcRequest, RequestId};
//!
//! let request = JsonRpcRequest::new("tools/list", None, RequestId::from(1));
//! let bytes = encode(&Envelope::from(request.clone()))?;
//! assert_eq!(decode(&bytes)?, Envelope::Request(request));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::jsonrpc::{
    Envelope, JSONRPC_VERSION, JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, JsonRpcVersion, RequestId,
};

/// Reasons a frame could not be decoded into an [`Envelope`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    /// The payload is not well-formed JSON.
    #[error("Malformed JSON: {0}")]
    Malformed(String),

    /// The payload is JSON but not an object.
    #[error("Envelope must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Batches are not part of the protocol.
    #[error("Batch messages are not supported")]
    BatchUnsupported,

    /// The `jsonrpc` member is missing or not `"2.0"`.
    #[error("Invalid JSON-RPC version: {0}")]
    InvalidVersion(String),

    /// A field needed to tell the envelope kind apart is absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Fields that may not appear together were both present.
    #[error("Illegal field combination: {0}")]
    Conflicting(&'static str),

    /// A field is present but has the wrong shape.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// Encode an envelope as compact JSON bytes
pub fn encode(envelope: &Envelope) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(envelope).map(Bytes::from)
}

/// Decode one frame into an envelope
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    from_value(value)
}

/// Classify an already-parsed JSON value
pub fn from_value(value: Value) -> Result<Envelope, DecodeError> {
    let mut object = match value {
        Value::Object(object) => object,
        Value::Array(_) => return Err(DecodeError::BatchUnsupported),
        other => return Err(DecodeError::NotAnObject(json_type(&other))),
    };

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(DecodeError::InvalidVersion(other.to_string())),
        None => return Err(DecodeError::MissingField("jsonrpc")),
    }

    let has_result = object.contains_key("result");
    let has_error = object.contains_key("error");

    if let Some(method) = object.remove("method") {
        if has_result || has_error {
            return Err(DecodeError::Conflicting("method with result or error"));
        }
        let method = match method {
            Value::String(method) if !method.is_empty() => method,
            _ => {
                return Err(DecodeError::InvalidField {
                    field: "method",
                    reason: "expected a non-empty string".to_string(),
                });
            }
        };
        let params = take_params(&mut object)?;
        return match object.remove("id") {
            Some(id) => Ok(Envelope::Request(JsonRpcRequest {
                jsonrpc: JsonRpcVersion,
                method,
                params,
                id: parse_id(id)?.ok_or(DecodeError::InvalidField {
                    field: "id",
                    reason: "requests may not carry a null id".to_string(),
                })?,
            })),
            None => Ok(Envelope::Notification(JsonRpcNotification {
                jsonrpc: JsonRpcVersion,
                method,
                params,
            })),
        };
    }

    match (has_result, has_error) {
        (true, true) => Err(DecodeError::Conflicting("result and error")),
        (true, false) => {
            let id = object
                .remove("id")
                .ok_or(DecodeError::MissingField("id"))
                .and_then(parse_id)?
                .ok_or(DecodeError::InvalidField {
                    field: "id",
                    reason: "responses may not carry a null id".to_string(),
                })?;
            let result = object.remove("result").unwrap_or(Value::Null);
            Ok(Envelope::Response(JsonRpcResponse {
                jsonrpc: JsonRpcVersion,
                result,
                id,
            }))
        }
        (false, true) => {
            let id = object
                .remove("id")
                .ok_or(DecodeError::MissingField("id"))
                .and_then(parse_id)?;
            let error = object.remove("error").unwrap_or(Value::Null);
            let error: JsonRpcError =
                serde_json::from_value(error).map_err(|e| DecodeError::InvalidField {
                    field: "error",
                    reason: e.to_string(),
                })?;
            Ok(Envelope::ErrorResponse(JsonRpcErrorResponse {
                jsonrpc: JsonRpcVersion,
                error,
                id,
            }))
        }
        (false, false) => Err(DecodeError::MissingField("method, result or error")),
    }
}

/// What survives of a frame that failed to decode
///
/// Requests from the peer and replies to our own requests use separate id
/// spaces, so the direction matters as much as the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Salvaged {
    /// Carries a `method` member: a request or notification from the peer
    Inbound(Option<RequestId>),
    /// No `method` member: a reply to one of our requests
    Reply(Option<RequestId>),
}

/// Best-effort look at a frame that failed to decode
///
/// `None` when the frame is not even a JSON object.
pub fn salvage(bytes: &[u8]) -> Option<Salvaged> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let object = value.as_object()?;
    let id = object
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
    Some(if object.contains_key("method") {
        Salvaged::Inbound(id)
    } else {
        Salvaged::Reply(id)
    })
}

fn take_params(object: &mut Map<String, Value>) -> Result<Option<Value>, DecodeError> {
    match object.remove("params") {
        None | Some(Value::Null) => Ok(None),
        Some(params @ (Value::Object(_) | Value::Array(_))) => Ok(Some(params)),
        Some(other) => Err(DecodeError::InvalidField {
            field: "params",
            reason: format!("expected object or array, got {}", json_type(&other)),
        }),
    }
}

fn parse_id(id: Value) -> Result<Option<RequestId>, DecodeError> {
    match id {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_i64().map(|n| Some(RequestId::Number(n))).ok_or(
            DecodeError::InvalidField {
                field: "id",
                reason: format!("numeric ids must be integers, got {n}"),
            },
        ),
        Value::String(s) => Ok(Some(RequestId::String(s))),
        other => Err(DecodeError::InvalidField {
            field: "id",
            reason: format!("expected string or integer, got {}", json_type(&other)),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decode_json(value: Value) -> Result<Envelope, DecodeError> {
        decode(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_decode_request() {
        let envelope = decode_json(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "sampling/createMessage",
            "params": {"messages": []}
        }))
        .unwrap();
        assert_eq!(envelope.kind(), "request");
        assert_eq!(envelope.id(), Some(&RequestId::Number(4)));
        assert_eq!(envelope.method(), Some("sampling/createMessage"));
    }

    #[test]
    fn test_decode_notification() {
        let envelope =
            decode_json(json!({"jsonrpc": "2.0", "method": "notifications/message"})).unwrap();
        assert!(matches!(envelope, Envelope::Notification(ref n) if n.params.is_none()));
    }

    #[test]
    fn test_decode_response_and_error() {
        let ok = decode_json(json!({"jsonrpc": "2.0", "id": "a", "result": {"tools": []}})).unwrap();
        assert_eq!(
            ok,
            Envelope::Response(JsonRpcResponse::success(json!({"tools": []}), "a".into()))
        );

        let err = decode_json(json!({
            "jsonrpc": "2.0",
            "id": 9,
            "error": {"code": -32602, "message": "Tool not found: nope"}
        }))
        .unwrap();
        match err {
            Envelope::ErrorResponse(response) => {
                assert_eq!(response.id, Some(RequestId::Number(9)));
                assert_eq!(response.error.code, -32602);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_response_keeps_null_id() {
        let envelope = decode_json(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        assert_eq!(envelope.id(), None);
    }

    #[test]
    fn test_result_and_error_together_is_rejected() {
        let err = decode_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {},
            "error": {"code": 1, "message": "x"}
        }))
        .unwrap_err();
        assert_eq!(err, DecodeError::Conflicting("result and error"));
    }

    #[test]
    fn test_missing_discriminator_is_rejected() {
        let err = decode_json(json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("method, result or error"));

        let err = decode_json(json!({"id": 1, "result": {}})).unwrap_err();
        assert_eq!(err, DecodeError::MissingField("jsonrpc"));
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(decode(b"{not json"), Err(DecodeError::Malformed(_))));
        assert_eq!(decode(b"[]").unwrap_err(), DecodeError::BatchUnsupported);
        assert_eq!(decode(b"42").unwrap_err(), DecodeError::NotAnObject("number"));
        assert!(matches!(
            decode_json(json!({"jsonrpc": "1.0", "id": 1, "result": {}})),
            Err(DecodeError::InvalidVersion(_))
        ));
        assert!(matches!(
            decode_json(json!({"jsonrpc": "2.0", "id": 1.5, "result": {}})),
            Err(DecodeError::InvalidField { field: "id", .. })
        ));
        assert!(matches!(
            decode_json(json!({"jsonrpc": "2.0", "id": 1, "method": "x", "params": 3})),
            Err(DecodeError::InvalidField { field: "params", .. })
        ));
    }

    #[test]
    fn test_salvage_tells_replies_from_inbound_requests() {
        let reply = br#"{"jsonrpc":"2.0","id":12,"result":{},"error":{"code":1,"message":"x"}}"#;
        assert!(decode(reply).is_err());
        assert_eq!(salvage(reply), Some(Salvaged::Reply(Some(RequestId::Number(12)))));

        let request = br#"{"jsonrpc":"2.0","id":2,"method":"sampling/createMessage","params":"bad"}"#;
        assert!(decode(request).is_err());
        assert_eq!(salvage(request), Some(Salvaged::Inbound(Some(RequestId::Number(2)))));

        assert_eq!(
            salvage(br#"{"jsonrpc":"2.0","method":7}"#),
            Some(Salvaged::Inbound(None))
        );
        assert_eq!(salvage(b"garbage"), None);
        assert_eq!(salvage(b"[1]"), None);
    }

    #[test]
    fn test_encode_then_decode_notification() {
        let envelope = Envelope::from(JsonRpcNotification::new(
            "notifications/initialized",
            None,
        ));
        let bytes = encode(&envelope).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        );
        assert_eq!(decode(&bytes).unwrap(), envelope);
    }
}
