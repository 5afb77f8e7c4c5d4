//! Client-initiated feature operations
//!
//! - `resources`: list, describe, get
//! - `prompts`: list, execute
//! - `tools`: list, execute
//!
//! Every operation goes through [`Connection::invoke`](super::Connection::invoke),
//! which enforces `Ready` and the negotiated capability before anything is
//! written to the transport.

mod prompts;
mod resources;
mod tools;

use mcpsim_protocol::types::{ExecutionOutcome, Rejection};
use mcpsim_protocol::{Error, ErrorKind, JsonRpcErrorCode, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Parse a reply payload into the method's result type
pub(crate) fn parse_result<R: DeserializeOwned>(method: &str, value: Value) -> Result<R> {
    serde_json::from_value(value)
        .map_err(|e| Error::decode(format!("malformed {method} result: {e}")))
}

/// Split an execute reply into a completion, a rejection or a real failure
///
/// The item refusing its arguments shows up either as an invalid-params
/// error envelope or as a result flagged with `isError`. Every other error
/// is returned unchanged.
pub fn execution_outcome(reply: Result<Value>) -> Result<ExecutionOutcome> {
    match reply {
        Ok(value) if value.get("isError").and_then(Value::as_bool) == Some(true) => {
            let message = value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("execution reported an error")
                .to_string();
            Ok(ExecutionOutcome::Rejected(Rejection {
                code: None,
                message,
                data: Some(value),
            }))
        }
        Ok(mut value) => {
            let result = match value.get_mut("result") {
                Some(inner) => inner.take(),
                None => value,
            };
            Ok(ExecutionOutcome::Completed { result })
        }
        Err(err)
            if err.kind == ErrorKind::Application
                && err.rpc_code() == Some(JsonRpcErrorCode::InvalidParams.code()) =>
        {
            let rpc = err.rpc.map(|rpc| *rpc);
            Ok(ExecutionOutcome::Rejected(Rejection {
                code: rpc.as_ref().map(|rpc| rpc.code),
                message: rpc
                    .as_ref()
                    .map(|rpc| rpc.message.clone())
                    .unwrap_or(err.message),
                data: rpc.and_then(|rpc| rpc.data),
            }))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpsim_protocol::JsonRpcError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_result_member_is_unwrapped() {
        let outcome = execution_outcome(Ok(json!({"result": 4}))).unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed { result: json!(4) });

        let outcome = execution_outcome(Ok(json!({"messages": []}))).unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                result: json!({"messages": []})
            }
        );
    }

    #[test]
    fn test_invalid_params_is_rejection() {
        let err = Error::application(JsonRpcError::with_data(
            -32602,
            "Tool not found: nope",
            json!({"id": "nope"}),
        ));
        let outcome = execution_outcome(Err(err)).unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Rejected(Rejection {
                code: Some(-32602),
                message: "Tool not found: nope".to_string(),
                data: Some(json!({"id": "nope"})),
            })
        );
    }

    #[test]
    fn test_is_error_result_is_rejection() {
        let outcome =
            execution_outcome(Ok(json!({"isError": true, "error": "division by zero"}))).unwrap();
        match outcome {
            ExecutionOutcome::Rejected(rejection) => {
                assert_eq!(rejection.code, None);
                assert_eq!(rejection.message, "division by zero");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_other_errors_pass_through() {
        let err = execution_outcome(Err(Error::application(JsonRpcError::internal_error(
            "boom",
        ))))
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Application);

        let err = execution_outcome(Err(Error::transport("gone"))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
    }
}
