//! Request and result payloads for the methods the client speaks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capabilities::CapabilitySet;
use crate::jsonrpc::RequestId;

/// Wire method names
pub mod methods {
    /// Capability handshake, always the first request
    pub const INITIALIZE: &str = "initialize";
    /// Sent once the handshake response has been accepted
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Graceful shutdown request
    pub const SHUTDOWN: &str = "shutdown";
    /// List resources
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Fetch one resource by URI
    pub const RESOURCES_GET: &str = "resources/get";
    /// List prompts
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Execute a prompt
    pub const PROMPTS_EXECUTE: &str = "prompts/execute";
    /// List tools
    pub const TOOLS_LIST: &str = "tools/list";
    /// Execute a tool
    pub const TOOLS_EXECUTE: &str = "tools/execute";
    /// Server-initiated model completion request
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
}

/// Name and version of one side of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name
    pub name: String,
    /// Implementation version
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: "MCP Client Simulator".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Parameters of the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Offered capabilities
    pub capabilities: CapabilitySet,
    /// Who is asking
    pub client_info: Implementation,
}

/// Result of the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Capabilities the peer accepts or offers
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Peer identity, when it reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
}

/// A contextual data item as listed by the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier
    pub uri: String,
    /// Content type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Anything else the peer attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of `resources/list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// Listed resources; an absent member is an empty list
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// Parameters of `resources/get`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetResourceParams {
    /// Resource to fetch
    pub uri: String,
}

/// Result of `resources/get`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    /// Resource identifier
    pub uri: String,
    /// Content type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Resource body
    #[serde(default)]
    pub content: Value,
    /// Anything else the peer attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A prompt or tool as listed by the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Identifier used to execute the item
    pub id: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Argument schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Anything else the peer attached
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Listed prompt
pub type Prompt = Item;

/// Listed tool
pub type Tool = Item;

/// Result of `prompts/list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPromptsResult {
    /// Listed prompts; an absent member is an empty list
    #[serde(default)]
    pub prompts: Vec<Prompt>,
}

/// Result of `tools/list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// Listed tools; an absent member is an empty list
    #[serde(default)]
    pub tools: Vec<Tool>,
}

/// Parameters of `prompts/execute` and `tools/execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteParams {
    /// Item to execute
    pub id: String,
    /// Argument payload
    pub args: Value,
}

/// Outcome of executing a prompt or tool
///
/// A rejection is the named item refusing its arguments; transport and
/// protocol failures are reported through `Err` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The item ran and produced a payload
    Completed {
        /// Result payload
        result: Value,
    },
    /// The item rejected the call
    Rejected(Rejection),
}

impl ExecutionOutcome {
    /// True for [`ExecutionOutcome::Completed`]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Structured reason an item rejected its arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Peer error code, when the rejection came as an error envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Human-readable reason
    pub message: String,
    /// Structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Parameters of an inbound `sampling/createMessage` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageParams {
    /// Conversation to complete
    #[serde(default)]
    pub messages: Vec<Value>,
    /// System prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Upper bound on generated tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Other constraints (model preferences, temperature, ...)
    #[serde(flatten)]
    pub constraints: Map<String, Value>,
}

/// A sampling request awaiting an approval verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRequest {
    /// Identifier the peer assigned to the request
    pub id: RequestId,
    /// What the peer asked for
    pub params: CreateMessageParams,
}

/// Decision of the approval authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "value", rename_all = "snake_case")]
pub enum Verdict {
    /// Return this content as the sampling result
    Approve(Value),
    /// Refuse, with a reason that is passed back to the peer
    Deny(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_initialize_params_wire_shape() {
        let params = InitializeParams {
            capabilities: CapabilitySet::client_default(),
            client_info: Implementation {
                name: "MCP Client Simulator".to_string(),
                version: "1.0.0".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(params).unwrap(),
            json!({
                "capabilities": {"prompts": {}, "resources": {}, "sampling": {}, "tools": {}},
                "clientInfo": {"name": "MCP Client Simulator", "version": "1.0.0"}
            })
        );
    }

    #[test]
    fn test_initialize_result_without_server_info() {
        let result: InitializeResult =
            serde_json::from_value(json!({"capabilities": {"tools": {}}})).unwrap();
        assert!(result.server_info.is_none());
        assert!(result.capabilities.supports("tools"));
    }

    #[test]
    fn test_resource_list_keeps_type_and_extras() {
        let list: ListResourcesResult = serde_json::from_value(json!({
            "resources": [{"uri": "sample_text", "type": "text/plain", "size": 31}]
        }))
        .unwrap();
        let resource = &list.resources[0];
        assert_eq!(resource.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(resource.extra.get("size"), Some(&json!(31)));
    }

    #[test]
    fn test_missing_list_member_is_empty() {
        let tools: ListToolsResult = serde_json::from_value(json!({})).unwrap();
        assert!(tools.tools.is_empty());
    }

    #[test]
    fn test_sampling_params_collect_constraints() {
        let params: CreateMessageParams = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}],
            "maxTokens": 64,
            "temperature": 0.2
        }))
        .unwrap();
        assert_eq!(params.max_tokens, Some(64));
        assert_eq!(params.constraints.get("temperature"), Some(&json!(0.2)));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ExecutionOutcome::Rejected(Rejection {
            code: Some(-32602),
            message: "Missing argument: b".to_string(),
            data: None,
        });
        assert_eq!(
            serde_json::to_value(outcome).unwrap(),
            json!({"status": "rejected", "code": -32602, "message": "Missing argument: b"})
        );
    }
}
