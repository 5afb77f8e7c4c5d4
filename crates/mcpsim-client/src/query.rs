//! Transport-independent description of one feature invocation.

use mcpsim_protocol::feature;
use mcpsim_protocol::methods;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A method plus parameters, replayable against any connection
///
/// Sessions record queries and comparisons submit the same query to two
/// connections, so a query is plain data rather than a call in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Wire method
    pub method: String,
    /// Parameter payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Query {
    /// Arbitrary method
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// `resources/list`
    pub fn list_resources() -> Self {
        Self::new(methods::RESOURCES_LIST, None)
    }

    /// `resources/get`
    pub fn get_resource(uri: impl Into<String>) -> Self {
        Self::new(methods::RESOURCES_GET, Some(json!({ "uri": uri.into() })))
    }

    /// `prompts/list`
    pub fn list_prompts() -> Self {
        Self::new(methods::PROMPTS_LIST, None)
    }

    /// `prompts/execute`
    pub fn execute_prompt(id: impl Into<String>, args: Value) -> Self {
        Self::new(
            methods::PROMPTS_EXECUTE,
            Some(json!({ "id": id.into(), "args": args })),
        )
    }

    /// `tools/list`
    pub fn list_tools() -> Self {
        Self::new(methods::TOOLS_LIST, None)
    }

    /// `tools/execute`
    pub fn execute_tool(id: impl Into<String>, args: Value) -> Self {
        Self::new(
            methods::TOOLS_EXECUTE,
            Some(json!({ "id": id.into(), "args": args })),
        )
    }

    /// Capability that must be negotiated before this query may be sent
    ///
    /// Derived from the method namespace; methods outside the known
    /// namespaces need no capability.
    pub fn feature(&self) -> Option<&'static str> {
        let namespace = self.method.split('/').next()?;
        match namespace {
            "resources" => Some(feature::RESOURCES),
            "prompts" => Some(feature::PROMPTS),
            "tools" => Some(feature::TOOLS),
            _ => None,
        }
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.params {
            Some(params) => write!(f, "{} {}", self.method, params),
            None => f.write_str(&self.method),
        }
    }
}
