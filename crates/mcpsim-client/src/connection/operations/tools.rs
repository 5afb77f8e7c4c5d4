//! Tool operations.

use mcpsim_protocol::Result;
use mcpsim_protocol::types::{ExecutionOutcome, ListToolsResult, Tool};
use mcpsim_transport::Transport;
use serde_json::Value;

use super::{execution_outcome, parse_result};
use crate::query::Query;

impl<T: Transport + 'static> super::super::core::Connection<T> {
    /// List the tools the server exposes
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let query = Query::list_tools();
        let reply = self.invoke(&query).await?;
        let result: ListToolsResult = parse_result(&query.method, reply)?;
        Ok(result.tools)
    }

    /// Identifiers of the listed tools
    pub async fn list_tool_ids(&self) -> Result<Vec<String>> {
        let tools = self.list_tools().await?;
        Ok(tools.into_iter().map(|tool| tool.id).collect())
    }

    /// Execute a tool with an argument payload
    ///
    /// Fails with `CapabilityNotSupported` before touching the transport when
    /// tools were not negotiated.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use mcpsim_client::{Connection, ConnectionConfig};
    /// # use mcpsim_protocol::types::ExecutionOutcome;
    /// # use mcpsim_transport::{PipeConfig, PipeTransport};
    /// # async fn example() -> mcpsim_protocol::Result<()> {
    /// # let connection = Connection::new(
    /// #     PipeTransport::new(PipeConfig::new("./server")),
    /// #     ConnectionConfig::default(),
    /// # );
    /// # connection.connect().await?;
    /// let args = serde_json::json!({"expression": "2 + 2"});
    /// match connection.execute_tool("calculator", args).await? {
    ///     ExecutionOutcome::Completed { result } => println!("{result}"),
    ///     ExecutionOutcome::Rejected(rejection) => println!("rejected: {}", rejection.message),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_tool(&self, id: &str, args: Value) -> Result<ExecutionOutcome> {
        let query = Query::execute_tool(id, args);
        execution_outcome(self.invoke(&query).await)
    }
}
