//! Prompt operations.

use mcpsim_protocol::Result;
use mcpsim_protocol::types::{ExecutionOutcome, ListPromptsResult, Prompt};
use mcpsim_transport::Transport;
use serde_json::Value;

use super::{execution_outcome, parse_result};
use crate::query::Query;

impl<T: Transport + 'static> super::super::core::Connection<T> {
    /// List the prompts the server exposes
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let query = Query::list_prompts();
        let reply = self.invoke(&query).await?;
        let result: ListPromptsResult = parse_result(&query.method, reply)?;
        Ok(result.prompts)
    }

    /// Execute a prompt with an argument payload
    ///
    /// A prompt refusing its arguments (unknown id, missing argument) is an
    /// [`ExecutionOutcome::Rejected`], not an `Err`.
    pub async fn execute_prompt(&self, id: &str, args: Value) -> Result<ExecutionOutcome> {
        let query = Query::execute_prompt(id, args);
        execution_outcome(self.invoke(&query).await)
    }
}
