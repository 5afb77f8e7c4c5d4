//! Resource operations: list, describe and get.

use mcpsim_protocol::Result;
use mcpsim_protocol::types::{ListResourcesResult, Resource, ResourceContent};
use mcpsim_transport::Transport;

use super::parse_result;
use crate::query::Query;

impl<T: Transport + 'static> super::super::core::Connection<T> {
    /// List the resources the server exposes
    ///
    /// An empty list is a valid answer and is not an error.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use mcpsim_client::{Connection, ConnectionConfig};
    /// # use mcpsim_transport::{PipeConfig, PipeTransport};
    /// # async fn example() -> mcpsim_protocol::Result<()> {
    /// let connection = Connection::new(
    ///     PipeTransport::new(PipeConfig::new("./server")),
    ///     ConnectionConfig::default(),
    /// );
    /// connection.connect().await?;
    ///
    /// for resource in connection.list_resources().await? {
    ///     println!("{} ({})", resource.uri, resource.mime_type.as_deref().unwrap_or("?"));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        let query = Query::list_resources();
        let reply = self.invoke(&query).await?;
        let result: ListResourcesResult = parse_result(&query.method, reply)?;
        Ok(result.resources)
    }

    /// Metadata of one resource, taken from the list result
    ///
    /// `None` when the server does not list `uri`.
    pub async fn describe_resource(&self, uri: &str) -> Result<Option<Resource>> {
        let resources = self.list_resources().await?;
        Ok(resources.into_iter().find(|resource| resource.uri == uri))
    }

    /// Fetch the content of one resource
    pub async fn get_resource(&self, uri: &str) -> Result<ResourceContent> {
        let query = Query::get_resource(uri);
        let reply = self.invoke(&query).await?;
        parse_result(&query.method, reply)
    }
}
