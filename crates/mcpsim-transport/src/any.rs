//! Runtime choice between the concrete transports.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportResult;
use crate::pipe::{PipeConfig, PipeTransport};
use crate::stream::{StreamConfig, StreamTransport};
use crate::traits::{Transport, TransportKind};

/// Either transport, chosen from configuration at runtime
#[derive(Debug)]
pub enum ClientTransport {
    /// Framed stdio of a spawned process
    Pipe(PipeTransport),
    /// HTTP POST plus event stream
    Stream(StreamTransport),
}

impl ClientTransport {
    /// Pipe transport for the given process
    pub fn pipe(config: PipeConfig) -> Self {
        Self::Pipe(PipeTransport::new(config))
    }

    /// Stream transport for the given endpoints
    pub fn stream(config: StreamConfig) -> TransportResult<Self> {
        StreamTransport::new(config).map(Self::Stream)
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            Self::Pipe(t) => t,
            Self::Stream(t) => t,
        }
    }
}

impl From<PipeTransport> for ClientTransport {
    fn from(transport: PipeTransport) -> Self {
        Self::Pipe(transport)
    }
}

impl From<StreamTransport> for ClientTransport {
    fn from(transport: StreamTransport) -> Self {
        Self::Stream(transport)
    }
}

#[async_trait]
impl Transport for ClientTransport {
    fn kind(&self) -> TransportKind {
        self.inner().kind()
    }

    async fn open(&self) -> TransportResult<()> {
        self.inner().open().await
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        self.inner().send(frame).await
    }

    async fn receive(&self) -> TransportResult<Option<Bytes>> {
        self.inner().receive().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner().close().await
    }

    fn is_open(&self) -> bool {
        self.inner().is_open()
    }

    fn endpoint(&self) -> Option<String> {
        self.inner().endpoint()
    }
}
