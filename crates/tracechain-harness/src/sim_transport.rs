//! Connectors that reach a [`SimServer`] without a real network.

use async_trait::async_trait;
use tracechain_client::{ConnectedClient, Connector, TransportError};

use crate::sim_server::SimServer;

/// Buffer size of each in-memory duplex pipe.
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Connects to an in-process [`SimServer`] over an in-memory pipe.
#[derive(Clone)]
pub struct MemoryConnector {
    server: SimServer,
}

impl MemoryConnector {
    /// Connect to `server`.
    pub fn new(server: SimServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<ConnectedClient, TransportError> {
        let (client, server_io) = tokio::io::duplex(DUPLEX_BUFFER);
        let server = self.server.clone();
        tokio::spawn(async move { server.serve_connection(server_io).await });
        Ok(ConnectedClient::from_stream(client))
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

/// Connects over turmoil's simulated TCP. Only usable inside a turmoil sim.
#[derive(Debug, Clone)]
pub struct TurmoilConnector {
    addr: String,
}

impl TurmoilConnector {
    /// Connect to `addr`, e.g. `server:4500`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TurmoilConnector {
    async fn connect(&self) -> Result<ConnectedClient, TransportError> {
        let stream = turmoil::net::TcpStream::connect(self.addr.as_str())
            .await
            .map_err(|e| TransportError::Connection(format!("connect to {}: {e}", self.addr)))?;
        Ok(ConnectedClient::from_stream(stream))
    }

    fn target(&self) -> String {
        format!("turmoil://{}", self.addr)
    }
}
