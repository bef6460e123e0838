//! Line-delimited JSON transport for the client.
//!
//! Provides [`ConnectedClient`] which handles stream I/O for message
//! transport. This is a thin layer that just sends/receives messages; protocol
//! logic stays in [`crate::SessionDriver`].
//!
//! Inbound messages are delivered on one ordered channel per connection. No
//! retries happen here: a failed connect is reported once and the caller
//! decides what to do with it.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    task::AbortHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracechain_proto::{MAX_LINE_LENGTH, ProtocolMessage, UnknownMessage};

/// Capacity of the outbound and inbound message channels.
const CHANNEL_CAPACITY: usize = 256;

/// Default bound on establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,

    /// Inbound delivery was already handed to another consumer.
    #[error("inbound stream already taken")]
    InboundTaken,
}

/// Handle to a connected client.
///
/// Messages are sent through an internal channel drained by a writer task;
/// received messages arrive in order on the inbound channel, which exactly one
/// consumer takes with [`ConnectedClient::take_inbound`].
pub struct ConnectedClient {
    to_server: mpsc::Sender<ProtocolMessage>,
    from_server: Option<mpsc::Receiver<ProtocolMessage>>,
    abort_handles: Vec<AbortHandle>,
    connected: bool,
}

impl ConnectedClient {
    /// Wrap an already-established byte stream.
    ///
    /// Spawns the reader and writer tasks on the current tokio runtime.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (to_server_tx, to_server_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (from_server_tx, from_server_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let writer = tokio::spawn(write_loop(
            FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            to_server_rx,
        ));
        let reader = tokio::spawn(read_loop(
            FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            from_server_tx,
        ));

        Self {
            to_server: to_server_tx,
            from_server: Some(from_server_rx),
            abort_handles: vec![writer.abort_handle(), reader.abort_handle()],
            connected: true,
        }
    }

    /// Build a client from raw channels, with no I/O tasks behind it.
    ///
    /// Lets tests inject a synthetic message source and inspect what the
    /// driver sends.
    pub fn from_channels(
        to_server: mpsc::Sender<ProtocolMessage>,
        from_server: mpsc::Receiver<ProtocolMessage>,
    ) -> Self {
        Self {
            to_server,
            from_server: Some(from_server),
            abort_handles: Vec::new(),
            connected: true,
        }
    }

    /// Queue a message for the server.
    pub async fn send(&self, message: ProtocolMessage) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        self.to_server.send(message).await.map_err(|_| TransportError::Closed)
    }

    /// Take the ordered inbound delivery channel.
    pub fn take_inbound(&mut self) -> Result<mpsc::Receiver<ProtocolMessage>, TransportError> {
        self.from_server.take().ok_or(TransportError::InboundTaken)
    }

    /// Whether [`ConnectedClient::disconnect`] has not been called yet.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Close the connection. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        for handle in self.abort_handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ConnectedClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Drain outbound messages into the stream, one JSON object per line.
async fn write_loop<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut to_server: mpsc::Receiver<ProtocolMessage>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = to_server.recv().await {
        let line = match message.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(msg_type = message.msg_type(), error = %e, "dropping unencodable message");
                continue;
            },
        };
        if let Err(e) = sink.send(line).await {
            tracing::debug!(error = %e, "write failed, stopping writer");
            break;
        }
    }
}

/// Decode inbound lines onto the delivery channel, preserving arrival order.
async fn read_loop<R>(
    mut stream: FramedRead<R, LinesCodec>,
    from_server: mpsc::Sender<ProtocolMessage>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(line) => {
                let message = ProtocolMessage::decode(&line).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "undecodable line, delivering raw");
                    ProtocolMessage::Unrecognized(UnknownMessage::from_line(line))
                });
                if from_server.send(message).await.is_err() {
                    break;
                }
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(max = MAX_LINE_LENGTH, "skipping oversized line");
            },
            Err(LinesCodecError::Io(e)) => {
                tracing::debug!(error = %e, "read failed, stopping reader");
                break;
            },
        }
    }
}

/// Opens new connections to the system under test.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish one connection.
    async fn connect(&self) -> Result<ConnectedClient, TransportError>;

    /// Human-readable target, for logs.
    fn target(&self) -> String;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector for `url`, either `host:port` or `tcp://host:port`.
    pub fn new(url: &str) -> Self {
        let addr = url.strip_prefix("tcp://").unwrap_or(url).trim_end_matches('/').to_string();
        Self { addr, connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<ConnectedClient, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                TransportError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::Connection(format!("connect to {}: {e}", self.addr)))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }

        Ok(ConnectedClient::from_stream(stream))
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Connect to `url` over TCP.
pub async fn connect(url: &str) -> Result<ConnectedClient, TransportError> {
    TcpConnector::new(url).connect().await
}
