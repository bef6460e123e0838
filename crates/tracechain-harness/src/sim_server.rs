//! Simulation server: a reference system under test.
//!
//! `SimServer` wraps [`SessionHub`] with an async line-JSON serving loop. It
//! accepts from anything implementing [`Acceptor`] (tokio TCP for the
//! `serve` command, turmoil TCP in deterministic tests) and can also be
//! attached directly to an in-memory stream.
//!
//! Hub state lives behind a synchronous mutex that is never held across an
//! await: events are processed under the lock, and the resulting sends go to
//! per-connection unbounded outboxes drained by writer tasks. Export writes
//! happen outside the hub lock under their own mutex, and a snapshot with no
//! more spans than the last one written is discarded.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracechain_proto::{MAX_LINE_LENGTH, ProtocolMessage};
use tracechain_verify::{Span, SpanBatch};

use crate::{
    evidence::write_atomic,
    hub::{ConnId, HubAction, HubConfig, HubEvent, SessionHub, SimFaults},
};

/// Simulation server configuration.
#[derive(Debug, Clone, Default)]
pub struct SimServerConfig {
    /// When set, `auth` must carry exactly this token
    pub expected_token: Option<String>,
    /// Injected faults
    pub faults: SimFaults,
    /// Rewrite the span export here after every recorded span batch
    pub trace_export: Option<PathBuf>,
}

/// Source of inbound connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Accepted stream type.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Wait for the next connection.
    async fn accept(&self) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Acceptor for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<Self::Stream> {
        let (stream, addr) = tokio::net::TcpListener::accept(self).await?;
        tracing::debug!(%addr, "accepted");
        Ok(stream)
    }
}

#[async_trait]
impl Acceptor for turmoil::net::TcpListener {
    type Stream = turmoil::net::TcpStream;

    async fn accept(&self) -> io::Result<Self::Stream> {
        let (stream, addr) = turmoil::net::TcpListener::accept(self).await?;
        tracing::debug!(%addr, "accepted");
        Ok(stream)
    }
}

struct Shared {
    hub: SessionHub,
    outboxes: HashMap<ConnId, mpsc::UnboundedSender<ProtocolMessage>>,
    spans: Vec<Span>,
}

/// Simulation server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimServer {
    shared: Arc<Mutex<Shared>>,
    next_conn: Arc<AtomicU64>,
    trace_export: Option<PathBuf>,
    /// Span count of the last export written.
    exported: Arc<Mutex<usize>>,
}

impl SimServer {
    /// Create a server.
    pub fn new(config: SimServerConfig) -> Self {
        let hub = SessionHub::new(HubConfig {
            expected_token: config.expected_token,
            faults: config.faults,
        });
        Self {
            shared: Arc::new(Mutex::new(Shared {
                hub,
                outboxes: HashMap::new(),
                spans: Vec::new(),
            })),
            next_conn: Arc::new(AtomicU64::new(1)),
            trace_export: config.trace_export,
            exported: Arc::new(Mutex::new(0)),
        }
    }

    /// Accept and serve connections until the acceptor fails.
    pub async fn serve<A: Acceptor>(&self, acceptor: A) -> io::Result<()> {
        loop {
            let stream = acceptor.accept().await?;
            let server = self.clone();
            tokio::spawn(async move { server.serve_connection(stream).await });
        }
    }

    /// Serve one connection until it closes.
    pub async fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(stream);
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ProtocolMessage>();
        self.lock().outboxes.insert(conn, outbox_tx);
        self.dispatch(HubEvent::Opened { conn });
        tracing::debug!(conn, "connection opened");

        let writer = tokio::spawn(async move {
            let mut sink =
                FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            while let Some(message) = outbox_rx.recv().await {
                let line = match message.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(conn, error = %e, "dropping unencodable reply");
                        continue;
                    },
                };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        while let Some(frame) = lines.next().await {
            match frame {
                Ok(line) => match ProtocolMessage::decode(&line) {
                    Ok(message) => self.dispatch(HubEvent::Received { conn, message }),
                    Err(e) => tracing::warn!(conn, error = %e, "skipping undecodable line"),
                },
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(conn, "skipping oversized line");
                },
                Err(LinesCodecError::Io(e)) => {
                    tracing::debug!(conn, error = %e, "read failed");
                    break;
                },
            }
        }

        self.lock().outboxes.remove(&conn);
        self.dispatch(HubEvent::Closed { conn });
        writer.abort();
        tracing::debug!(conn, "connection closed");
    }

    /// Live joined connections in `session_id`.
    pub fn joined_count(&self, session_id: &str) -> u64 {
        self.lock().hub.joined_count(session_id)
    }

    /// Live entered connections in `session_id`.
    pub fn enter_event_count(&self, session_id: &str) -> u64 {
        self.lock().hub.enter_event_count(session_id)
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.lock().hub.connection_count()
    }

    /// Every span recorded so far.
    pub fn spans(&self) -> SpanBatch {
        SpanBatch::new(self.lock().spans.clone())
    }

    fn dispatch(&self, event: HubEvent) {
        let export = {
            let mut shared = self.lock();
            let actions = shared.hub.process_event(event);
            let mut recorded = false;
            for action in actions {
                match action {
                    HubAction::Send { conn, message } => {
                        let delivered = shared
                            .outboxes
                            .get(&conn)
                            .is_some_and(|outbox| outbox.send(message).is_ok());
                        if !delivered {
                            tracing::debug!(conn, "send to closed connection");
                        }
                    },
                    HubAction::Span(span) => {
                        shared.spans.push(span);
                        recorded = true;
                    },
                }
            }
            recorded.then(|| SpanBatch::new(shared.spans.clone()))
        };

        if let Some(batch) = export {
            self.persist_export(&batch);
        }
    }

    /// Rewrite the trace export with `batch` unless a larger snapshot has
    /// already been written. Spans are append-only, so the span count orders
    /// snapshots.
    fn persist_export(&self, batch: &SpanBatch) {
        let Some(path) = &self.trace_export else {
            return;
        };
        let mut exported = match self.exported.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if batch.spans.len() <= *exported {
            tracing::debug!(spans = batch.spans.len(), written = *exported, "stale export skipped");
            return;
        }

        let written = batch
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|json| write_atomic(path, json.as_bytes()).map_err(|e| e.to_string()));
        match written {
            Ok(()) => *exported = batch.spans.len(),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "trace export failed"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
