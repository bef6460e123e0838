//! Bounded-wait consumer over received messages.
//!
//! The log is append-only: every message pulled off the delivery channel is
//! recorded (timeline and evidence) and then stored before any predicate looks
//! at it. Waits scan the buffered messages first and only then block on the
//! channel, never past the caller's deadline.

use tokio::{sync::mpsc, time::Instant};
use tracechain_proto::ProtocolMessage;

use crate::record::SessionRecord;

/// Append-only log of received messages with deadline-bounded waits.
pub struct MessageLog {
    inbound: mpsc::Receiver<ProtocolMessage>,
    received: Vec<ProtocolMessage>,
    record: SessionRecord,
    closed: bool,
}

impl MessageLog {
    /// Wrap an inbound delivery channel, appending to `record`.
    pub fn new(inbound: mpsc::Receiver<ProtocolMessage>, record: SessionRecord) -> Self {
        Self { inbound, received: Vec::new(), record, closed: false }
    }

    /// Number of messages received so far.
    pub fn len(&self) -> usize {
        self.received.len()
    }

    /// Whether nothing has been received yet.
    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// All received messages in arrival order.
    pub fn messages(&self) -> &[ProtocolMessage] {
        &self.received
    }

    /// Whether the peer closed the delivery channel.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Session record accumulated so far.
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Mutable session record, for lines the driver adds itself.
    pub fn record_mut(&mut self) -> &mut SessionRecord {
        &mut self.record
    }

    /// Wait for the first message at index `from` or later matching
    /// `predicate`, giving up at `deadline`.
    pub async fn await_next<P>(
        &mut self,
        from: usize,
        deadline: Instant,
        mut predicate: P,
    ) -> Option<&ProtocolMessage>
    where
        P: FnMut(&ProtocolMessage) -> bool,
    {
        let index = self
            .wait_for(deadline, |messages| {
                messages.iter().enumerate().skip(from).find(|(_, m)| predicate(m)).map(|(i, _)| i)
            })
            .await?;
        self.received.get(index)
    }

    /// Pull from the channel until `probe` yields a value, the channel
    /// closes, or the deadline passes.
    async fn wait_for<T, F>(&mut self, deadline: Instant, mut probe: F) -> Option<T>
    where
        F: FnMut(&[ProtocolMessage]) -> Option<T>,
    {
        loop {
            if let Some(found) = probe(&self.received) {
                return Some(found);
            }
            if self.closed {
                return None;
            }
            match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(message)) => self.push(message),
                Ok(None) => {
                    self.closed = true;
                    self.record.note("connection closed by peer");
                },
                Err(_) => return None,
            }
        }
    }

    fn push(&mut self, message: ProtocolMessage) {
        self.record.observe(&message);
        self.received.push(message);
    }
}
