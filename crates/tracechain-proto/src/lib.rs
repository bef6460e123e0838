//! Wire model for the tracechain session protocol.
//!
//! Messages are JSON objects tagged by `msg_type`, one object per line on the
//! transport. Every message carries a protocol version and the correlation id
//! of the client session that caused it; the server echoes that id back on
//! acks, aggregate pushes and exported spans.
//!
//! # Components
//!
//! - [`CorrelationId`]: opaque per-session token
//! - [`ProtocolMessage`]: tagged union of all message kinds
//! - [`Envelope`]: builds outbound messages for one session
//! - [`AggregateSnapshot`]: literal copy of a received aggregate push

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod correlation;
mod error;
mod message;

pub use correlation::{
    BUSINESS_ID_FIELD, CORRELATION_FIELD, CORRELATION_HEADER, CorrelationId,
    LEGACY_BUSINESS_ID_FIELD,
};
pub use error::ProtocolError;
pub use message::{
    Ack, AckType, AggregatePush, AggregateSnapshot, Auth, DEFAULT_PROTOCOL_VERSION, DomainEvent,
    Envelope, EventType, JoinSession, MAX_LINE_LENGTH, ProtocolMessage, UnknownMessage,
};
