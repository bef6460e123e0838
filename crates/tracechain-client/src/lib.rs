//! Client
//!
//! Transport client and per-session protocol driver for the tracechain
//! harness.
//!
//! # Architecture
//!
//! [`ConnectedClient`] bridges a byte stream to a pair of channels: a writer
//! task drains outbound messages into newline-delimited JSON, and a reader task
//! decodes inbound lines onto a single ordered delivery channel. The
//! [`SessionDriver`] never registers callbacks; it consumes that channel
//! through a [`MessageLog`], an append-only buffer with bounded waits.
//!
//! # Components
//!
//! - [`ConnectedClient`], [`Connector`], [`TcpConnector`]: transport
//! - [`MessageLog`]: bounded-wait consumer over received messages
//! - [`SessionDriver`]: auth → join → event protocol state machine
//! - [`SessionDriverResult`]: frozen per-client outcome
//! - [`TokenSource`]: external credential supplier

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod message_log;
mod record;
mod token;
pub mod transport;

pub use driver::{
    DEFAULT_STEP_TIMEOUT, DriverConfig, DriverFailure, DriverState, SessionDriver,
    SessionDriverResult, SessionParams, Step,
};
pub use message_log::MessageLog;
pub use record::SessionRecord;
pub use token::{ClientIdentity, StaticToken, TokenError, TokenSource};
pub use transport::{
    ConnectedClient, Connector, DEFAULT_CONNECT_TIMEOUT, TcpConnector, TransportError, connect,
};
