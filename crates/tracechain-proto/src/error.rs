//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Inbound line is not a valid message object.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Outbound message could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Encoded message exceeds the transport line limit.
    #[error("message too long: {len} bytes (max {max})")]
    TooLong {
        /// Encoded length
        len: usize,
        /// Configured maximum
        max: usize,
    },
}
