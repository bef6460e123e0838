//! Fuzz target for ProtocolMessage::decode
//!
//! Feeds arbitrary lines to the wire decoder to find:
//! - Panics on malformed JSON or unexpected field types
//! - Messages that decode but fail to re-encode
//!
//! The decoder should NEVER panic. Anything that decodes must survive an
//! encode/decode cycle with the same message type.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tracechain_proto::ProtocolMessage;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(message) = ProtocolMessage::decode(line) else {
        return;
    };

    let encoded = message.encode().expect("decoded message must encode");
    let again = ProtocolMessage::decode(&encoded).expect("encoded message must decode");
    assert_eq!(message.msg_type(), again.msg_type());
    assert_eq!(message.correlation_id(), again.correlation_id());
});
