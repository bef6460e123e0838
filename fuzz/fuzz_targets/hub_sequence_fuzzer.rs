//! Fuzz target for SessionHub event sequences
//!
//! # Strategy
//!
//! - Random interleavings of open, auth, join, rejoin, enter and close
//!   across a handful of connections and two sessions
//!
//! # Invariants
//!
//! - joined_count never exceeds the number of open connections
//! - enter_event_count never exceeds joined_count
//! - Every pushed aggregate matches the hub's counts at push time
//! - NEVER panic on out-of-order protocol messages

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tracechain_harness::{HubAction, HubEvent, SessionHub};
use tracechain_proto::{CorrelationId, Envelope, EventType, ProtocolMessage};

const SESSIONS: [&str; 2] = ["s-a", "s-b"];

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Open,
    Auth { conn: u8, blank: bool },
    Join { conn: u8, session: bool },
    Enter { conn: u8, session: bool },
    Close { conn: u8 },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut hub = SessionHub::default();
    let mut next = 0u64;
    let conn = |c: u8, next: u64| if next == 0 { 0 } else { u64::from(c) % next };
    let session = |b: bool| SESSIONS[usize::from(b)];

    for op in ops {
        let event = match op {
            Op::Open => {
                next += 1;
                HubEvent::Opened { conn: next - 1 }
            },
            Op::Auth { conn: c, blank } => {
                let envelope = Envelope::new("2.0", CorrelationId::from(format!("c-{c}")));
                let token = if blank { "" } else { "token" };
                HubEvent::Received { conn: conn(c, next), message: envelope.auth(token) }
            },
            Op::Join { conn: c, session: s } => {
                let envelope = Envelope::new("2.0", CorrelationId::from(format!("c-{c}")));
                HubEvent::Received { conn: conn(c, next), message: envelope.join(session(s)) }
            },
            Op::Enter { conn: c, session: s } => {
                let envelope = Envelope::new("2.0", CorrelationId::from(format!("c-{c}")));
                HubEvent::Received {
                    conn: conn(c, next),
                    message: envelope.event(EventType::Enter, session(s)),
                }
            },
            Op::Close { conn: c } => HubEvent::Closed { conn: conn(c, next) },
        };

        for action in hub.process_event(event) {
            if let HubAction::Send { message: ProtocolMessage::Aggregate(push), .. } = action {
                assert_eq!(push.joined_count, hub.joined_count(&push.session_id));
                assert_eq!(push.enter_event_count, hub.enter_event_count(&push.session_id));
            }
        }

        for sid in SESSIONS {
            let joined = hub.joined_count(sid);
            assert!(joined <= hub.connection_count() as u64);
            assert!(hub.enter_event_count(sid) <= joined);
        }
    }
});
