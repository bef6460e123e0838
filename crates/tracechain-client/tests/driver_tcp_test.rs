//! Session driver over real loopback TCP, and message log ordering properties.

use std::time::Duration;

use proptest::prelude::*;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::mpsc,
    time::Instant,
};
use tracechain_client::{
    ClientIdentity, DriverConfig, DriverFailure, DriverState, MessageLog, SessionDriver,
    SessionParams, SessionRecord, StaticToken, Step, TcpConnector,
};
use tracechain_proto::{
    Ack, AckType, AggregatePush, DEFAULT_PROTOCOL_VERSION, ProtocolMessage,
};

fn params() -> SessionParams {
    SessionParams {
        label: "client1".to_string(),
        identity: ClientIdentity::new("u1", "teacher"),
        session_id: "s-tcp".to_string(),
        idempotent_rejoin: true,
    }
}

fn reply(message: &ProtocolMessage, answer_events: bool) -> Vec<ProtocolMessage> {
    let ack = |ack_type| {
        ProtocolMessage::Ack(Ack {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            correlation_id: message.correlation_id().cloned(),
            ack_type,
            ok: true,
            session_id: message.session_id().map(str::to_string),
            error: None,
        })
    };
    match message {
        ProtocolMessage::Auth(_) => vec![ack(AckType::Auth)],
        ProtocolMessage::JoinSession(_) => vec![ack(AckType::JoinSession)],
        ProtocolMessage::Event(_) if answer_events => vec![
            ack(AckType::Event),
            ProtocolMessage::Aggregate(AggregatePush {
                protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
                correlation_id: message.correlation_id().cloned(),
                session_id: "s-tcp".to_string(),
                joined_count: 1,
                enter_event_count: 1,
            }),
        ],
        _ => Vec::new(),
    }
}

/// One-connection line server that answers every request.
async fn serve_once(listener: TcpListener, answer_events: bool) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut seen = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let message = ProtocolMessage::decode(&line).unwrap();
        for out in reply(&message, answer_events) {
            let mut text = out.encode().unwrap();
            text.push('\n');
            write.write_all(text.as_bytes()).await.unwrap();
        }
        seen.push(line);
    }
    seen
}

#[tokio::test]
async fn full_session_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_once(listener, true));

    let connector = TcpConnector::new(&format!("tcp://{addr}"));
    let mut driver = SessionDriver::new(params(), DriverConfig::default());
    let result = driver.run(&connector, &StaticToken::new("signed")).await;

    assert!(result.is_settled(), "{:?}", result.failures);
    assert_eq!(result.rejoin_ok, Some(true));
    assert_eq!(result.last_aggregate.as_ref().map(|a| a.enter_event_count), Some(1));
    assert!(result.timeline.iter().any(|l| l.contains("recv {")));

    driver.disconnect();
    driver.disconnect();
    let seen = server.await.unwrap();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|l| l.contains(result.correlation_id.as_str())));
}

#[tokio::test]
async fn unanswered_event_times_out_within_the_step_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(serve_once(listener, false));

    let config = DriverConfig { step_timeout: Duration::from_millis(100), ..DriverConfig::default() };
    let mut driver = SessionDriver::new(params(), config);
    let start = Instant::now();
    let result = driver.run(&TcpConnector::new(&addr.to_string()), &StaticToken::new("signed")).await;

    assert_eq!(result.final_state, DriverState::Failed);
    assert!(result.join_ok && !result.event_ack_ok && !result.got_aggregate);
    assert_eq!(
        result.failure_for(Step::EventAck),
        Some(&DriverFailure::ProtocolTimeout { step: Step::EventAck, after: Duration::from_millis(100) })
    );
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn refused_connection_is_a_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut driver = SessionDriver::new(params(), DriverConfig::default());
    let result = driver.run(&TcpConnector::new(&addr.to_string()), &StaticToken::new("signed")).await;

    assert!(matches!(result.failures[..], [DriverFailure::Connection(_)]));
    assert!(!result.auth_ok);
}

fn aggregate(n: u64) -> ProtocolMessage {
    ProtocolMessage::Aggregate(AggregatePush {
        protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        correlation_id: None,
        session_id: "s-1".to_string(),
        joined_count: n,
        enter_event_count: n,
    })
}

proptest! {
    #[test]
    fn await_next_finds_first_match_at_or_after_from(
        counts in prop::collection::vec(0u64..5, 1..20),
        from in 0usize..20,
        wanted in 0u64..5,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let found = runtime.block_on(async {
            let (tx, rx) = mpsc::channel(32);
            for n in &counts {
                tx.send(aggregate(*n)).await.unwrap();
            }
            drop(tx);

            let mut log = MessageLog::new(rx, SessionRecord::new());
            let deadline = Instant::now() + Duration::from_secs(1);
            let found = log
                .await_next(from, deadline, |m| m.as_aggregate().is_some_and(|a| a.joined_count == wanted))
                .await
                .and_then(ProtocolMessage::as_aggregate)
                .map(|a| a.joined_count);
            (found, log.len())
        });

        let expected = counts.iter().skip(from).find(|n| **n == wanted).copied();
        prop_assert_eq!(found.0, expected);
        // Every message is logged even when none matches.
        if expected.is_none() {
            prop_assert_eq!(found.1, counts.len());
        }
    }
}
