//! Client and server transports talking over in-memory links.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::{
    BackoffConfig, CloseReason, Connection, Connector, ControlFlags, ErrorKind, EventReceiver,
    MemConnection, MemConnector, OutgoingMessage, PeerId, ReplayConfig, Transport,
    TransportConfig, TransportError, TransportEvent, TransportMessage,
};
use tokio::time::sleep;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether_session=debug")
        .with_test_writer()
        .try_init();
}

fn config() -> TransportConfig {
    TransportConfig {
        handshake_timeout_ms: 500,
        heartbeat_interval_ms: 100,
        heartbeats_until_dead: 2,
        session_disconnect_grace_ms: 5_000,
        backoff: BackoffConfig {
            base_ms: 150,
            max_ms: 2_000,
            max_jitter_ms: 0,
            max_attempts: 5,
        },
        ..TransportConfig::default()
    }
}

struct Pair {
    server: Transport,
    server_events: EventReceiver,
    client: Transport,
    client_events: EventReceiver,
    connector: Arc<MemConnector>,
}

fn pair(config: TransportConfig) -> Pair {
    init_tracing();
    let (server, server_events) = Transport::builder("server")
        .config(config.clone())
        .build()
        .unwrap();
    let connector = Arc::new(MemConnector::new(server.clone()));
    let (client, client_events) = Transport::builder("client")
        .config(config)
        .connector(connector.clone())
        .build()
        .unwrap();
    Pair {
        server,
        server_events,
        client,
        client_events,
        connector,
    }
}

fn server_id() -> PeerId {
    PeerId::from("server")
}

fn msg(text: &'static str) -> OutgoingMessage {
    OutgoingMessage::new("e2e", Bytes::from_static(text.as_bytes()))
}

/// Next delivered message, skipping lifecycle events
async fn next_message(events: &mut EventReceiver) -> TransportMessage {
    loop {
        if let TransportEvent::Message { message, .. } = events.recv().await.unwrap() {
            return message;
        }
    }
}

/// Events up to and including the first one matching `done`
async fn collect_until(
    events: &mut EventReceiver,
    done: impl Fn(&TransportEvent) -> bool,
) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

fn is_closed(event: &TransportEvent) -> bool {
    matches!(event, TransportEvent::SessionClosed { .. })
}

#[tokio::test(start_paused = true)]
async fn test_unacked_messages_replayed_once_after_link_break() {
    let mut p = pair(config());

    for text in ["one", "two", "three"] {
        p.client.send(&server_id(), msg(text)).unwrap();
    }
    for seq in 1..=3 {
        assert_eq!(next_message(&mut p.server_events).await.seq, seq);
    }

    // a server heartbeat carries the ack for 1..=3
    sleep(Duration::from_millis(150)).await;
    let stats = p.client.session_stats(&server_id()).await.unwrap();
    assert_eq!(stats.last_acked, 3);
    assert_eq!(stats.buffered, 0);

    let link = p.connector.last_link().unwrap();
    link.blackhole();
    p.client.send(&server_id(), msg("four")).unwrap();
    p.client.send(&server_id(), msg("five")).unwrap();
    let stats = p.client.session_stats(&server_id()).await.unwrap();
    assert_eq!(stats.next_seq, 6);
    assert_eq!(stats.buffered, 2);

    link.break_link("cable pulled");

    let four = next_message(&mut p.server_events).await;
    let five = next_message(&mut p.server_events).await;
    assert_eq!((four.seq, five.seq), (4, 5));
    assert_eq!(five.payload, Bytes::from_static(b"five"));

    let server_stats = p.server.session_stats(&"client".into()).await.unwrap();
    assert_eq!(server_stats.messages_delivered, 5);
    assert_eq!(server_stats.duplicates_dropped, 0);
    assert_eq!(server_stats.resumptions, 1);

    let client_stats = p.client.session_stats(&server_id()).await.unwrap();
    assert_eq!(client_stats.messages_replayed, 2);
    assert_eq!(client_stats.links_lost, 1);
    assert_eq!(p.connector.links().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_messages_sent_while_offline_arrive_in_order() {
    let mut p = pair(config());

    p.client.send(&server_id(), msg("before")).unwrap();
    assert_eq!(next_message(&mut p.server_events).await.seq, 1);

    p.connector.set_online(false);
    p.connector.last_link().unwrap().break_link("network down");
    p.client.send(&server_id(), msg("during 1")).unwrap();
    p.client.send(&server_id(), msg("during 2")).unwrap();

    sleep(Duration::from_millis(100)).await;
    p.connector.set_online(true);

    let first = next_message(&mut p.server_events).await;
    let second = next_message(&mut p.server_events).await;
    assert_eq!(first.seq, 2);
    assert_eq!(first.payload, Bytes::from_static(b"during 1"));
    assert_eq!(second.seq, 3);
    assert_eq!(second.payload, Bytes::from_static(b"during 2"));
}

/// Dials succeed but nothing ever answers
#[derive(Debug, Default)]
struct SilentConnector {
    far_ends: Mutex<Vec<Arc<MemConnection>>>,
}

#[async_trait]
impl Connector for SilentConnector {
    async fn connect(&self, _peer: &PeerId) -> anyhow::Result<Arc<dyn Connection>> {
        let (near, far) = MemConnection::pair();
        self.far_ends.lock().unwrap().push(far);
        Ok(near)
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out() {
    init_tracing();
    let connector = Arc::new(SilentConnector::default());
    let (client, mut events) = Transport::builder("client")
        .config(config())
        .connector(connector.clone())
        .build()
        .unwrap();

    client.connect(&server_id()).unwrap();
    sleep(Duration::from_millis(499)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(connector.far_ends.lock().unwrap().len(), 1);

    match events.recv().await.unwrap() {
        TransportEvent::ProtocolError { kind, peer, .. } => {
            assert_eq!(kind, ErrorKind::HandshakeTimeout);
            assert_eq!(peer, Some(server_id()));
        }
        other => panic!("unexpected event {:?}", other),
    }
    sleep(Duration::from_millis(1)).await;
    assert!(connector.far_ends.lock().unwrap()[0].is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_overflow_reports_delivery_loss() {
    let mut cfg = config();
    cfg.replay = ReplayConfig {
        max_messages: 3,
        max_bytes: None,
    };
    let mut p = pair(cfg);
    p.connector.set_online(false);

    for text in ["1", "2", "3", "4", "5"] {
        p.client.send(&server_id(), msg(text)).unwrap();
    }

    let mut lost = Vec::new();
    while lost.len() < 2 {
        if let TransportEvent::DeliveryLoss { seq, .. } = p.client_events.recv().await.unwrap() {
            lost.push(seq);
        }
    }
    assert_eq!(lost, vec![1, 2]);

    let stats = p.client.session_stats(&server_id()).await.unwrap();
    assert!(stats.degraded);
    assert_eq!(stats.buffered, 3);
    assert_eq!(stats.messages_evicted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_session_still_connects_and_delivers_survivors() {
    let mut cfg = config();
    cfg.replay = ReplayConfig {
        max_messages: 3,
        max_bytes: None,
    };
    let mut p = pair(cfg);
    p.connector.set_online(false);

    for text in ["1", "2", "3", "4", "5"] {
        p.client.send(&server_id(), msg(text)).unwrap();
    }
    p.connector.set_online(true);

    for (seq, text) in [(3, "3"), (4, "4"), (5, "5")] {
        let delivered = next_message(&mut p.server_events).await;
        assert_eq!(delivered.seq, seq);
        assert_eq!(delivered.payload, Bytes::from(text));
    }

    let seen = collect_until(&mut p.client_events, |e| {
        matches!(e, TransportEvent::SessionConnected { .. })
    })
    .await;
    let lost: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            TransportEvent::DeliveryLoss { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(lost, vec![1, 2]);
    assert!(!seen.iter().any(|e| matches!(
        e,
        TransportEvent::ProtocolError { .. } | TransportEvent::SessionClosed { .. }
    )));

    let server_stats = p.server.session_stats(&"client".into()).await.unwrap();
    assert_eq!(server_stats.messages_skipped, 2);
    assert_eq!(server_stats.messages_delivered, 3);

    // the session keeps working after the gap
    p.client.send(&server_id(), msg("6")).unwrap();
    assert_eq!(next_message(&mut p.server_events).await.seq, 6);
}

#[tokio::test(start_paused = true)]
async fn test_closing_reports_unacknowledged_messages_lost() {
    let mut p = pair(config());
    p.connector.set_online(false);
    p.client.send(&server_id(), msg("never")).unwrap();
    p.client.send(&server_id(), msg("sent")).unwrap();

    p.client.close_session(&server_id());
    let seen = collect_until(&mut p.client_events, is_closed).await;
    let lost: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            TransportEvent::DeliveryLoss { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(lost, vec![1, 2]);
    assert!(matches!(
        seen.last(),
        Some(TransportEvent::SessionClosed {
            reason: CloseReason::LocalClose,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_session_control_flags_refused_on_send() {
    let mut p = pair(config());
    p.client.send(&server_id(), msg("one")).unwrap();

    for flags in [ControlFlags::ACK, ControlFlags::HANDSHAKE, ControlFlags::SESSION_CLOSE] {
        let err = p
            .client
            .send(&server_id(), msg("two").with_flags(flags | ControlFlags::STREAM_OPEN))
            .unwrap_err();
        assert!(matches!(err, TransportError::ReservedFlags(reserved) if reserved == flags));
    }
    p.client
        .send(&server_id(), msg("three").with_flags(ControlFlags::STREAM_CLOSED))
        .unwrap();

    let first = next_message(&mut p.server_events).await;
    let second = next_message(&mut p.server_events).await;
    assert_eq!((first.seq, second.seq), (1, 2));
    assert_eq!(second.payload, Bytes::from_static(b"three"));
    assert_eq!(second.control_flags, ControlFlags::STREAM_CLOSED);

    let stats = p.server.session_stats(&"client".into()).await.unwrap();
    assert_eq!(stats.state, tether::SessionState::Connected);
}

#[test]
fn test_zero_reconnect_attempts_rejected() {
    let mut cfg = config();
    cfg.backoff.max_attempts = 0;
    let result = Transport::builder("client").config(cfg).build();
    assert!(matches!(result, Err(TransportError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_close_session_is_idempotent() {
    let mut p = pair(config());
    p.client.send(&server_id(), msg("hi")).unwrap();
    next_message(&mut p.server_events).await;

    assert!(p.client.close_session(&server_id()));
    p.client.close_session(&server_id());

    let client_seen = collect_until(&mut p.client_events, is_closed).await;
    assert!(matches!(
        client_seen.last(),
        Some(TransportEvent::SessionClosed {
            reason: CloseReason::LocalClose,
            ..
        })
    ));
    let server_seen = collect_until(&mut p.server_events, is_closed).await;
    assert!(matches!(
        server_seen.last(),
        Some(TransportEvent::SessionClosed {
            reason: CloseReason::PeerClose,
            ..
        })
    ));

    sleep(Duration::from_millis(50)).await;
    let mut extra_closes = 0;
    while let Ok(event) = p.client_events.try_recv() {
        if is_closed(&event) {
            extra_closes += 1;
        }
    }
    assert_eq!(extra_closes, 0);
    assert!(p.client.peers().is_empty());
    assert!(p.server.peers().is_empty());
    assert!(!p.client.close_session(&server_id()));
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_hits_liveness_timeout_and_resumes() {
    let mut p = pair(config());
    p.client.send(&server_id(), msg("hi")).unwrap();
    next_message(&mut p.server_events).await;

    p.connector.last_link().unwrap().blackhole();

    let lost = collect_until(&mut p.server_events, |e| {
        matches!(e, TransportEvent::SessionLost { .. })
    })
    .await;
    assert!(matches!(
        lost.last(),
        Some(TransportEvent::SessionLost {
            kind: ErrorKind::LivenessTimeout,
            ..
        })
    ));

    let reconnected = collect_until(&mut p.server_events, |e| {
        matches!(e, TransportEvent::SessionConnected { .. })
    })
    .await;
    assert!(matches!(
        reconnected.last(),
        Some(TransportEvent::SessionConnected { resumed: true, .. })
    ));

    p.client.send(&server_id(), msg("after")).unwrap();
    assert_eq!(next_message(&mut p.server_events).await.seq, 2);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_server_forces_new_session() {
    let mut p = pair(config());
    p.client.send(&server_id(), msg("old")).unwrap();
    next_message(&mut p.server_events).await;
    sleep(Duration::from_millis(150)).await;
    let old_session = p.client.session_stats(&server_id()).await.unwrap().session_id;

    let (restarted, mut restarted_events) = Transport::builder("server")
        .config(config())
        .build()
        .unwrap();
    p.connector.set_acceptor(restarted.clone());
    p.connector.last_link().unwrap().break_link("server restarted");

    let seen = collect_until(&mut p.client_events, is_closed).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        TransportEvent::ProtocolError {
            kind: ErrorKind::SessionStateMismatch,
            ..
        }
    )));
    assert!(matches!(
        seen.last(),
        Some(TransportEvent::SessionClosed {
            reason: CloseReason::StateMismatch,
            ..
        })
    ));

    p.client.send(&server_id(), msg("new")).unwrap();
    let delivered = next_message(&mut restarted_events).await;
    assert_eq!(delivered.seq, 1);
    assert_eq!(delivered.payload, Bytes::from_static(b"new"));

    let stats = p.client.session_stats(&server_id()).await.unwrap();
    assert_ne!(stats.session_id, old_session);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mut cfg = config();
    cfg.backoff.max_attempts = 3;
    let mut p = pair(cfg);
    p.connector.set_online(false);

    p.client.connect(&server_id()).unwrap();
    let seen = collect_until(&mut p.client_events, is_closed).await;
    assert!(matches!(
        seen.last(),
        Some(TransportEvent::SessionClosed {
            reason: CloseReason::ReconnectExhausted,
            ..
        })
    ));
    assert!(p.client.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transport_close_ends_every_session() {
    let mut p = pair(config());
    p.client.send(&server_id(), msg("hi")).unwrap();
    next_message(&mut p.server_events).await;

    p.client.close();
    assert!(p.client.send(&server_id(), msg("late")).is_err());

    let seen = collect_until(&mut p.client_events, is_closed).await;
    assert!(matches!(
        seen.last(),
        Some(TransportEvent::SessionClosed {
            reason: CloseReason::TransportClosed,
            ..
        })
    ));
    let server_seen = collect_until(&mut p.server_events, is_closed).await;
    assert!(matches!(
        server_seen.last(),
        Some(TransportEvent::SessionClosed {
            reason: CloseReason::PeerClose,
            ..
        })
    ));
}
