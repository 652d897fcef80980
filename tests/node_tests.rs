//! Relay node tests over loopback TCP

use relay_core::{CircuitLimits, Limit, LimitPolicy, RejectReason, RelayEvent, Status};
use relay_integration_tests::{TestNode, eventually, identity};
use relay_node::protocol::{ClientMessage, RelayMessage, read_frame, write_frame};
use relay_node::{Identity, NodeError, RelayClient};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const AGENT: &str = "relay-tests/0.1";
const WAIT: Duration = Duration::from_secs(5);

/// Send `Hello` for `claimed` and answer the nonce with `signer`'s key
async fn raw_handshake(
    addr: SocketAddr,
    claimed: &Identity,
    signer: &Identity,
) -> (TcpStream, RelayMessage) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let hello = ClientMessage::Hello {
        peer: claimed.peer_id(),
        agent: AGENT.to_string(),
    };
    write_frame(&mut stream, &hello).await.unwrap();

    let welcome: RelayMessage = read_frame(&mut stream).await.unwrap();
    let RelayMessage::Welcome { relay, nonce, .. } = welcome else {
        panic!("expected Welcome");
    };
    let authenticate = ClientMessage::Authenticate {
        signature: signer.sign_handshake(&relay, &nonce),
    };
    write_frame(&mut stream, &authenticate).await.unwrap();
    let answer = read_frame(&mut stream).await.unwrap();
    (stream, answer)
}

#[tokio::test]
async fn test_handshake_and_ping() {
    let node = TestNode::start(|_| {}).await;

    let mut client = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    assert_eq!(client.relay_id(), node.peer_id);
    assert_eq!(client.relay_agent(), relay_node::config::Config::default().node.agent);
    assert!(client.observed_addr().ip().is_loopback());
    client.ping(42).await.unwrap();

    node.stop().await;
}

#[tokio::test]
async fn test_relayed_circuit_carries_bytes() {
    let node = TestNode::start(|_| {}).await;

    let mut destination = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    let info = destination.reserve(false).await.unwrap();
    assert_eq!(info.limits, LimitPolicy::default().circuit_caps());
    assert!(node.relay.is_live(&identity(1).peer_id()));

    let source = RelayClient::connect(node.addr, &identity(2), AGENT).await.unwrap();
    let dialing = tokio::spawn(source.dial(identity(1).peer_id(), CircuitLimits::UNBOUNDED));

    let incoming = destination.next_incoming().await.unwrap();
    assert_eq!(incoming.source, identity(2).peer_id());
    let mut inbound = destination.accept_incoming(&incoming).await.unwrap();
    let mut outbound = dialing.await.unwrap().unwrap();
    assert_eq!(inbound.id, outbound.id);
    assert_eq!(inbound.id, incoming.circuit);

    outbound.stream.write_all(b"hello relay").await.unwrap();
    let mut buf = [0u8; 11];
    inbound.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello relay");

    inbound.stream.write_all(b"hello back").await.unwrap();
    let mut buf = [0u8; 10];
    outbound.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello back");

    drop(outbound);
    drop(inbound);
    let relay = node.relay.clone();
    assert!(eventually(WAIT, || relay.circuit_count() == 0).await);
    assert!(node.relay.is_live(&identity(1).peer_id()));
    assert_eq!(
        node.metrics
            .count(|e| *e == RelayEvent::ConnectionRequestHandled(Status::Ok)),
        1
    );

    node.stop().await;
}

#[tokio::test]
async fn test_dial_without_reservation_is_rejected() {
    let node = TestNode::start(|_| {}).await;

    let source = RelayClient::connect(node.addr, &identity(2), AGENT).await.unwrap();
    let err = source
        .dial(identity(7).peer_id(), CircuitLimits::UNBOUNDED)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NodeError::Rejected(Status::Rejected(RejectReason::NoReservation))
    ));
    assert!(err.is_transient());

    node.stop().await;
}

#[tokio::test]
async fn test_reservation_capacity_over_the_wire() {
    let node = TestNode::start(|config| {
        config.limits.max_reservations = Limit::Max(1);
    })
    .await;

    let mut first = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    first.reserve(false).await.unwrap();

    let mut second = RelayClient::connect(node.addr, &identity(2), AGENT).await.unwrap();
    let err = second.reserve(false).await.unwrap_err();
    assert!(matches!(
        err,
        NodeError::Rejected(Status::Rejected(RejectReason::CapacityExceeded))
    ));

    // A renewal on the control connection is still admitted
    let renewed = first.reserve(true).await.unwrap();
    assert_eq!(renewed.limits, LimitPolicy::default().circuit_caps());

    node.stop().await;
}

#[tokio::test]
async fn test_unaccepted_circuit_fails() {
    let node = TestNode::start(|_| {}).await;

    let mut destination = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    destination.reserve(false).await.unwrap();

    let source = RelayClient::connect(node.addr, &identity(2), AGENT).await.unwrap();
    let err = source
        .dial(identity(1).peer_id(), CircuitLimits::UNBOUNDED)
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Rejected(Status::ConnectionFailed)));

    // The announcement still arrived, but the circuit is gone
    let incoming = destination.next_incoming().await.unwrap();
    assert_eq!(node.relay.circuit_count(), 0);
    let err = destination.accept_incoming(&incoming).await.unwrap_err();
    assert!(matches!(err, NodeError::Rejected(_)));

    assert_eq!(
        node.metrics
            .count(|e| *e == RelayEvent::ConnectionRequestHandled(Status::ConnectionFailed)),
        1
    );

    node.stop().await;
}

#[tokio::test]
async fn test_closing_control_connection_releases_reservation() {
    let node = TestNode::start(|_| {}).await;

    let mut destination = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    destination.reserve(false).await.unwrap();
    assert!(node.relay.is_live(&identity(1).peer_id()));

    drop(destination);
    let relay = node.relay.clone();
    assert!(eventually(WAIT, || !relay.is_live(&identity(1).peer_id())).await);
    assert_eq!(node.metrics.closed_reservations(), 1);

    node.stop().await;
}

#[tokio::test]
async fn test_byte_limit_truncates_relayed_stream() {
    let node = TestNode::start(|config| {
        config.limits.max_circuit_bytes = Limit::Max(1000);
    })
    .await;

    let mut destination = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    destination.reserve(false).await.unwrap();

    let source = RelayClient::connect(node.addr, &identity(2), AGENT).await.unwrap();
    let dialing = tokio::spawn(source.dial(identity(1).peer_id(), CircuitLimits::UNBOUNDED));
    let incoming = destination.next_incoming().await.unwrap();
    assert_eq!(incoming.limits.bytes, Limit::Max(1000));

    let mut inbound = destination.accept_incoming(&incoming).await.unwrap();
    let mut outbound = dialing.await.unwrap().unwrap();

    outbound.stream.write_all(&[7u8; 1100]).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, inbound.stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), 1000);

    let relay = node.relay.clone();
    assert!(eventually(WAIT, || relay.circuit_count() == 0).await);

    node.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let node = TestNode::start(|_| {}).await;

    let mut destination = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    destination.reserve(false).await.unwrap();

    let relay = node.relay.clone();
    let metrics = node.metrics.clone();
    node.stop().await;

    assert_eq!(relay.reservation_count(), 0);
    assert_eq!(relay.circuit_count(), 0);
    assert_eq!(
        metrics
            .events()
            .last()
            .copied(),
        Some(RelayEvent::RelayStatus(false))
    );
    assert!(destination.ping(1).await.is_err());
}

#[tokio::test]
async fn test_welcome_carries_configured_agent() {
    let node = TestNode::start(|config| {
        config.node.agent = "relay-under-test/9.9".to_string();
    })
    .await;

    let client = RelayClient::connect(node.addr, &identity(1), AGENT).await.unwrap();
    assert_eq!(client.relay_agent(), "relay-under-test/9.9");

    node.stop().await;
}

#[tokio::test]
async fn test_spoofed_hello_is_rejected() {
    let node = TestNode::start(|_| {}).await;
    let victim = identity(1);
    let impostor = identity(9);

    let mut destination = RelayClient::connect(node.addr, &victim, AGENT).await.unwrap();
    destination.reserve(false).await.unwrap();

    let (mut spoofed, answer) = raw_handshake(node.addr, &victim, &impostor).await;
    assert!(matches!(
        answer,
        RelayMessage::Rejected {
            status: Status::AuthenticationFailed
        }
    ));
    // The relay hangs up instead of taking a renewal from the impostor
    let renewal = ClientMessage::Reserve { renewal: true };
    let _ = write_frame(&mut spoofed, &renewal).await;
    assert!(read_frame::<_, RelayMessage>(&mut spoofed).await.is_err());

    // The victim still owns its reservation and receives its circuits
    assert!(node.relay.is_live(&victim.peer_id()));
    let source = RelayClient::connect(node.addr, &identity(2), AGENT).await.unwrap();
    let dialing = tokio::spawn(source.dial(victim.peer_id(), CircuitLimits::UNBOUNDED));
    let incoming = destination.next_incoming().await.unwrap();
    assert_eq!(incoming.source, identity(2).peer_id());
    let inbound = destination.accept_incoming(&incoming).await.unwrap();
    let outbound = dialing.await.unwrap().unwrap();
    assert_eq!(inbound.id, outbound.id);

    assert_eq!(
        node.metrics
            .count(|e| matches!(e, RelayEvent::ReservationAllowed { .. })),
        1
    );
    assert_eq!(node.metrics.closed_reservations(), 0);

    node.stop().await;
}

#[tokio::test]
async fn test_client_gone_before_reserve_answer_releases_slot() {
    let node = TestNode::start(|config| {
        config.limits.max_reservations = Limit::Max(1);
    })
    .await;
    let peer = identity(1);

    let (mut stream, answer) = raw_handshake(node.addr, &peer, &peer).await;
    assert!(matches!(answer, RelayMessage::Authenticated));
    write_frame(&mut stream, &ClientMessage::Reserve { renewal: false })
        .await
        .unwrap();
    drop(stream);

    let relay = node.relay.clone();
    let metrics = node.metrics.clone();
    assert!(
        eventually(WAIT, || {
            metrics.count(|e| matches!(e, RelayEvent::ReservationAllowed { .. })) == 1
                && metrics.closed_reservations() == 1
                && relay.reservation_count() == 0
        })
        .await
    );

    // The single slot is free again
    let mut next = RelayClient::connect(node.addr, &identity(2), AGENT).await.unwrap();
    next.reserve(false).await.unwrap();

    node.stop().await;
}
