//! Integration tests for the send and receive paths.
//!
//! Tests the message path between services on one in-memory network:
//! 1. Per-sender FIFO through the merged receive channel
//! 2. Drop-newest when a sender's inbound buffer is full
//! 3. Token bucket limits on message count and bytes
//! 4. Message length limits on both ends

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use don_p2p::{
    ConnectionManager, Ed25519Signer, KeySource, LinkPhase, MemoryNetwork, Message,
    MessageReceiver, P2pError, Peer, PeerConfig, PeerId, RateLimitKind, Signer, StreamConfig,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn spawn_node(network: &MemoryNetwork, config: PeerConfig) -> Arc<ConnectionManager> {
    let signer = Arc::new(Ed25519Signer::new(KeySource::Generate));
    signer.initialize().unwrap();
    let transport = network.transport(signer.peer_id().unwrap());
    let manager = Arc::new(ConnectionManager::new(config, transport, signer).unwrap());
    manager.start().unwrap();
    manager
}

fn wants(peer: &ConnectionManager, config: StreamConfig) -> HashMap<PeerId, StreamConfig> {
    HashMap::from([(peer.local_id(), config)])
}

/// Links `a` and `b`, each side using its own config, and waits for the handshake.
async fn connect(
    a: &Arc<ConnectionManager>,
    a_config: StreamConfig,
    b: &Arc<ConnectionManager>,
    b_config: StreamConfig,
) {
    a.update_connections(&wants(b, a_config)).unwrap();
    b.update_connections(&wants(a, b_config)).unwrap();
    a.await_converged(Duration::from_secs(2)).await.unwrap();
    b.await_converged(Duration::from_secs(2)).await.unwrap();
}

async fn next(inbound: &mut MessageReceiver) -> Message {
    tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .unwrap()
        .unwrap()
}

fn index(message: &Message) -> u32 {
    u32::from_be_bytes(message.payload[..4].try_into().unwrap())
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn messages_from_each_sender_arrive_in_order() {
    let network = MemoryNetwork::new();
    let receiver = spawn_node(&network, PeerConfig::default());
    let s1 = spawn_node(&network, PeerConfig::default());
    let s2 = spawn_node(&network, PeerConfig::default());
    receiver
        .update_connections(&HashMap::from([
            (s1.local_id(), StreamConfig::default()),
            (s2.local_id(), StreamConfig::default()),
        ]))
        .unwrap();
    s1.update_connections(&wants(&receiver, StreamConfig::default())).unwrap();
    s2.update_connections(&wants(&receiver, StreamConfig::default())).unwrap();
    for node in [&receiver, &s1, &s2] {
        node.await_converged(Duration::from_secs(2)).await.unwrap();
    }
    let mut inbound = receiver.receive().unwrap();

    for i in 0..50u32 {
        s1.send(receiver.local_id(), &i.to_be_bytes()).unwrap();
        s2.send(receiver.local_id(), &i.to_be_bytes()).unwrap();
    }

    let mut seen: HashMap<PeerId, Vec<u32>> = HashMap::new();
    for _ in 0..100 {
        let message = next(&mut inbound).await;
        seen.entry(message.sender).or_default().push(index(&message));
    }

    let expected: Vec<u32> = (0..50).collect();
    assert_eq!(seen[&s1.local_id()], expected);
    assert_eq!(seen[&s2.local_id()], expected);
    assert!(inbound.try_recv().is_none());
}

#[tokio::test]
async fn full_inbound_buffer_drops_newest() {
    let network = MemoryNetwork::new();
    let receiver = spawn_node(&network, PeerConfig::default().with_receive_channel_size(1));
    let sender = spawn_node(&network, PeerConfig::default());
    connect(
        &sender,
        StreamConfig::default(),
        &receiver,
        StreamConfig::default().with_incoming_buffer(3),
    )
    .await;
    let mut inbound = receiver.receive().unwrap();

    // Sends complete synchronously; the router only drains once this task yields.
    for i in 0..10u32 {
        sender.send(receiver.local_id(), &i.to_be_bytes()).unwrap();
    }

    for expected in 0..3 {
        assert_eq!(index(&next(&mut inbound).await), expected);
    }
    let stats = receiver.stats();
    assert_eq!(stats.messages_received, 3);
    assert_eq!(stats.congestion_drops, 7);
    assert_eq!(receiver.health_report()[0].health.congestion_drops, 7);

    // Room again once the backlog is consumed.
    sender.send(receiver.local_id(), &10u32.to_be_bytes()).unwrap();
    assert_eq!(index(&next(&mut inbound).await), 10);
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[tokio::test]
async fn message_bucket_refills_over_time() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, PeerConfig::default());
    let b = spawn_node(&network, PeerConfig::default());
    connect(
        &a,
        StreamConfig::default().with_message_rate(1.0, 5),
        &b,
        StreamConfig::default(),
    )
    .await;

    for _ in 0..5 {
        a.send(b.local_id(), b"tick").unwrap();
    }
    let err = a.send(b.local_id(), b"tick").unwrap_err();
    assert!(matches!(
        err,
        P2pError::RateLimitExceeded {
            limit: RateLimitKind::Messages,
            ..
        }
    ));
    assert!(err.is_retryable());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    a.send(b.local_id(), b"tick").unwrap();
    assert!(a.send(b.local_id(), b"tick").is_err());
    assert_eq!(a.stats().messages_sent, 6);
    assert_eq!(a.stats().rate_limited, 2);
}

#[tokio::test]
async fn byte_bucket_limits_payload_volume() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, PeerConfig::default());
    let b = spawn_node(&network, PeerConfig::default());
    connect(
        &a,
        StreamConfig::default().with_bytes_rate(1.0, 100),
        &b,
        StreamConfig::default(),
    )
    .await;

    a.send(b.local_id(), &[0u8; 60]).unwrap();
    let err = a.send(b.local_id(), &[0u8; 60]).unwrap_err();
    assert!(matches!(
        err,
        P2pError::RateLimitExceeded {
            limit: RateLimitKind::Bytes,
            ..
        }
    ));
    a.send(b.local_id(), &[0u8; 30]).unwrap();
}

// ============================================================================
// Length Limits and Link State
// ============================================================================

#[tokio::test]
async fn oversized_messages_are_refused_on_both_ends() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, PeerConfig::default());
    let b = spawn_node(&network, PeerConfig::default());
    connect(
        &a,
        StreamConfig::default().with_max_message_len(1024),
        &b,
        StreamConfig::default().with_max_message_len(16),
    )
    .await;
    let mut inbound = b.receive().unwrap();

    // b enforces its own limit on what it sends...
    assert!(matches!(
        b.send(a.local_id(), &[0u8; 17]),
        Err(P2pError::PayloadTooLarge { len: 17, max: 16, .. })
    ));

    // ...and on what it accepts.
    a.send(b.local_id(), &[0u8; 32]).unwrap();
    a.send(b.local_id(), &[1u8; 16]).unwrap();
    let message = next(&mut inbound).await;
    assert_eq!(message.payload, vec![1u8; 16]);
    assert_eq!(b.stats().oversized_drops, 1);
}

#[tokio::test]
async fn send_requires_connected_link() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, PeerConfig::default());
    let b = spawn_node(&network, PeerConfig::default());

    assert!(matches!(
        a.send(b.local_id(), b"x"),
        Err(P2pError::NotFound { .. })
    ));

    // Only one side has asked for the link.
    a.update_connections(&wants(&b, StreamConfig::default())).unwrap();
    assert!(matches!(
        a.send(b.local_id(), b"x"),
        Err(P2pError::LinkUnavailable {
            phase: LinkPhase::Connecting,
            ..
        })
    ));
    assert_eq!(a.pending_links(), 1);
}
