//! Peer network integration tests
//!
//! Several networks on loopback talking through their public handles.

use stakemesh::p2p::{
    NetworkConfig, NetworkEvent, NetworkIdentity, PeerNetwork, StartedNetwork, TransportKind, CAPABILITY_BLOCK,
};
use stakemesh::types::{Address, Transaction};
use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Signer};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn identity(seed: u8) -> NetworkIdentity {
    NetworkIdentity::ed25519(Ed25519Keypair::from_seed(&[seed; 32]))
}

async fn start(seed: u8, config: NetworkConfig) -> StartedNetwork {
    PeerNetwork::start(config, identity(seed)).await.unwrap()
}

fn signed_transfer() -> Transaction {
    let keypair = Ed25519Keypair::from_seed(&[42; 32]);
    let from = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);
    Transaction::transfer(from, Address::new([7; 20]), 5, 0, 1, 1_000).sign(&keypair, &Blake3Hasher)
}

/// Wait for `count` discovery announcements
async fn await_discoveries(events: &mut mpsc::Receiver<NetworkEvent>, count: usize) {
    let mut seen = 0;
    while seen < count {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("discovery timeout")
            .expect("event channel closed");
        if matches!(event, NetworkEvent::PeerDiscovered { .. }) {
            seen += 1;
        }
    }
}

/// Next received transaction, if any arrives within `wait`
async fn received_transaction(events: &mut mpsc::Receiver<NetworkEvent>, wait: Duration) -> Option<Transaction> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(NetworkEvent::TransactionReceived { transaction, .. })) => return Some(*transaction),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

#[tokio::test]
async fn test_unreachable_peer_resolves_false() {
    let net = start(1, NetworkConfig::local()).await;

    let started = Instant::now();
    let connected = net
        .handle
        .connect_to_peer("10.255.255.1", 7400, TransportKind::Stream)
        .await
        .unwrap();

    assert!(!connected);
    assert!(started.elapsed() < Duration::from_secs(7));
    assert_eq!(net.handle.get_connected_peers_count().await.unwrap(), 0);
    assert!(net.handle.get_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_broadcast_respects_capabilities() {
    let mut hub = start(1, NetworkConfig::local()).await;
    let mut full_a = start(2, NetworkConfig::local()).await;
    let mut full_b = start(3, NetworkConfig::local()).await;
    let mut blocks_only = start(
        4,
        NetworkConfig {
            capabilities: vec![CAPABILITY_BLOCK.into()],
            ..NetworkConfig::local()
        },
    )
    .await;

    for (peer, transport, port) in [
        (&full_a, TransportKind::Stream, hub.stream_addr.port()),
        (&full_b, TransportKind::Framed, hub.framed_addr.port()),
        (&blocks_only, TransportKind::Stream, hub.stream_addr.port()),
    ] {
        assert!(peer.handle.connect_to_peer("127.0.0.1", port, transport).await.unwrap());
    }
    await_discoveries(&mut hub.events, 3).await;

    let tx = signed_transfer();
    let reached = hub.handle.broadcast_transaction(&tx).await.unwrap();
    assert_eq!(reached, 2);

    let wait = Duration::from_secs(5);
    assert_eq!(received_transaction(&mut full_a.events, wait).await.map(|t| t.hash), Some(tx.hash));
    assert_eq!(received_transaction(&mut full_b.events, wait).await.map(|t| t.hash), Some(tx.hash));
    assert!(received_transaction(&mut blocks_only.events, Duration::from_millis(500))
        .await
        .is_none());
}

#[tokio::test]
async fn test_peer_limit_holds_for_outbound_dials() {
    let hub = start(
        1,
        NetworkConfig {
            max_peers: 2,
            ..NetworkConfig::local()
        },
    )
    .await;
    let mut others = Vec::new();
    for seed in 2..5 {
        others.push(start(seed, NetworkConfig::local()).await);
    }

    let mut results = Vec::new();
    for other in &others {
        results.push(
            hub.handle
                .connect_to_peer("127.0.0.1", other.stream_addr.port(), TransportKind::Stream)
                .await
                .unwrap(),
        );
    }

    assert_eq!(results, vec![true, true, false]);
    assert_eq!(hub.handle.get_connected_peers_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_sync_request_round_trip() {
    let mut a = start(1, NetworkConfig::local()).await;
    let mut b = start(2, NetworkConfig::local()).await;
    assert!(b
        .handle
        .connect_to_peer("127.0.0.1", a.framed_addr.port(), TransportKind::Framed)
        .await
        .unwrap());

    let peer_on_b = loop {
        match b.events.recv().await {
            Some(NetworkEvent::PeerConnected { peer, .. }) => break peer,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    };
    b.handle.request_sync(peer_on_b, 1, 5).await.unwrap();

    let (peer_on_a, from, to) = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), a.events.recv())
            .await
            .expect("sync request timeout");
        if let Some(NetworkEvent::SyncRequested { peer, from, to }) = event {
            break (peer, from, to);
        }
    };
    assert_eq!((from, to), (1, 5));

    let tx = signed_transfer();
    a.handle
        .send_sync_response(peer_on_a, Vec::new(), vec![tx.clone()])
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), b.events.recv())
            .await
            .expect("sync response timeout");
        if let Some(NetworkEvent::SyncResponse { blocks, transactions, .. }) = event {
            assert!(blocks.is_empty());
            assert_eq!(transactions.len(), 1);
            assert_eq!(transactions[0].hash, tx.hash);
            break;
        }
    }
}
