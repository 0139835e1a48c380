//! Two-node integration tests
//!
//! A devnet producer and a follower that joins late: the follower has to
//! sync the blocks it missed, then keep up through gossip. Two validators
//! on separate nodes must build one chain between them.

use stakemesh::node::config::DEVNET_SEED;
use stakemesh::node::{BootstrapPeer, GenesisValidator, Node, NodeConfig};
use stakemesh::p2p::TransportKind;
use stakemesh::storage::StateStore;
use stakemesh::types::{now_millis, Address, Transaction};
use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Signer};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn producer_config(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::devnet(dir.to_path_buf());
    config.stream_port = 0;
    config.framed_port = 0;
    config.producer.block_time_ms = 100;
    config
}

fn bootstrap_to(node: &Node, transport: TransportKind) -> BootstrapPeer {
    let port = match transport {
        TransportKind::Stream => node.stream_addr().port(),
        TransportKind::Framed => node.framed_addr().port(),
    };
    BootstrapPeer {
        host: "127.0.0.1".into(),
        port,
        transport,
    }
}

/// Same chain as the producer with a random key, so it never owns a slot
fn follower_config(dir: &Path, producer: &Node, transport: TransportKind) -> NodeConfig {
    let mut config = producer_config(dir);
    config.identity_seed = None;
    config.validator = None;
    config.bootstrap_peers = vec![bootstrap_to(producer, transport)];
    config
}

/// Genesis with one validator per seed; the node runs the key of `own`
fn validator_config(dir: &Path, seeds: &[[u8; 32]], own: usize, genesis_timestamp: u64) -> NodeConfig {
    let mut config = producer_config(dir);
    let stake = 10 * config.consensus.min_stake;
    config.genesis.timestamp = genesis_timestamp;
    config.genesis.validators = seeds
        .iter()
        .map(|seed| GenesisValidator {
            address: key_address(seed),
            stake,
        })
        .collect();
    config.identity_seed = Some(hex::encode(seeds[own]));
    config.validator = None;
    config
}

fn key_address(seed: &[u8; 32]) -> Address {
    Address::from_public_key(&Ed25519Keypair::from_seed(seed).public_key(), &Blake3Hasher)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn same_prefix(a: &Node, b: &Node, upto: u64) {
    for number in 0..=upto {
        let left = a.chain().state().get_block(number).unwrap().map(|blk| blk.hash());
        let right = b.chain().state().get_block(number).unwrap().map(|blk| blk.hash());
        assert!(left.is_some(), "block {number} missing on producer");
        assert_eq!(left, right, "block {number} differs");
    }
}

#[tokio::test]
async fn test_late_follower_syncs_and_follows() {
    let producer_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();

    let producer = Node::start(producer_config(producer_dir.path()), CancellationToken::new())
        .await
        .unwrap();
    wait_until("producer height 3", || producer.height() >= 3).await;

    let follower = Node::start(
        follower_config(follower_dir.path(), &producer, TransportKind::Framed),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(follower.network().get_connected_peers_count().await.unwrap(), 1);

    wait_until("follower catch-up", || follower.height() >= 5).await;
    let upto = follower.height();
    same_prefix(&producer, &follower, upto);

    // Epoch rotation replays identically on both sides
    wait_until("second epoch", || follower.consensus_state().epoch >= 2).await;
    same_prefix(&producer, &follower, follower.height());
    assert!(follower.consensus_state().epoch <= producer.consensus_state().epoch);

    follower.stop().await.unwrap();
    producer.stop().await.unwrap();
}

#[tokio::test]
async fn test_transaction_from_follower_is_included() {
    let producer_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();

    let producer = Node::start(producer_config(producer_dir.path()), CancellationToken::new())
        .await
        .unwrap();
    let follower = Node::start(
        follower_config(follower_dir.path(), &producer, TransportKind::Stream),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    wait_until("follower synced", || follower.height() >= 2).await;

    let keypair = Ed25519Keypair::from_seed(&DEVNET_SEED);
    let sender = Address::from_public_key(&keypair.public_key(), &Blake3Hasher);
    let recipient = Address::new([0x42; 20]);
    let tx = Transaction::transfer(sender, recipient, 1_000, 0, 1, now_millis()).sign(&keypair, &Blake3Hasher);

    assert!(follower.submit_transaction(tx.clone()).await.unwrap());

    wait_until("transfer applied on both nodes", || {
        let on_producer = producer.chain().state().get_balance(&recipient).unwrap();
        let on_follower = follower.chain().state().get_balance(&recipient).unwrap();
        on_producer == 1_000 && on_follower == 1_000
    })
    .await;

    assert_eq!(follower.chain().state().get_nonce(&sender).unwrap(), 1);
    assert!(!follower.chain().mempool().contains(&tx.hash));
    assert!(!producer.chain().mempool().contains(&tx.hash));

    follower.stop().await.unwrap();
    producer.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_validators_build_one_chain() {
    let seeds = [[0x51; 32], [0x52; 32]];
    let genesis_timestamp = now_millis();
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();

    let first = Node::start(
        validator_config(first_dir.path(), &seeds, 0, genesis_timestamp),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let mut second_config = validator_config(second_dir.path(), &seeds, 1, genesis_timestamp);
    second_config.bootstrap_peers = vec![bootstrap_to(&first, TransportKind::Framed)];
    let second = Node::start(second_config, CancellationToken::new()).await.unwrap();

    wait_until("both nodes at height 12", || first.height() >= 12 && second.height() >= 12).await;
    let upto = first.height().min(second.height());
    same_prefix(&first, &second, upto);

    // Both validators authored part of the shared chain
    let proposers: std::collections::HashSet<Address> = (1..=upto)
        .map(|n| first.chain().state().get_block(n).unwrap().unwrap().header.proposer)
        .collect();
    assert!(proposers.contains(&key_address(&seeds[0])));
    assert!(proposers.contains(&key_address(&seeds[1])));

    second.stop().await.unwrap();
    first.stop().await.unwrap();
}
