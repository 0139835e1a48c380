//! Network Message Types
//!
//! Every message on either transport is one JSON envelope:
//! `{ "type", "data", "timestamp", "sender", "signature"? }`.
//! `data` carries a typed payload selected by `type`; `sender` is the hex
//! Ed25519 public key of the originating node. When present, `signature`
//! covers the type, timestamp, sender and the serialized payload.

use crate::types::{Block, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stakemesh_crypto::{PublicKey, Signature, SignatureError, Signer, Verifier};
use std::fmt;

/// Maximum encoded message size (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum blocks carried by one sync response
pub const MAX_BLOCKS_PER_MESSAGE: usize = 100;

const SIGNING_DOMAIN: &[u8] = b"stakemesh-msg-v1";

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Block,
    Transaction,
    PeerDiscovery,
    SyncRequest,
    SyncResponse,
    Ping,
    Pong,
}

impl MessageKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Transaction => "transaction",
            Self::PeerDiscovery => "peer_discovery",
            Self::SyncRequest => "sync_request",
            Self::SyncResponse => "sync_response",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMessage {
    /// Payload type
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Typed payload as JSON
    pub data: serde_json::Value,
    /// Creation time (Unix ms)
    pub timestamp: u64,
    /// Hex public key of the sending node
    pub sender: String,
    /// Optional hex Ed25519 signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl NetworkMessage {
    /// Build an unsigned envelope around `payload`
    pub fn new<T: Serialize>(
        kind: MessageKind,
        payload: &T,
        sender: impl Into<String>,
        timestamp: u64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            data: serde_json::to_value(payload)?,
            timestamp,
            sender: sender.into(),
            signature: None,
        })
    }

    /// Sign the envelope with the node key
    pub fn sign(mut self, signer: &dyn Signer) -> Self {
        let signature = signer.sign(&self.signing_bytes());
        self.signature = Some(signature.to_hex());
        self
    }

    /// Check whether a signature is attached
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Verify the attached signature against the sender key
    ///
    /// Unsigned envelopes fail with `InvalidSignature`.
    pub fn verify(&self, verifier: &dyn Verifier) -> Result<(), SignatureError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or(SignatureError::InvalidSignature)?;
        let signature = Signature::from_hex(signature)?;
        let public_key = PublicKey::from_hex(&self.sender)?;
        verifier.verify(&public_key, &self.signing_bytes(), &signature)
    }

    /// Decode the payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Distance between `now` and the envelope timestamp (ms)
    pub fn age_ms(&self, now: u64) -> u64 {
        now.abs_diff(self.timestamp)
    }

    /// Encode as JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let data = self.data.to_string();
        let mut bytes = Vec::with_capacity(SIGNING_DOMAIN.len() + data.len() + self.sender.len() + 32);
        bytes.extend_from_slice(SIGNING_DOMAIN);
        bytes.extend_from_slice(self.kind.as_str().as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(self.sender.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(data.as_bytes());
        bytes
    }
}

/// A dialable address advertised by a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framed_port: Option<u16>,
}

/// `peer_discovery` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDiscovery {
    /// Hex public key of the announcing node
    pub node_id: String,
    /// Gossip topics the node accepts
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framed_port: Option<u16>,
    /// Peers the node is connected to
    #[serde(default)]
    pub known_peers: Vec<PeerAddress>,
}

/// `sync_request` payload: inclusive block range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from: u64,
    pub to: u64,
}

/// `sync_response` payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// `ping` and `pong` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakemesh_crypto::{Blake3Hasher, Ed25519Keypair, Ed25519Verifier};

    fn keypair() -> Ed25519Keypair {
        Ed25519Keypair::from_seed(&[3u8; 32])
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = NetworkMessage::new(MessageKind::Ping, &Heartbeat { nonce: 9 }, "abcd", 1_000).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "ping");
        assert_eq!(json["data"]["nonce"], 9);
        assert_eq!(json["timestamp"], 1_000);
        assert_eq!(json["sender"], "abcd");
        assert!(json.get("signature").is_none());
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in [
            MessageKind::Block,
            MessageKind::Transaction,
            MessageKind::PeerDiscovery,
            MessageKind::SyncRequest,
            MessageKind::SyncResponse,
            MessageKind::Ping,
            MessageKind::Pong,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }

    #[test]
    fn test_signed_envelope_survives_transport() {
        let keypair = keypair();
        let sender = keypair.public_key().to_hex();
        let block = Block::genesis(5, 1_000_000, 10_000, &Blake3Hasher);

        let msg = NetworkMessage::new(MessageKind::Block, &block, sender, 42)
            .unwrap()
            .sign(&keypair);
        let decoded = NetworkMessage::decode(&msg.encode().unwrap()).unwrap();

        assert!(decoded.verify(&Ed25519Verifier).is_ok());
        assert_eq!(decoded.payload::<Block>().unwrap(), block);
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let keypair = keypair();
        let mut msg = NetworkMessage::new(
            MessageKind::SyncRequest,
            &SyncRequest { from: 1, to: 5 },
            keypair.public_key().to_hex(),
            42,
        )
        .unwrap()
        .sign(&keypair);

        msg.data = serde_json::to_value(SyncRequest { from: 1, to: 500 }).unwrap();
        assert!(msg.verify(&Ed25519Verifier).is_err());
    }

    #[test]
    fn test_unsigned_envelope_fails_verify() {
        let msg = NetworkMessage::new(MessageKind::Ping, &Heartbeat { nonce: 1 }, "00", 0).unwrap();
        assert!(!msg.is_signed());
        assert_eq!(msg.verify(&Ed25519Verifier), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn test_age_is_symmetric() {
        let msg = NetworkMessage::new(MessageKind::Pong, &Heartbeat { nonce: 1 }, "00", 50_000).unwrap();
        assert_eq!(msg.age_ms(80_000), 30_000);
        assert_eq!(msg.age_ms(20_000), 30_000);
    }

    #[test]
    fn test_discovery_defaults() {
        let discovery: PeerDiscovery =
            serde_json::from_str(r#"{"node_id":"aa","capabilities":["block"]}"#).unwrap();
        assert!(discovery.known_peers.is_empty());
        assert_eq!(discovery.stream_port, None);
    }
}
