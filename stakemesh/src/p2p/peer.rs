//! Peer Identity and Connection State
//!
//! A `PeerId` names one live connection. The remote node id is only known
//! once its `peer_discovery` arrives. The network loop owns every
//! `PeerConnection`; callers only see `PeerInfo` snapshots.

use super::message::PeerAddress;
use super::transport::Frame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Local identifier of one connection
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Wire transport of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Newline-delimited JSON
    Stream,
    /// Length-prefixed JSON frames
    Framed,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::Framed => f.write_str("framed"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Self::Stream),
            "framed" => Ok(Self::Framed),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// Connection direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

/// Peer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Socket open, reader and writer running
    Connected,
    /// Terminal; the entry is discarded
    Disconnected,
}

/// Snapshot of a peer for callers
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Local connection id
    pub id: PeerId,
    /// Remote socket address
    pub addr: SocketAddr,
    /// Transport used by the connection
    pub transport: TransportKind,
    /// Who opened the connection
    pub direction: ConnectionDirection,
    /// Current state
    pub state: PeerState,
    /// Remote node id, once discovered
    pub node_id: Option<String>,
    /// Advertised gossip topics
    pub capabilities: BTreeSet<String>,
    /// Advertised listen ports
    pub stream_port: Option<u16>,
    pub framed_port: Option<u16>,
    /// Last time any valid message arrived
    pub last_seen: Instant,
    /// Round-trip time of the latest answered ping
    pub latency: Option<Duration>,
}

impl PeerInfo {
    /// Check an advertised capability
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Address other nodes can dial, when the peer advertised ports
    pub fn dial_address(&self) -> Option<PeerAddress> {
        if self.stream_port.is_none() && self.framed_port.is_none() {
            return None;
        }
        Some(PeerAddress {
            host: self.addr.ip().to_string(),
            stream_port: self.stream_port,
            framed_port: self.framed_port,
        })
    }
}

/// Live connection owned by the network loop
///
/// Dropping it aborts the reader task and closes the writer channel, which
/// ends the writer task and releases the socket.
pub(crate) struct PeerConnection {
    pub info: PeerInfo,
    pub sender: mpsc::Sender<Frame>,
    pub reader: JoinHandle<()>,
    /// Outstanding ping: nonce and send time
    pub pending_ping: Option<(u64, Instant)>,
}

impl PeerConnection {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        transport: TransportKind,
        direction: ConnectionDirection,
        sender: mpsc::Sender<Frame>,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            info: PeerInfo {
                id,
                addr,
                transport,
                direction,
                state: PeerState::Connected,
                node_id: None,
                capabilities: BTreeSet::new(),
                stream_port: None,
                framed_port: None,
                last_seen: Instant::now(),
                latency: None,
            },
            sender,
            reader,
            pending_ping: None,
        }
    }

    /// Record an answered ping; returns the measured latency on a match
    pub fn record_pong(&mut self, nonce: u64) -> Option<Duration> {
        match self.pending_ping {
            Some((expected, sent)) if expected == nonce => {
                let latency = sent.elapsed();
                self.info.latency = Some(latency);
                self.pending_ping = None;
                Some(latency)
            }
            _ => None,
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.info.state = PeerState::Disconnected;
        self.reader.abort();
    }
}
