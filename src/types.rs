use std::fmt;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::bitfield::Bitfield;
use crate::messages::{PeerMessage, PieceMessage};
use crate::peer::{PeerAddr, PeerId};

/// Asks the scheduler to pick a block this peer can serve. The scheduler
/// answers on `response` with a concrete `request` message.
#[derive(Debug)]
pub struct PieceRequest {
    pub bitfield: Bitfield,
    pub response: mpsc::Sender<PeerMessage>,
    pub addr: PeerAddr,
}

/// Traffic from a connection to the scheduler's delivery inbox.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelivery {
    Block { addr: PeerAddr, piece: PieceMessage },
    /// Terminal marker: blocks owned by `addr` must be reassigned.
    Disconnected { addr: PeerAddr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Resolve, dial or pre-dial validation failed.
    Connect(String),
    Handshake(String),
    /// Read or write failure on the established connection.
    Io(String),
    /// The remote violated the protocol or the dispatcher could not proceed.
    Protocol(String),
    StreamClosed,
    Cancelled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect_error: {}", e),
            Self::Handshake(e) => write!(f, "handshake_error: {}", e),
            Self::Io(e) => write!(f, "io_error: {}", e),
            Self::Protocol(e) => write!(f, "protocol_error: {}", e),
            Self::StreamClosed => write!(f, "stream_closed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The single terminal report a connection sends to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerExit {
    pub addr: PeerAddr,
    pub reason: ExitReason,
}

/// Shared channels handed to every connection of a swarm.
#[derive(Debug, Clone)]
pub struct SwarmChannels {
    pub exit_tx: mpsc::Sender<PeerExit>,
    pub request_tx: mpsc::Sender<PieceRequest>,
    pub delivery_tx: mpsc::Sender<BlockDelivery>,
}

/// Read-only snapshot of a connection's protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub remote_peer_id: Option<PeerId>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub remote_pieces: usize,
    pub last_keep_alive_at: Option<Instant>,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            remote_peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_pieces: 0,
            last_keep_alive_at: None,
        }
    }
}
