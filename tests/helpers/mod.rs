#![allow(dead_code)]

pub mod fakes;

use std::sync::Arc;
use std::time::Duration;
use swarm_peer::bitfield::{Bitfield, SharedBitfield};
use swarm_peer::config::PeerConfig;
use swarm_peer::peer::SwarmIdentity;
use swarm_peer::peer_connection::{PeerConnection, PeerHandle};
use swarm_peer::tcp_connector::RealTcpConnector;
use swarm_peer::traits::TcpConnector;
use swarm_peer::types::{BlockDelivery, PeerExit, PieceRequest, SwarmChannels};
use tokio::sync::{RwLock, mpsc};

use fakes::RemotePeer;

pub const PEER_ADDR: &str = "127.0.0.1:6881";
pub const INFO_HASH: [u8; 20] = [0xab; 20];
pub const LOCAL_PEER_ID: [u8; 20] = *b"-SP0100-000000000001";
pub const REMOTE_PEER_ID: [u8; 20] = *b"-RM0001-999999999999";

/// The scheduler and owner side of a connection.
pub struct Swarm {
    pub channels: SwarmChannels,
    pub exit_rx: mpsc::Receiver<PeerExit>,
    pub request_rx: mpsc::Receiver<PieceRequest>,
    pub delivery_rx: mpsc::Receiver<BlockDelivery>,
}

impl Swarm {
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(8);
        let (request_tx, request_rx) = mpsc::channel(16);
        let (delivery_tx, delivery_rx) = mpsc::channel(16);

        Self {
            channels: SwarmChannels {
                exit_tx,
                request_tx,
                delivery_tx,
            },
            exit_rx,
            request_rx,
            delivery_rx,
        }
    }

    pub async fn next_exit(&mut self) -> PeerExit {
        tokio::time::timeout(Duration::from_secs(2), self.exit_rx.recv())
            .await
            .expect("timed out waiting for the peer exit")
            .expect("exit channel closed")
    }

    pub async fn next_request(&mut self) -> PieceRequest {
        tokio::time::timeout(Duration::from_secs(1), self.request_rx.recv())
            .await
            .expect("timed out waiting for a piece request")
            .expect("request channel closed")
    }

    pub async fn next_delivery(&mut self) -> BlockDelivery {
        tokio::time::timeout(Duration::from_secs(1), self.delivery_rx.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("delivery channel closed")
    }
}

pub fn identity() -> SwarmIdentity {
    SwarmIdentity::new(INFO_HASH, LOCAL_PEER_ID)
}

pub fn shared(bitfield: Bitfield) -> SharedBitfield {
    Arc::new(RwLock::new(bitfield))
}

pub fn test_config() -> PeerConfig {
    PeerConfig {
        connect_timeout: Duration::from_secs(1),
        io_timeout: Duration::from_secs(1),
        hand_off_timeout: Duration::from_millis(200),
        ..PeerConfig::default()
    }
}

pub fn connection(
    addr: &str,
    num_pieces: usize,
    local: Bitfield,
    swarm: &Swarm,
    config: PeerConfig,
    connector: Arc<dyn TcpConnector>,
) -> PeerConnection {
    PeerConnection::new(
        addr.to_string(),
        identity(),
        num_pieces,
        shared(local),
        swarm.channels.clone(),
        config,
        connector,
    )
}

/// Starts a connection over an in-memory wire whose handshake is already done.
pub fn start_on_wire(local: Bitfield, swarm: &Swarm, config: PeerConfig) -> (PeerHandle, RemotePeer) {
    let num_pieces = local.len();
    let (reader, writer, remote) = fakes::wire();

    let handle = connection(
        PEER_ADDR,
        num_pieces,
        local,
        swarm,
        config,
        Arc::new(RealTcpConnector),
    )
    .start_with_io(REMOTE_PEER_ID, Box::new(reader), Box::new(writer));

    (handle, remote)
}

pub async fn wait_closed(handle: PeerHandle) {
    tokio::time::timeout(Duration::from_secs(2), handle.closed())
        .await
        .expect("connection tasks did not stop");
}
