mod cli;

use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

use cli::Args;
use swarm_peer::bitfield::{Bitfield, SharedBitfield};
use swarm_peer::messages::{PeerMessage, RequestMessage};
use swarm_peer::peer_connection::PeerConnection;
use swarm_peer::tcp_connector::RealTcpConnector;
use swarm_peer::types::{BlockDelivery, PeerExit, PieceRequest, SwarmChannels};

const EXIT_CHANNEL_SIZE: usize = 4;
const REQUEST_CHANNEL_SIZE: usize = 16;
const DELIVERY_CHANNEL_SIZE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_timed();

    let args = Args::parse();
    let identity = args.identity()?;
    let config = args.config();

    let local = if args.seed {
        Bitfield::full(args.pieces)
    } else {
        Bitfield::new(args.pieces)
    };
    let local_bitfield: SharedBitfield = Arc::new(RwLock::new(local));

    let (exit_tx, mut exit_rx) = mpsc::channel::<PeerExit>(EXIT_CHANNEL_SIZE);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_SIZE);

    let scheduler = tokio::spawn(run_scheduler(
        request_rx,
        delivery_rx,
        local_bitfield.clone(),
        args.block_size,
    ));

    let connection = PeerConnection::new(
        args.peer.clone(),
        identity,
        args.pieces,
        local_bitfield,
        SwarmChannels {
            exit_tx,
            request_tx,
            delivery_tx,
        },
        config,
        Arc::new(RealTcpConnector),
    );

    info!("Connecting to peer {}", args.peer);
    let handle = connection.start();
    let mut status_rx = handle.subscribe();

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut deadline_hit = false;
    let mut status_open = true;

    let exit = loop {
        tokio::select! {
            exit = exit_rx.recv() => break exit,

            changed = status_rx.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let status = status_rx.borrow_and_update().clone();
                info!(
                    "Peer {} status: choking={} interested={} peer_choking={} peer_interested={} pieces={}",
                    handle.addr(),
                    status.am_choking,
                    status.am_interested,
                    status.peer_choking,
                    status.peer_interested,
                    status.remote_pieces
                );
            }

            _ = &mut deadline, if !deadline_hit => {
                deadline_hit = true;
                info!("Duration elapsed, disconnecting from {}", handle.addr());
                handle.shutdown().await;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting from {}", handle.addr());
                handle.shutdown().await;
            }
        }
    };

    match exit {
        Some(exit) => info!("Peer {} exited: {}", exit.addr, exit.reason),
        None => warn!("Exit channel closed without a report"),
    }

    if !handle.is_closed() {
        debug!("Waiting for peer {} tasks to stop", handle.addr());
    }
    handle.closed().await;
    scheduler.abort();

    Ok(())
}

/// Minimal scheduler: hands out the first block of each piece the peer has
/// and we lack, and logs what comes back.
async fn run_scheduler(
    mut request_rx: mpsc::Receiver<PieceRequest>,
    mut delivery_rx: mpsc::Receiver<BlockDelivery>,
    local_bitfield: SharedBitfield,
    block_size: u32,
) {
    let mut in_flight: HashSet<u32> = HashSet::new();

    loop {
        tokio::select! {
            Some(request) = request_rx.recv() => {
                let local = local_bitfield.read().await.clone();
                let next = (0..request.bitfield.len())
                    .find(|&i| request.bitfield.has(i) && !local.has(i) && !in_flight.contains(&(i as u32)));

                let Some(piece_index) = next else {
                    debug!("Peer {} has nothing new to assign", request.addr);
                    continue;
                };

                let piece_index = piece_index as u32;
                in_flight.insert(piece_index);
                info!("Assigning piece {} to peer {}", piece_index, request.addr);

                let msg = PeerMessage::Request(RequestMessage {
                    piece_index,
                    begin: 0,
                    length: block_size,
                });
                if request.response.send(msg).await.is_err() {
                    in_flight.remove(&piece_index);
                    warn!("Peer {} went away before its request was queued", request.addr);
                }
            }

            Some(delivery) = delivery_rx.recv() => match delivery {
                BlockDelivery::Block { addr, piece } => {
                    info!(
                        "Peer {} delivered piece {} begin {} ({} bytes)",
                        addr,
                        piece.piece_index,
                        piece.begin,
                        piece.block.len()
                    );
                    in_flight.remove(&piece.piece_index);
                    if let Err(e) = local_bitfield.write().await.set(piece.piece_index as usize) {
                        warn!("Peer {} delivered an unexpected piece: {}", addr, e);
                    }
                }
                BlockDelivery::Disconnected { addr } => {
                    info!("Peer {} disconnected, releasing {} assignments", addr, in_flight.len());
                    in_flight.clear();
                }
            },

            else => break,
        }
    }
}
