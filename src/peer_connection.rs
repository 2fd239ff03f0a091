use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use crate::bitfield::SharedBitfield;
use crate::config::{CANCEL_CHANNEL_SIZE, PeerConfig, WRITER_CHANNEL_SIZE};
use crate::dispatcher::Dispatcher;
use crate::error::{CodecError, PeerError};
use crate::handshake;
use crate::messages::{BitfieldMessage, PeerMessage};
use crate::peer::{PeerAddr, PeerId, SwarmIdentity};
use crate::shutdown::Shutdown;
use crate::traits::{MessageReader, MessageWriter, TcpConnector};
use crate::types::{ExitReason, PeerStatus, SwarmChannels};
use crate::write_queue::WriteQueue;

type Transport = (PeerId, Box<dyn MessageReader>, Box<dyn MessageWriter>);

/// One connection to one remote peer.
///
/// `start` spawns three tasks: the write queue, the writer (which dials,
/// handshakes, announces our bitfield and then owns the write half) and the
/// reader (spawned by the writer once the connection is up; it owns the
/// dispatcher and with it all protocol state).
#[derive(Debug)]
pub struct PeerConnection {
    addr: PeerAddr,
    identity: SwarmIdentity,
    num_pieces: usize,
    local_bitfield: SharedBitfield,
    channels: SwarmChannels,
    config: PeerConfig,
    tcp_connector: Arc<dyn TcpConnector>,
}

impl PeerConnection {
    pub fn new(
        addr: PeerAddr,
        identity: SwarmIdentity,
        num_pieces: usize,
        local_bitfield: SharedBitfield,
        channels: SwarmChannels,
        config: PeerConfig,
        tcp_connector: Arc<dyn TcpConnector>,
    ) -> Self {
        Self {
            addr,
            identity,
            num_pieces,
            local_bitfield,
            channels,
            config,
            tcp_connector,
        }
    }

    /// Dials the peer in the background. Failures are reported on the exit
    /// channel, never returned.
    pub fn start(self) -> PeerHandle {
        self.launch(None)
    }

    /// Runs the same lifecycle over a transport whose handshake is already done.
    pub fn start_with_io(
        self,
        remote_peer_id: PeerId,
        reader: Box<dyn MessageReader>,
        writer: Box<dyn MessageWriter>,
    ) -> PeerHandle {
        self.launch(Some((remote_peer_id, reader, writer)))
    }

    fn launch(self, transport: Option<Transport>) -> PeerHandle {
        let shutdown = Arc::new(Shutdown::new(
            self.addr.clone(),
            self.channels.exit_tx.clone(),
            self.channels.delivery_tx.clone(),
            self.config.hand_off_timeout,
        ));

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let (cancel_tx, cancel_rx) = mpsc::channel(CANCEL_CHANNEL_SIZE);
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_SIZE);
        let (status_tx, status_rx) = watch::channel(PeerStatus::default());

        let queue = WriteQueue::new(
            self.addr.clone(),
            outbound_rx,
            cancel_rx,
            writer_tx,
            shutdown.token(),
        );
        let queue_task = tokio::spawn(queue.run());

        let dispatcher = Dispatcher::new(
            self.addr.clone(),
            self.num_pieces,
            self.local_bitfield.clone(),
            outbound_tx,
            cancel_tx,
            &self.channels,
            self.config.hand_off_timeout,
            status_tx,
        );

        let addr = self.addr.clone();
        let session = Session {
            conn: self,
            shutdown: shutdown.clone(),
        };
        let writer_task = tokio::spawn(session.run_writer(transport, dispatcher, writer_rx));

        PeerHandle {
            addr,
            shutdown,
            status_rx,
            writer_task,
            queue_task,
        }
    }
}

struct Session {
    conn: PeerConnection,
    shutdown: Arc<Shutdown>,
}

impl Session {
    async fn run_writer(
        self,
        transport: Option<Transport>,
        mut dispatcher: Dispatcher,
        mut writer_rx: mpsc::Receiver<PeerMessage>,
    ) {
        let addr = self.conn.addr.clone();
        let token = self.shutdown.token();

        let established = tokio::select! {
            biased;

            _ = token.cancelled() => {
                debug!("Peer {} cancelled before the connection was up", addr);
                return;
            }

            result = self.establish(transport) => result,
        };

        let (remote_peer_id, reader, mut writer) = match established {
            Ok(transport) => transport,
            Err(reason) => {
                self.shutdown.trigger(reason).await;
                return;
            }
        };

        self.shutdown.mark_established();
        dispatcher.set_remote_peer_id(remote_peer_id);
        info!(
            "Peer {} connected (peer id {})",
            addr,
            hex::encode(remote_peer_id)
        );

        // Our bitfield must be the first message after the handshake
        let announce = PeerMessage::Bitfield(BitfieldMessage {
            bitfield: self.conn.local_bitfield.read().await.to_bytes(),
        });
        if let Err(e) = writer.write_message(&announce).await {
            self.shutdown
                .trigger(ExitReason::Io(format!("bitfield announce: {}", e)))
                .await;
            close_writer(&addr, writer).await;
            return;
        }

        let reader_task = tokio::spawn(run_reader(
            addr.clone(),
            reader,
            dispatcher,
            self.shutdown.clone(),
        ));

        let interval = self.conn.config.keep_alive_interval;
        let keep_alive = sleep(interval);
        tokio::pin!(keep_alive);

        let exit = loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break None,

                msg = writer_rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = writer.write_message(&msg).await {
                            break Some(ExitReason::Io(format!("write: {}", e)));
                        }
                        keep_alive.as_mut().reset(Instant::now() + interval);
                    }
                    // The queue only stops on shutdown
                    None => break Some(ExitReason::Cancelled),
                },

                _ = &mut keep_alive => {
                    debug!("Peer {} idle for {:?}, sending keep-alive", addr, interval);
                    if let Err(e) = writer.write_message(&PeerMessage::KeepAlive).await {
                        break Some(ExitReason::Io(format!("keep-alive: {}", e)));
                    }
                    keep_alive.as_mut().reset(Instant::now() + interval);
                }
            }
        };

        if let Some(reason) = exit {
            self.shutdown.trigger(reason).await;
        }

        close_writer(&addr, writer).await;

        if let Err(e) = reader_task.await {
            warn!("Peer {} reader task failed: {}", addr, e);
        }
        debug!("Peer {} writer stopped", addr);
    }

    /// Dials and handshakes, or adopts an already established transport.
    async fn establish(&self, transport: Option<Transport>) -> Result<Transport, ExitReason> {
        let conn = &self.conn;

        let local_len = conn.local_bitfield.read().await.len();
        if local_len != conn.num_pieces {
            return Err(ExitReason::Connect(format!(
                "local bitfield covers {} pieces, swarm has {}",
                local_len, conn.num_pieces
            )));
        }

        if let Some(transport) = transport {
            return Ok(transport);
        }

        let mut stream = timeout(
            conn.config.connect_timeout,
            conn.tcp_connector.connect(&conn.addr),
        )
        .await
        .map_err(|_| ExitReason::Connect(PeerError::Timeout("connect").to_string()))?
        .map_err(|e| ExitReason::Connect(e.to_string()))?;

        debug!("Peer {} dialed, starting handshake", conn.addr);

        let remote_peer_id = timeout(
            conn.config.io_timeout,
            handshake::exchange(
                &mut stream,
                conn.identity.info_hash,
                conn.identity.local_peer_id,
            ),
        )
        .await
        .map_err(|_| ExitReason::Handshake(PeerError::Timeout("handshake").to_string()))?
        .map_err(|e| ExitReason::Handshake(e.to_string()))?;

        let (reader, writer) = crate::io::split(stream, &conn.config);
        Ok((remote_peer_id, Box::new(reader), Box::new(writer)))
    }
}

async fn run_reader(
    addr: PeerAddr,
    mut reader: Box<dyn MessageReader>,
    mut dispatcher: Dispatcher,
    shutdown: Arc<Shutdown>,
) {
    let token = shutdown.token();

    loop {
        let next = tokio::select! {
            biased;

            _ = token.cancelled() => break,
            next = reader.read_message() => next,
        };

        match next {
            Ok(Some(PeerMessage::KeepAlive)) => dispatcher.record_keep_alive(),
            Ok(Some(msg)) => {
                let result = tokio::select! {
                    biased;

                    _ = token.cancelled() => break,
                    result = dispatcher.dispatch(msg) => result,
                };

                if let Err(e) = result {
                    shutdown.trigger(ExitReason::Protocol(e.to_string())).await;
                    break;
                }
            }
            Ok(None) => {
                shutdown.trigger(ExitReason::StreamClosed).await;
                break;
            }
            Err(e) => {
                shutdown.trigger(read_failure(e)).await;
                break;
            }
        }
    }

    debug!("Peer {} reader stopped", addr);
}

/// Transport failures are I/O errors; anything the decoder rejected is the
/// remote breaking the protocol.
fn read_failure(e: anyhow::Error) -> ExitReason {
    let is_io = e.downcast_ref::<std::io::Error>().is_some()
        || matches!(e.downcast_ref::<PeerError>(), Some(PeerError::Timeout(_)));

    if is_io && e.downcast_ref::<CodecError>().is_none() {
        ExitReason::Io(format!("read: {}", e))
    } else {
        ExitReason::Protocol(format!("decode: {}", e))
    }
}

async fn close_writer(addr: &str, mut writer: Box<dyn MessageWriter>) {
    if let Err(e) = writer.close().await {
        debug!("Peer {} close failed: {}", addr, e);
    }
}

/// Owner-side view of a running connection.
#[derive(Debug)]
pub struct PeerHandle {
    addr: PeerAddr,
    shutdown: Arc<Shutdown>,
    status_rx: watch::Receiver<PeerStatus>,
    writer_task: JoinHandle<()>,
    queue_task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn status(&self) -> PeerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.status_rx.clone()
    }

    /// When the remote last sent a keep-alive; the owner decides whether the
    /// peer has gone quiet for too long.
    pub fn last_keep_alive_at(&self) -> Option<std::time::Instant> {
        self.status_rx.borrow().last_keep_alive_at
    }

    /// Tears the connection down. Safe to call any number of times and
    /// after the connection has already failed.
    pub async fn shutdown(&self) {
        self.shutdown.trigger(ExitReason::Cancelled).await;
    }

    pub fn is_closed(&self) -> bool {
        self.writer_task.is_finished() && self.queue_task.is_finished()
    }

    /// Waits until every task of the connection has stopped.
    pub async fn closed(self) {
        if let Err(e) = self.writer_task.await {
            warn!("Peer {} writer task failed: {}", self.addr, e);
        }
        if let Err(e) = self.queue_task.await {
            warn!("Peer {} write queue task failed: {}", self.addr, e);
        }
    }
}
