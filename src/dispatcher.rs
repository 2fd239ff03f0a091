use anyhow::Result;
use log::{debug, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};

use crate::bitfield::{Bitfield, SharedBitfield};
use crate::error::PeerError;
use crate::messages::{
    CancelMessage, InterestedMessage, NotInterestedMessage, PeerMessage, PieceMessage,
};
use crate::peer::{PeerAddr, PeerId};
use crate::types::{BlockDelivery, PeerStatus, PieceRequest, SwarmChannels};

/// Protocol state of one connection. Owned by the reader task; nothing else
/// mutates it.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub remote_bitfield: Bitfield,
    pub last_keep_alive_at: Option<Instant>,
}

impl PeerState {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_bitfield: Bitfield::new(num_pieces),
            last_keep_alive_at: None,
        }
    }
}

/// Applies inbound messages to `PeerState` and turns state changes into
/// outbound protocol messages and scheduler requests.
#[derive(Debug)]
pub struct Dispatcher {
    addr: PeerAddr,
    num_pieces: usize,
    remote_peer_id: Option<PeerId>,
    state: PeerState,
    local_bitfield: SharedBitfield,

    // Into the write queue
    outbound_tx: mpsc::Sender<PeerMessage>,
    cancel_tx: mpsc::Sender<CancelMessage>,

    // Into the scheduler
    request_tx: mpsc::Sender<PieceRequest>,
    delivery_tx: mpsc::Sender<BlockDelivery>,
    hand_off_timeout: Duration,

    status_tx: watch::Sender<PeerStatus>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: PeerAddr,
        num_pieces: usize,
        local_bitfield: SharedBitfield,
        outbound_tx: mpsc::Sender<PeerMessage>,
        cancel_tx: mpsc::Sender<CancelMessage>,
        channels: &SwarmChannels,
        hand_off_timeout: Duration,
        status_tx: watch::Sender<PeerStatus>,
    ) -> Self {
        Self {
            addr,
            num_pieces,
            remote_peer_id: None,
            state: PeerState::new(num_pieces),
            local_bitfield,
            outbound_tx,
            cancel_tx,
            request_tx: channels.request_tx.clone(),
            delivery_tx: channels.delivery_tx.clone(),
            hand_off_timeout,
            status_tx,
        }
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn set_remote_peer_id(&mut self, peer_id: PeerId) {
        self.remote_peer_id = Some(peer_id);
        self.publish_status();
    }

    /// A zero-length frame: only the liveness timestamp moves.
    pub fn record_keep_alive(&mut self) {
        debug!("Peer {} sent keep-alive", self.addr);
        self.state.last_keep_alive_at = Some(Instant::now());
        self.publish_status();
    }

    /// Applies one inbound message. An error is fatal for the connection and
    /// leaves the state as it was before the offending message.
    pub async fn dispatch(&mut self, msg: PeerMessage) -> Result<()> {
        let result = self.apply(msg).await;
        self.publish_status();
        result
    }

    async fn apply(&mut self, msg: PeerMessage) -> Result<()> {
        match msg {
            PeerMessage::KeepAlive => {
                self.record_keep_alive();
            }

            PeerMessage::Choke(_) => {
                debug!("Peer {} choked us", self.addr);
                self.state.peer_choking = true;
            }

            PeerMessage::Unchoke(_) => {
                debug!("Peer {} unchoked us", self.addr);
                self.state.peer_choking = false;
                self.check_interested().await?;
                self.try_request_piece().await?;
            }

            PeerMessage::Interested(_) => {
                debug!("Peer {} is interested", self.addr);
                self.state.peer_interested = true;
            }

            PeerMessage::NotInterested(_) => {
                debug!("Peer {} is not interested", self.addr);
                self.state.peer_interested = false;
            }

            PeerMessage::Have(have) => {
                debug!("Peer {} has piece {}", self.addr, have.piece_index);
                self.state.remote_bitfield.set(have.piece_index as usize)?;
                self.check_interested().await?;
                self.try_request_piece().await?;
            }

            PeerMessage::Bitfield(bitfield) => {
                let remote = Bitfield::from_bytes(self.num_pieces, &bitfield.bitfield)?;
                debug!(
                    "Peer {} announced {}/{} pieces",
                    self.addr,
                    remote.count(),
                    self.num_pieces
                );
                self.state.remote_bitfield = remote;
                self.check_interested().await?;
                // A fresh bitfield can make a request possible just like a have
                self.try_request_piece().await?;
            }

            PeerMessage::Request(request) => {
                // Uploading is not supported; requests are acknowledged and dropped.
                debug!(
                    "Peer {} requested piece {} begin {} length {} (ignored - upload not supported)",
                    self.addr, request.piece_index, request.begin, request.length
                );
            }

            PeerMessage::Piece(piece) => {
                debug!(
                    "Peer {} delivered piece {} begin {} ({} bytes)",
                    self.addr,
                    piece.piece_index,
                    piece.begin,
                    piece.block.len()
                );
                self.deliver_block(piece).await?;
                self.check_interested().await?;
                self.try_request_piece().await?;
            }

            PeerMessage::Cancel(cancel) => {
                debug!(
                    "Peer {} cancelled piece {} begin {}",
                    self.addr, cancel.piece_index, cancel.begin
                );
                self.cancel_tx
                    .send(cancel)
                    .await
                    .map_err(|_| PeerError::ChannelClosed("write queue cancel"))?;
            }

            PeerMessage::Port(port) => {
                debug!(
                    "Peer {} advertised DHT port {} (ignored)",
                    self.addr, port.port
                );
            }

            PeerMessage::Unknown(unknown) => {
                return Err(PeerError::UnknownMessageId(unknown.id).into());
            }
        }

        Ok(())
    }

    /// Edge-triggered: emits `interested`/`not interested` only when the
    /// computed interest differs from what we last announced.
    pub async fn check_interested(&mut self) -> Result<()> {
        let interesting = self
            .local_bitfield
            .read()
            .await
            .has_more_pieces(&self.state.remote_bitfield);

        if interesting == self.state.am_interested {
            return Ok(());
        }

        self.state.am_interested = interesting;
        let msg = if interesting {
            debug!("Peer {} marked as interesting", self.addr);
            PeerMessage::Interested(InterestedMessage {})
        } else {
            debug!("Peer {} marked as uninteresting", self.addr);
            PeerMessage::NotInterested(NotInterestedMessage {})
        };

        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| PeerError::ChannelClosed("write queue"))?;
        Ok(())
    }

    /// Asks the scheduler for a block when we want something and may ask.
    /// Nothing limits the number of requests in flight; every trigger point
    /// that satisfies the condition submits another one.
    pub async fn try_request_piece(&mut self) -> Result<()> {
        if !self.state.am_interested || self.state.peer_choking {
            return Ok(());
        }
        if self.local_bitfield.read().await.completed() {
            return Ok(());
        }

        let request = PieceRequest {
            bitfield: self.state.remote_bitfield.clone(),
            response: self.outbound_tx.clone(),
            addr: self.addr.clone(),
        };

        match self
            .request_tx
            .send_timeout(request, self.hand_off_timeout)
            .await
        {
            Ok(()) => {
                debug!("Peer {} asked the scheduler for a block", self.addr);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    "Peer {} dropped a piece request: scheduler busy for {:?}",
                    self.addr, self.hand_off_timeout
                );
                Ok(())
            }
            Err(SendTimeoutError::Closed(_)) => {
                Err(PeerError::ChannelClosed("scheduler requests").into())
            }
        }
    }

    async fn deliver_block(&mut self, piece: PieceMessage) -> Result<()> {
        let delivery = BlockDelivery::Block {
            addr: self.addr.clone(),
            piece,
        };

        match self
            .delivery_tx
            .send_timeout(delivery, self.hand_off_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(PeerError::SchedulerStalled.into()),
            Err(SendTimeoutError::Closed(_)) => {
                Err(PeerError::ChannelClosed("scheduler deliveries").into())
            }
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(PeerStatus {
            remote_peer_id: self.remote_peer_id,
            am_choking: self.state.am_choking,
            am_interested: self.state.am_interested,
            peer_choking: self.state.peer_choking,
            peer_interested: self.state.peer_interested,
            remote_pieces: self.state.remote_bitfield.count(),
            last_keep_alive_at: self.state.last_keep_alive_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        BitfieldMessage, ChokeMessage, HaveMessage, InterestedMessage, PortMessage,
        RequestMessage, UnchokeMessage, UnknownMessage,
    };
    use crate::types::PeerExit;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    const ADDR: &str = "192.168.1.7:6881";

    struct Harness {
        dispatcher: Dispatcher,
        outbound_rx: mpsc::Receiver<PeerMessage>,
        cancel_rx: mpsc::Receiver<CancelMessage>,
        request_rx: mpsc::Receiver<PieceRequest>,
        delivery_rx: mpsc::Receiver<BlockDelivery>,
        status_rx: watch::Receiver<PeerStatus>,
        local: SharedBitfield,
        _exit_rx: mpsc::Receiver<PeerExit>,
    }

    fn harness(local: Bitfield) -> Harness {
        let num_pieces = local.len();
        let local = Arc::new(RwLock::new(local));
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = mpsc::channel(16);
        let (request_tx, request_rx) = mpsc::channel(16);
        let (delivery_tx, delivery_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(PeerStatus::default());

        let channels = SwarmChannels {
            exit_tx,
            request_tx,
            delivery_tx,
        };

        let dispatcher = Dispatcher::new(
            ADDR.to_string(),
            num_pieces,
            local.clone(),
            outbound_tx,
            cancel_tx,
            &channels,
            Duration::from_millis(50),
            status_tx,
        );

        Harness {
            dispatcher,
            outbound_rx,
            cancel_rx,
            request_rx,
            delivery_rx,
            status_rx,
            local,
            _exit_rx: exit_rx,
        }
    }

    fn bits(num_pieces: usize, bytes: &[u8]) -> Bitfield {
        Bitfield::from_bytes(num_pieces, bytes).unwrap()
    }

    fn bitfield_msg(bytes: &[u8]) -> PeerMessage {
        PeerMessage::Bitfield(BitfieldMessage {
            bitfield: bytes.to_vec(),
        })
    }

    fn have(piece_index: u32) -> PeerMessage {
        PeerMessage::Have(HaveMessage { piece_index })
    }

    fn unchoke() -> PeerMessage {
        PeerMessage::Unchoke(UnchokeMessage {})
    }

    #[tokio::test]
    async fn test_initial_state() {
        let h = harness(Bitfield::new(4));
        let state = h.dispatcher.state();

        assert!(state.am_choking);
        assert!(!state.am_interested);
        assert!(state.peer_choking);
        assert!(!state.peer_interested);
        assert_eq!(state.remote_bitfield.count(), 0);
        assert_eq!(state.remote_bitfield.len(), 4);
    }

    #[tokio::test]
    async fn test_complete_local_ignores_empty_remote() {
        let mut h = harness(Bitfield::full(4));

        h.dispatcher.dispatch(bitfield_msg(&[0b0000_0000])).await.unwrap();

        assert!(!h.dispatcher.state().am_interested);
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_have_flips_interest_once() {
        let mut h = harness(bits(4, &[0b1000_0000]));

        h.dispatcher.dispatch(have(2)).await.unwrap();

        assert!(h.dispatcher.state().remote_bitfield.has(2));
        assert!(h.dispatcher.state().am_interested);
        assert_eq!(
            h.outbound_rx.try_recv().unwrap(),
            PeerMessage::Interested(InterestedMessage {})
        );
        assert!(h.outbound_rx.try_recv().is_err());

        // Still interested: no repeated announcement
        h.dispatcher.dispatch(have(3)).await.unwrap();
        h.dispatcher.check_interested().await.unwrap();
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_interest_drops_when_local_catches_up() {
        let mut h = harness(bits(4, &[0b1000_0000]));

        h.dispatcher.dispatch(have(1)).await.unwrap();
        assert_eq!(
            h.outbound_rx.try_recv().unwrap(),
            PeerMessage::Interested(InterestedMessage {})
        );

        h.local.write().await.set(1).unwrap();
        h.dispatcher.check_interested().await.unwrap();

        assert!(!h.dispatcher.state().am_interested);
        assert_eq!(
            h.outbound_rx.try_recv().unwrap(),
            PeerMessage::NotInterested(NotInterestedMessage {})
        );

        h.dispatcher.check_interested().await.unwrap();
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unchoke_while_interested_requests_once() {
        let mut h = harness(bits(4, &[0b1000_0000]));

        // Choked: interest alone does not reach the scheduler
        h.dispatcher.dispatch(bitfield_msg(&[0b0110_0000])).await.unwrap();
        assert!(h.dispatcher.state().am_interested);
        assert!(h.request_rx.try_recv().is_err());

        h.dispatcher.dispatch(unchoke()).await.unwrap();

        assert!(!h.dispatcher.state().peer_choking);
        let request = h.request_rx.try_recv().unwrap();
        assert_eq!(request.addr, ADDR);
        assert_eq!(request.bitfield, bits(4, &[0b0110_0000]));
        assert!(h.request_rx.try_recv().is_err());

        // The response channel feeds our own write queue
        request
            .response
            .send(PeerMessage::Request(RequestMessage {
                piece_index: 1,
                begin: 0,
                length: 16384,
            }))
            .await
            .unwrap();
        let _interested = h.outbound_rx.try_recv().unwrap();
        assert!(matches!(
            h.outbound_rx.try_recv().unwrap(),
            PeerMessage::Request(_)
        ));
    }

    #[tokio::test]
    async fn test_have_while_unchoked_requests() {
        let mut h = harness(bits(4, &[0b1000_0000]));

        h.dispatcher.dispatch(unchoke()).await.unwrap();
        assert!(h.request_rx.try_recv().is_err());

        h.dispatcher.dispatch(have(3)).await.unwrap();

        assert!(h.dispatcher.state().am_interested);
        let request = h.request_rx.try_recv().unwrap();
        assert_eq!(request.addr, ADDR);
        assert!(request.bitfield.has(3));
        assert_eq!(request.bitfield.count(), 1);
        assert!(h.request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bitfield_while_unchoked_requests() {
        let mut h = harness(bits(4, &[0b1000_0000]));

        h.dispatcher.dispatch(unchoke()).await.unwrap();
        assert!(h.request_rx.try_recv().is_err());

        h.dispatcher.dispatch(bitfield_msg(&[0b0011_0000])).await.unwrap();

        assert_eq!(
            h.outbound_rx.try_recv().unwrap(),
            PeerMessage::Interested(InterestedMessage {})
        );
        let request = h.request_rx.try_recv().unwrap();
        assert_eq!(request.bitfield, bits(4, &[0b0011_0000]));
        assert!(h.request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_request_when_not_interested() {
        let mut h = harness(Bitfield::new(4));

        h.dispatcher.dispatch(unchoke()).await.unwrap();

        assert!(!h.dispatcher.state().peer_choking);
        assert!(h.request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_request_when_local_complete() {
        let mut h = harness(bits(4, &[0b1000_0000]));

        h.dispatcher.dispatch(have(1)).await.unwrap();
        *h.local.write().await = Bitfield::full(4);

        // Interest is stale until recomputed; completion alone blocks requests
        h.dispatcher.state.peer_choking = false;
        assert!(h.dispatcher.state().am_interested);
        h.dispatcher.try_request_piece().await.unwrap();
        assert!(h.request_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wrong_bitfield_length_is_rejected() {
        let mut h = harness(Bitfield::new(8));
        h.dispatcher.dispatch(have(5)).await.unwrap();
        let before = h.dispatcher.state().remote_bitfield.clone();

        let err = h
            .dispatcher
            .dispatch(bitfield_msg(&[0xff, 0xff]))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PeerError>(),
            Some(PeerError::InvalidBitfield { .. })
        ));
        assert_eq!(h.dispatcher.state().remote_bitfield, before);
    }

    #[tokio::test]
    async fn test_unknown_message_id_fails_without_mutation() {
        let mut h = harness(Bitfield::new(4));

        let err = h
            .dispatcher
            .dispatch(PeerMessage::Unknown(UnknownMessage {
                id: 99,
                payload: vec![1, 2, 3],
            }))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PeerError>(),
            Some(PeerError::UnknownMessageId(99))
        ));
        assert_eq!(*h.status_rx.borrow(), PeerStatus::default());
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_have_out_of_range_is_rejected() {
        let mut h = harness(Bitfield::new(4));

        let err = h.dispatcher.dispatch(have(4)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PeerError>(),
            Some(PeerError::PieceIndexOutOfRange { .. })
        ));
        assert_eq!(h.dispatcher.state().remote_bitfield.count(), 0);
    }

    #[tokio::test]
    async fn test_keep_alive_only_touches_timestamp() {
        let mut h = harness(Bitfield::new(4));
        h.dispatcher.dispatch(bitfield_msg(&[0b1010_0000])).await.unwrap();
        let _ = h.outbound_rx.try_recv();
        let before = h.dispatcher.state().clone();

        h.dispatcher.record_keep_alive();

        let after = h.dispatcher.state();
        assert!(after.last_keep_alive_at.is_some());
        assert_eq!(after.am_choking, before.am_choking);
        assert_eq!(after.am_interested, before.am_interested);
        assert_eq!(after.peer_choking, before.peer_choking);
        assert_eq!(after.peer_interested, before.peer_interested);
        assert_eq!(after.remote_bitfield, before.remote_bitfield);
        assert!(h.outbound_rx.try_recv().is_err());
        assert!(h.status_rx.borrow().last_keep_alive_at.is_some());
    }

    #[tokio::test]
    async fn test_choke_and_interest_flags() {
        let mut h = harness(Bitfield::new(4));

        h.dispatcher.dispatch(unchoke()).await.unwrap();
        h.dispatcher
            .dispatch(PeerMessage::Interested(InterestedMessage {}))
            .await
            .unwrap();
        assert!(!h.dispatcher.state().peer_choking);
        assert!(h.dispatcher.state().peer_interested);

        h.dispatcher.dispatch(PeerMessage::Choke(ChokeMessage {})).await.unwrap();
        h.dispatcher
            .dispatch(PeerMessage::NotInterested(NotInterestedMessage {}))
            .await
            .unwrap();
        assert!(h.dispatcher.state().peer_choking);
        assert!(!h.dispatcher.state().peer_interested);

        let status = h.status_rx.borrow().clone();
        assert!(status.peer_choking);
        assert!(!status.peer_interested);
    }

    #[tokio::test]
    async fn test_piece_is_forwarded_and_triggers_next_request() {
        let mut h = harness(bits(4, &[0b1000_0000]));
        h.dispatcher.dispatch(bitfield_msg(&[0b1111_0000])).await.unwrap();
        h.dispatcher.dispatch(unchoke()).await.unwrap();
        let _first = h.request_rx.try_recv().unwrap();

        let piece = PieceMessage {
            piece_index: 2,
            begin: 0,
            block: vec![7u8; 32],
        };
        h.dispatcher
            .dispatch(PeerMessage::Piece(piece.clone()))
            .await
            .unwrap();

        assert_eq!(
            h.delivery_rx.try_recv().unwrap(),
            BlockDelivery::Block {
                addr: ADDR.to_string(),
                piece
            }
        );
        assert!(h.request_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_stalled_scheduler_fails_delivery() {
        let mut h = harness(Bitfield::new(4));
        for _ in 0..16 {
            h.dispatcher
                .delivery_tx
                .send(BlockDelivery::Disconnected {
                    addr: "filler".to_string(),
                })
                .await
                .unwrap();
        }

        let err = h
            .dispatcher
            .dispatch(PeerMessage::Piece(PieceMessage {
                piece_index: 0,
                begin: 0,
                block: vec![0u8; 4],
            }))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PeerError>(),
            Some(PeerError::SchedulerStalled)
        ));
        drop(h.delivery_rx);
    }

    #[tokio::test]
    async fn test_cancel_goes_to_write_queue() {
        let mut h = harness(Bitfield::new(4));
        let cancel = CancelMessage {
            piece_index: 1,
            begin: 0,
            length: 16384,
        };

        h.dispatcher
            .dispatch(PeerMessage::Cancel(cancel.clone()))
            .await
            .unwrap();

        assert_eq!(h.cancel_rx.try_recv().unwrap(), cancel);
    }

    #[tokio::test]
    async fn test_request_and_port_are_ignored() {
        let mut h = harness(Bitfield::new(4));

        h.dispatcher
            .dispatch(PeerMessage::Request(RequestMessage {
                piece_index: 0,
                begin: 0,
                length: 16384,
            }))
            .await
            .unwrap();
        h.dispatcher
            .dispatch(PeerMessage::Port(PortMessage { port: 6881 }))
            .await
            .unwrap();

        assert!(h.outbound_rx.try_recv().is_err());
        assert!(h.request_rx.try_recv().is_err());
        assert!(h.delivery_rx.try_recv().is_err());
        assert_eq!(*h.status_rx.borrow(), PeerStatus::default());
    }
}
