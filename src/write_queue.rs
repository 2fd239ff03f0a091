use log::debug;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::messages::{CancelMessage, PeerMessage};
use crate::peer::PeerAddr;

/// Buffers outbound messages between the dispatcher (and scheduler responses)
/// and the writer task. Messages leave in arrival order; a queued `piece`
/// can be retracted by a `cancel` until it is handed to the writer.
#[derive(Debug)]
pub struct WriteQueue {
    addr: PeerAddr,
    pending: VecDeque<PeerMessage>,
    incoming_rx: mpsc::Receiver<PeerMessage>,
    cancel_rx: mpsc::Receiver<CancelMessage>,
    out_tx: mpsc::Sender<PeerMessage>,
    shutdown: CancellationToken,
}

impl WriteQueue {
    pub fn new(
        addr: PeerAddr,
        incoming_rx: mpsc::Receiver<PeerMessage>,
        cancel_rx: mpsc::Receiver<CancelMessage>,
        out_tx: mpsc::Sender<PeerMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            addr,
            pending: VecDeque::new(),
            incoming_rx,
            cancel_rx,
            out_tx,
            shutdown,
        }
    }

    /// Removes the queued `piece` named by `cancel`. Returns false when it was
    /// already handed over (or never queued).
    fn retract(&mut self, cancel: &CancelMessage) -> bool {
        let position = self.pending.iter().position(|msg| match msg {
            PeerMessage::Piece(piece) => piece.matches(cancel),
            _ => false,
        });

        match position {
            Some(index) => {
                self.pending.remove(index);
                debug!(
                    "Peer {} retracted queued piece {} begin {}",
                    self.addr, cancel.piece_index, cancel.begin
                );
                true
            }
            None => false,
        }
    }

    /// Moves everything already sitting in the incoming channel into
    /// `pending`. Returns false once every sender is gone.
    fn absorb_incoming(&mut self) -> bool {
        loop {
            match self.incoming_rx.try_recv() {
                Ok(msg) => self.pending.push_back(msg),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    pub async fn run(mut self) {
        let mut incoming_open = true;
        let out_tx = self.out_tx.clone();

        loop {
            if !incoming_open && self.pending.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(cancel) = self.cancel_rx.recv() => {
                    // The piece may still be in the channel rather than in pending
                    if incoming_open {
                        incoming_open = self.absorb_incoming();
                    }
                    self.retract(&cancel);
                }

                msg = self.incoming_rx.recv(), if incoming_open => match msg {
                    Some(msg) => self.pending.push_back(msg),
                    None => incoming_open = false,
                },

                permit = out_tx.reserve(), if !self.pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(msg) = self.pending.pop_front() {
                            permit.send(msg);
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        // Releases any scheduler still blocked on a response send.
        self.incoming_rx.close();
        debug!(
            "Peer {} write queue stopped with {} pending messages",
            self.addr,
            self.pending.len()
        );
    }
}
