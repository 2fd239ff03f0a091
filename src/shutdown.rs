use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::peer::PeerAddr;
use crate::types::{BlockDelivery, ExitReason, PeerExit};

/// One-shot teardown for a connection. Every exit path of the reader, the
/// writer and the owner goes through `trigger`; only the first call acts.
///
/// The first trigger cancels the token (unblocking both tasks and the write
/// queue), tells the scheduler to reassign this peer's blocks if the
/// handshake had completed, and reports the exit upward. The socket itself is
/// closed by the writer task, the only owner of the write half, once it
/// observes the cancellation.
#[derive(Debug)]
pub struct Shutdown {
    addr: PeerAddr,
    fired: AtomicBool,
    established: AtomicBool,
    token: CancellationToken,
    exit_tx: mpsc::Sender<PeerExit>,
    delivery_tx: mpsc::Sender<BlockDelivery>,
    hand_off_timeout: Duration,
}

impl Shutdown {
    pub fn new(
        addr: PeerAddr,
        exit_tx: mpsc::Sender<PeerExit>,
        delivery_tx: mpsc::Sender<BlockDelivery>,
        hand_off_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            fired: AtomicBool::new(false),
            established: AtomicBool::new(false),
            token: CancellationToken::new(),
            exit_tx,
            delivery_tx,
            hand_off_timeout,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Marks the handshake as done; from here on the scheduler may hold
    /// state for this address.
    pub fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    /// Returns true for the call that actually tore the connection down.
    pub async fn trigger(&self, reason: ExitReason) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!(
                "Peer {} shutdown already in progress, ignoring {}",
                self.addr, reason
            );
            return false;
        }

        match reason {
            ExitReason::Cancelled => info!("Peer {} shutting down: {}", self.addr, reason),
            _ => warn!("Peer {} shutting down: {}", self.addr, reason),
        }

        self.token.cancel();

        if self.established.load(Ordering::Acquire) {
            let marker = BlockDelivery::Disconnected {
                addr: self.addr.clone(),
            };
            if let Err(e) = self
                .delivery_tx
                .send_timeout(marker, self.hand_off_timeout)
                .await
            {
                warn!(
                    "Peer {} could not notify the scheduler of its disconnect: {}",
                    self.addr, e
                );
            }
        }

        let exit = PeerExit {
            addr: self.addr.clone(),
            reason,
        };
        if self.exit_tx.send(exit).await.is_err() {
            debug!("Peer {} exit receiver already gone", self.addr);
        }

        true
    }
}
