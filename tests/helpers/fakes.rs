use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use swarm_peer::messages::PeerMessage;
use swarm_peer::traits::{MessageReader, MessageWriter, TcpConnector};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Reading half of an in-memory wire. Ends (Ok(None)) once the remote side
/// hangs up.
#[derive(Debug)]
pub struct FakeReader {
    read_rx: mpsc::UnboundedReceiver<PeerMessage>,
}

#[async_trait]
impl MessageReader for FakeReader {
    async fn read_message(&mut self) -> Result<Option<PeerMessage>> {
        Ok(self.read_rx.recv().await)
    }
}

/// Writing half of an in-memory wire. Counts closes and can be told to fail.
#[derive(Debug)]
pub struct FakeWriter {
    write_tx: mpsc::UnboundedSender<PeerMessage>,
    closes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl MessageWriter for FakeWriter {
    async fn write_message(&mut self, msg: &PeerMessage) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("broken pipe"));
        }
        self.write_tx
            .send(msg.clone())
            .map_err(|_| anyhow!("Channel closed"))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The test's end of the wire: plays the remote peer.
#[derive(Debug)]
pub struct RemotePeer {
    to_local: Option<mpsc::UnboundedSender<PeerMessage>>,
    from_local: mpsc::UnboundedReceiver<PeerMessage>,
    closes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl RemotePeer {
    pub fn send(&self, msg: PeerMessage) {
        if let Some(tx) = &self.to_local {
            let _ = tx.send(msg);
        }
    }

    /// Next message the connection wrote, or None after a second of silence.
    pub async fn recv(&mut self) -> Option<PeerMessage> {
        tokio::time::timeout(Duration::from_secs(1), self.from_local.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next message that is not a keep-alive.
    pub async fn recv_non_keep_alive(&mut self) -> Option<PeerMessage> {
        loop {
            match self.recv().await? {
                PeerMessage::KeepAlive => continue,
                msg => return Some(msg),
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<PeerMessage> {
        self.from_local.try_recv().ok()
    }

    /// Hangs up: the connection's reader sees a clean end of stream.
    pub fn disconnect(&mut self) {
        self.to_local = None;
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub fn wire() -> (FakeReader, FakeWriter, RemotePeer) {
    let (to_local, read_rx) = mpsc::unbounded_channel();
    let (write_tx, from_local) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    let fail_writes = Arc::new(AtomicBool::new(false));

    (
        FakeReader { read_rx },
        FakeWriter {
            write_tx,
            closes: closes.clone(),
            fail_writes: fail_writes.clone(),
        },
        RemotePeer {
            to_local: Some(to_local),
            from_local,
            closes,
            fail_writes,
        },
    )
}

/// Connector whose dials always fail.
#[derive(Debug, Default)]
pub struct FailingConnector {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl TcpConnector for FailingConnector {
    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("connection refused by {}", addr))
    }
}
