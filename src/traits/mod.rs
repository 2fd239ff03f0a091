use crate::messages::PeerMessage;
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Abstraction for TCP connection establishment.
/// Allows testing the connect path without actual network I/O.
#[async_trait]
pub trait TcpConnector: Send + Sync + std::fmt::Debug {
    /// Resolve `addr` and dial it.
    async fn connect(&self, addr: &str) -> Result<TcpStream>;
}

/// Inbound half of an established peer connection.
#[async_trait]
pub trait MessageReader: Send + std::fmt::Debug {
    /// Read the next peer protocol message from the stream.
    /// Returns None if the stream has ended gracefully.
    async fn read_message(&mut self) -> Result<Option<PeerMessage>>;
}

/// Outbound half of an established peer connection. Owning this half means
/// owning the socket close.
#[async_trait]
pub trait MessageWriter: Send + std::fmt::Debug {
    /// Write a peer protocol message to the stream.
    async fn write_message(&mut self, msg: &PeerMessage) -> Result<()>;

    /// Flush and shut the connection down.
    async fn close(&mut self) -> Result<()>;
}
