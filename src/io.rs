use crate::codec::{PeerMessageDecoder, PeerMessageEncoder};
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::messages::PeerMessage;
use crate::traits::{MessageReader, MessageWriter};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Splits an established (post-handshake) stream into framed halves.
pub fn split(stream: TcpStream, config: &PeerConfig) -> (TcpMessageReader, TcpMessageWriter) {
    let (reader, writer) = stream.into_split();
    (
        TcpMessageReader {
            reader: FramedRead::new(reader, PeerMessageDecoder::new(config.max_frame_length)),
            read_timeout: config.read_timeout,
        },
        TcpMessageWriter {
            writer: FramedWrite::new(writer, PeerMessageEncoder::new()),
            io_timeout: config.io_timeout,
        },
    )
}

pub struct TcpMessageReader {
    reader: FramedRead<OwnedReadHalf, PeerMessageDecoder>,
    read_timeout: Option<Duration>,
}

impl std::fmt::Debug for TcpMessageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageReader").finish()
    }
}

#[async_trait]
impl MessageReader for TcpMessageReader {
    async fn read_message(&mut self) -> Result<Option<PeerMessage>> {
        let next = match self.read_timeout {
            Some(limit) => timeout(limit, self.reader.next())
                .await
                .map_err(|_| PeerError::Timeout("read"))?,
            None => self.reader.next().await,
        };

        match next {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

pub struct TcpMessageWriter {
    writer: FramedWrite<OwnedWriteHalf, PeerMessageEncoder>,
    io_timeout: Duration,
}

impl std::fmt::Debug for TcpMessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageWriter").finish()
    }
}

#[async_trait]
impl MessageWriter for TcpMessageWriter {
    async fn write_message(&mut self, msg: &PeerMessage) -> Result<()> {
        timeout(self.io_timeout, self.writer.send(msg.clone()))
            .await
            .map_err(|_| PeerError::Timeout("write"))??;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        timeout(self.io_timeout, SinkExt::<PeerMessage>::close(&mut self.writer))
            .await
            .map_err(|_| PeerError::Timeout("close"))??;
        Ok(())
    }
}
