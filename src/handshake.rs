use log::debug;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PeerError, Result};
use crate::peer::{InfoHash, PeerId};

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Opening exchange of a connection. Not framed like the other messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PROTOCOL.len() as u8;
        bytes[1..20].copy_from_slice(PROTOCOL);
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(PeerError::handshake_failed(format!(
                "expected {} bytes, got {}",
                HANDSHAKE_LEN,
                bytes.len()
            ))
            .into());
        }

        if bytes[0] as usize != PROTOCOL.len() || &bytes[1..20] != PROTOCOL {
            return Err(PeerError::handshake_failed("unsupported protocol string").into());
        }

        Ok(Self {
            reserved: bytes[20..28].try_into()?,
            info_hash: bytes[28..48].try_into()?,
            peer_id: bytes[48..68].try_into()?,
        })
    }
}

impl Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Handshake {{ info_hash: {:?}, peer_id: {:?} }}",
            hex::encode(self.info_hash),
            hex::encode(self.peer_id)
        )
    }
}

/// Sends our handshake, reads the remote one and checks that it belongs to
/// the same swarm. Returns the remote peer id.
pub async fn exchange<S>(stream: &mut S, info_hash: InfoHash, peer_id: PeerId) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, peer_id);
    stream.write_all(&ours.to_bytes()).await?;
    stream.flush().await?;

    let mut buffer = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buffer).await?;

    let theirs = Handshake::from_bytes(&buffer)?;
    debug!("Received handshake {:?}", theirs);

    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch.into());
    }

    Ok(theirs.peer_id)
}
