use anyhow::{Result, anyhow};
use clap::Parser;
use std::time::Duration;

use swarm_peer::config::PeerConfig;
use swarm_peer::peer::{InfoHash, PeerId, SwarmIdentity};

const PEER_ID_PREFIX: &[u8; 8] = b"-SP0100-";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Connects to a single swarm peer and logs the wire conversation"
)]
pub struct Args {
    /// Remote peer as host:port
    #[arg(short = 'p', long = "peer")]
    pub peer: String,

    /// Info hash of the swarm, 40 hex characters
    #[arg(short = 'i', long = "info-hash")]
    pub info_hash: String,

    /// Number of pieces in the torrent
    #[arg(short = 'n', long = "pieces")]
    pub pieces: usize,

    /// Our 20-byte peer id (generated when omitted)
    #[arg(long = "peer-id", allow_hyphen_values = true)]
    pub peer_id: Option<String>,

    /// Announce every piece as already downloaded
    #[arg(long = "seed", default_value_t = false)]
    pub seed: bool,

    /// Block length requested for each piece
    #[arg(long = "block-size", default_value_t = 16384)]
    pub block_size: u32,

    /// Dial timeout in seconds
    #[arg(long = "connect-timeout", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Handshake and write timeout in seconds
    #[arg(long = "io-timeout", default_value_t = 30)]
    pub io_timeout: u64,

    /// Read timeout in seconds; reads are unbounded when omitted
    #[arg(long = "read-timeout")]
    pub read_timeout: Option<u64>,

    /// Idle seconds before we send a keep-alive
    #[arg(long = "keep-alive", default_value_t = 120)]
    pub keep_alive: u64,

    /// Disconnect after this many seconds
    #[arg(short = 'd', long = "duration")]
    pub duration: Option<u64>,
}

impl Args {
    pub fn identity(&self) -> Result<SwarmIdentity> {
        let info_hash: InfoHash = hex::decode(&self.info_hash)
            .map_err(|e| anyhow!("invalid info hash {}: {}", self.info_hash, e))?
            .try_into()
            .map_err(|bytes: Vec<u8>| {
                anyhow!("info hash must be 20 bytes, got {}", bytes.len())
            })?;

        let peer_id = match &self.peer_id {
            Some(id) => parse_peer_id(id)?,
            None => generate_peer_id(),
        };

        Ok(SwarmIdentity::new(info_hash, peer_id))
    }

    pub fn config(&self) -> PeerConfig {
        PeerConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            io_timeout: Duration::from_secs(self.io_timeout),
            read_timeout: self.read_timeout.map(Duration::from_secs),
            keep_alive_interval: Duration::from_secs(self.keep_alive),
            ..PeerConfig::default()
        }
    }
}

fn parse_peer_id(id: &str) -> Result<PeerId> {
    let bytes = id.as_bytes();
    if bytes.len() != 20 {
        return Err(anyhow!("peer id must be 20 bytes, got {}", bytes.len()));
    }

    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(bytes);
    Ok(peer_id)
}

fn generate_peer_id() -> PeerId {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    for byte in &mut peer_id[8..] {
        *byte = b'0' + rand::random::<u8>() % 10;
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "swarm-peer",
            "--peer",
            "127.0.0.1:6881",
            "--info-hash",
            "0123456789abcdef0123456789abcdef01234567",
            "--pieces",
            "12",
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_map_to_config() {
        let config = args(&[]).config();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.io_timeout, Duration::from_secs(30));
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_identity_from_flags() {
        let identity = args(&["--peer-id", "-XX0001-abcdefghijkl"])
            .identity()
            .unwrap();
        assert_eq!(identity.info_hash[0], 0x01);
        assert_eq!(identity.info_hash[19], 0x67);
        assert_eq!(&identity.local_peer_id, b"-XX0001-abcdefghijkl");
    }

    #[test]
    fn test_generated_peer_id_has_prefix() {
        let identity = args(&[]).identity().unwrap();
        assert_eq!(&identity.local_peer_id[..8], PEER_ID_PREFIX);
    }

    #[test]
    fn test_rejects_short_info_hash() {
        let mut bad = args(&[]);
        bad.info_hash = "abcd".to_string();
        assert!(bad.identity().is_err());
    }
}
