use std::net::IpAddr;

pub type PeerId = [u8; 20];
pub type InfoHash = [u8; 20];
pub type PeerAddr = String;

/// Swarm membership shared by every connection of one torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmIdentity {
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
}

impl SwarmIdentity {
    pub fn new(info_hash: InfoHash, local_peer_id: PeerId) -> Self {
        Self {
            info_hash,
            local_peer_id,
        }
    }
}

pub fn format_addr(ip: IpAddr, port: u16) -> PeerAddr {
    if ip.is_ipv6() {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}
