pub mod bitfield;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod io;
pub mod messages;
pub mod peer;
pub mod peer_connection;
pub mod shutdown;
pub mod tcp_connector;
pub mod traits;
pub mod types;
pub mod write_queue;

pub use bitfield::{Bitfield, SharedBitfield};
pub use config::PeerConfig;
pub use peer::{InfoHash, PeerAddr, PeerId, SwarmIdentity};
pub use peer_connection::{PeerConnection, PeerHandle};
pub use types::{BlockDelivery, ExitReason, PeerExit, PeerStatus, PieceRequest, SwarmChannels};
