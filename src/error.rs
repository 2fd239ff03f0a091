use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Incomplete message: need {needed} bytes, got {available}")]
    IncompleteMessage { needed: usize, available: usize },

    #[error("Message too short: {0} bytes")]
    MessageTooShort(usize),

    #[error("Frame of {length} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Invalid bitfield: expected {expected} bytes for {num_pieces} pieces, got {actual}")]
    InvalidBitfield {
        expected: usize,
        actual: usize,
        num_pieces: usize,
    },

    #[error("Invalid bitfield: spare bits past piece {num_pieces} are set")]
    InvalidBitfieldSpareBits { num_pieces: usize },

    #[error("Piece index {index} out of range for {num_pieces} pieces")]
    PieceIndexOutOfRange { index: usize, num_pieces: usize },

    #[error("Unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake info hash does not match the swarm")]
    InfoHashMismatch,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Scheduler did not accept a delivered block in time")]
    SchedulerStalled,
}

pub type Result<T> = anyhow::Result<T>;

impl PeerError {
    pub fn handshake_failed(msg: impl Into<String>) -> Self {
        PeerError::HandshakeFailed(msg.into())
    }
}
