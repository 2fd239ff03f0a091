use anyhow::anyhow;
use byteorder::{BigEndian, ReadBytesExt};
use std::fmt::Debug;
use std::io::Cursor;

use crate::error::{CodecError, Result};

pub const CHOKE: u8 = 0;
pub const UNCHOKE: u8 = 1;
pub const INTERESTED: u8 = 2;
pub const NOT_INTERESTED: u8 = 3;
pub const HAVE: u8 = 4;
pub const BITFIELD: u8 = 5;
pub const REQUEST: u8 = 6;
pub const PIECE: u8 = 7;
pub const CANCEL: u8 = 8;
pub const PORT: u8 = 9;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    KeepAlive,
    Choke(ChokeMessage),
    Unchoke(UnchokeMessage),
    Interested(InterestedMessage),
    NotInterested(NotInterestedMessage),
    Have(HaveMessage),
    Bitfield(BitfieldMessage),
    Request(RequestMessage),
    Piece(PieceMessage),
    Cancel(CancelMessage),
    Port(PortMessage),
    // Framed correctly but carrying an id outside the protocol. Decoding keeps
    // it so the dispatcher can reject it as a protocol violation.
    Unknown(UnknownMessage),
}

impl PeerMessage {
    /// Decodes one frame from the start of `src`, returning the number of
    /// bytes it occupied.
    pub fn from_bytes(src: &[u8]) -> Result<(usize, Self)> {
        if src.len() < 4 {
            return Err(CodecError::MessageTooShort(src.len()).into());
        }

        let length = Self::get_length(src)?;

        if length == 0 {
            return Ok((4, Self::KeepAlive));
        }

        let total_size = 4 + length;
        if src.len() < total_size {
            return Err(CodecError::IncompleteMessage {
                needed: total_size,
                available: src.len(),
            }
            .into());
        }

        let frame = &src[..total_size];
        let message = match frame[4] {
            CHOKE => {
                expect_frame_len(frame, 5, "choke")?;
                Self::Choke(ChokeMessage {})
            }
            UNCHOKE => {
                expect_frame_len(frame, 5, "unchoke")?;
                Self::Unchoke(UnchokeMessage {})
            }
            INTERESTED => {
                expect_frame_len(frame, 5, "interested")?;
                Self::Interested(InterestedMessage {})
            }
            NOT_INTERESTED => {
                expect_frame_len(frame, 5, "not interested")?;
                Self::NotInterested(NotInterestedMessage {})
            }
            HAVE => Self::Have(HaveMessage::from_bytes(frame)?),
            BITFIELD => Self::Bitfield(BitfieldMessage::from_bytes(frame)?),
            REQUEST => Self::Request(RequestMessage::from_bytes(frame)?),
            PIECE => Self::Piece(PieceMessage::from_bytes(frame)?),
            CANCEL => Self::Cancel(CancelMessage::from_bytes(frame)?),
            PORT => Self::Port(PortMessage::from_bytes(frame)?),
            id => Self::Unknown(UnknownMessage {
                id,
                payload: frame[5..].to_vec(),
            }),
        };

        Ok((total_size, message))
    }

    fn get_length(bytes: &[u8]) -> Result<usize> {
        let length = &bytes[0..4];
        let length = u32::from_be_bytes(length.try_into()?);
        Ok(length as usize)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke(_) => id_only_frame(CHOKE).to_vec(),
            Self::Unchoke(_) => id_only_frame(UNCHOKE).to_vec(),
            Self::Interested(_) => id_only_frame(INTERESTED).to_vec(),
            Self::NotInterested(_) => id_only_frame(NOT_INTERESTED).to_vec(),
            Self::Have(message) => message.to_bytes().to_vec(),
            Self::Bitfield(message) => message.to_bytes(),
            Self::Request(message) => message.to_bytes().to_vec(),
            Self::Piece(message) => message.to_bytes(),
            Self::Cancel(message) => message.to_bytes().to_vec(),
            Self::Port(message) => message.to_bytes().to_vec(),
            Self::Unknown(message) => message.to_bytes(),
        }
    }
}

fn id_only_frame(id: u8) -> [u8; 5] {
    let mut bytes = [0u8; 5];
    bytes[0..4].copy_from_slice(&1u32.to_be_bytes());
    bytes[4] = id;
    bytes
}

fn expect_frame_len(frame: &[u8], expected: usize, name: &str) -> Result<()> {
    if frame.len() != expected {
        return Err(CodecError::InvalidFormat(format!(
            "{} message must be {} bytes, got {}",
            name,
            expected,
            frame.len()
        ))
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChokeMessage {}

#[derive(Debug, Clone, PartialEq)]
pub struct UnchokeMessage {}

#[derive(Debug, Clone, PartialEq)]
pub struct InterestedMessage {}

#[derive(Debug, Clone, PartialEq)]
pub struct NotInterestedMessage {}

#[derive(Debug, Clone, PartialEq)]
pub struct HaveMessage {
    pub piece_index: u32,
}

impl HaveMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_frame_len(bytes, 9, "have")?;
        let mut cursor = Cursor::new(&bytes[5..]);
        let piece_index = cursor.read_u32::<BigEndian>()?;

        Ok(HaveMessage { piece_index })
    }

    pub fn to_bytes(&self) -> [u8; 9] {
        let mut bytes = [0u8; 9];
        bytes[0..4].copy_from_slice(&5u32.to_be_bytes());
        bytes[4] = HAVE;
        bytes[5..9].copy_from_slice(&self.piece_index.to_be_bytes());
        bytes
    }
}

/// Packed availability bits. Length is validated against the swarm's piece
/// count by the receiver, not here.
#[derive(Clone, PartialEq)]
pub struct BitfieldMessage {
    pub bitfield: Vec<u8>,
}

impl BitfieldMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            bitfield: bytes[5..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let message_length = 1 + self.bitfield.len();
        let mut result = Vec::with_capacity(4 + message_length);
        result.extend_from_slice(&(message_length as u32).to_be_bytes());
        result.push(BITFIELD);
        result.extend_from_slice(&self.bitfield);
        result
    }
}

impl Debug for BitfieldMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BitfieldMessage {{ bytes: {} }}",
            self.bitfield.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl RequestMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_frame_len(bytes, 17, "request")?;
        let (piece_index, begin, length) = read_block_ref(&bytes[5..])?;

        Ok(Self {
            piece_index,
            begin,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; 17] {
        block_ref_frame(REQUEST, self.piece_index, self.begin, self.length)
    }
}

#[derive(Clone, PartialEq)]
pub struct PieceMessage {
    pub piece_index: u32,
    pub begin: u32,
    pub block: Vec<u8>,
}

impl PieceMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 13 {
            return Err(CodecError::InvalidFormat(format!(
                "piece message too short: {} bytes (need at least 13)",
                bytes.len()
            ))
            .into());
        }
        let mut cursor = Cursor::new(&bytes[5..13]);
        let piece_index = cursor.read_u32::<BigEndian>()?;
        let begin = cursor.read_u32::<BigEndian>()?;

        Ok(PieceMessage {
            piece_index,
            begin,
            block: bytes[13..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let message_length = 1 + 4 + 4 + self.block.len();
        let mut bytes = Vec::with_capacity(4 + message_length);
        bytes.extend_from_slice(&(message_length as u32).to_be_bytes());
        bytes.push(PIECE);
        bytes.extend_from_slice(&self.piece_index.to_be_bytes());
        bytes.extend_from_slice(&self.begin.to_be_bytes());
        bytes.extend_from_slice(&self.block);
        bytes
    }

    /// Whether `cancel` names this block.
    pub fn matches(&self, cancel: &CancelMessage) -> bool {
        self.piece_index == cancel.piece_index
            && self.begin == cancel.begin
            && self.block.len() as u64 == cancel.length as u64
    }
}

impl Debug for PieceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PieceMessage {{ piece_index: {}, begin: {}, length: {} }}",
            self.piece_index,
            self.begin,
            self.block.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelMessage {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl CancelMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_frame_len(bytes, 17, "cancel")?;
        let (piece_index, begin, length) = read_block_ref(&bytes[5..])?;

        Ok(CancelMessage {
            piece_index,
            begin,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; 17] {
        block_ref_frame(CANCEL, self.piece_index, self.begin, self.length)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortMessage {
    pub port: u16,
}

impl PortMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        expect_frame_len(bytes, 7, "port")?;
        let mut cursor = Cursor::new(&bytes[5..]);
        let port = cursor.read_u16::<BigEndian>()?;

        Ok(PortMessage { port })
    }

    pub fn to_bytes(&self) -> [u8; 7] {
        let mut bytes = [0u8; 7];
        bytes[0..4].copy_from_slice(&3u32.to_be_bytes());
        bytes[4] = PORT;
        bytes[5..7].copy_from_slice(&self.port.to_be_bytes());
        bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnknownMessage {
    pub id: u8,
    pub payload: Vec<u8>,
}

impl UnknownMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let message_length = 1 + self.payload.len();
        let mut bytes = Vec::with_capacity(4 + message_length);
        bytes.extend_from_slice(&(message_length as u32).to_be_bytes());
        bytes.push(self.id);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

fn read_block_ref(payload: &[u8]) -> Result<(u32, u32, u32)> {
    let mut cursor = Cursor::new(payload);
    let piece_index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;
    let length = cursor.read_u32::<BigEndian>()?;
    if cursor.position() as usize != payload.len() {
        return Err(anyhow!("trailing bytes after block reference"));
    }
    Ok((piece_index, begin, length))
}

fn block_ref_frame(id: u8, piece_index: u32, begin: u32, length: u32) -> [u8; 17] {
    let mut bytes = [0u8; 17];
    bytes[0..4].copy_from_slice(&13u32.to_be_bytes());
    bytes[4] = id;
    bytes[5..9].copy_from_slice(&piece_index.to_be_bytes());
    bytes[9..13].copy_from_slice(&begin.to_be_bytes());
    bytes[13..17].copy_from_slice(&length.to_be_bytes());
    bytes
}
