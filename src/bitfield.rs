use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PeerError, Result};

/// Local completion state, owned by the swarm and read by every connection.
pub type SharedBitfield = Arc<RwLock<Bitfield>>;

/// Piece availability vector. Bits are packed most-significant-bit first,
/// exactly as they travel in a `bitfield` message.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    pub fn full(num_pieces: usize) -> Self {
        let mut bitfield = Self::new(num_pieces);
        for index in 0..num_pieces {
            bitfield.bits[index / 8] |= 1 << (7 - (index % 8));
        }
        bitfield
    }

    /// Builds a bitfield from its wire form. The byte length must be exactly
    /// `ceil(num_pieces / 8)` and the trailing spare bits must be clear.
    pub fn from_bytes(num_pieces: usize, bytes: &[u8]) -> Result<Self> {
        let expected = num_pieces.div_ceil(8);
        if bytes.len() != expected {
            return Err(PeerError::InvalidBitfield {
                expected,
                actual: bytes.len(),
                num_pieces,
            }
            .into());
        }

        let spare_bits = expected * 8 - num_pieces;
        if spare_bits > 0 {
            let mask = (1u8 << spare_bits) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(PeerError::InvalidBitfieldSpareBits { num_pieces }.into());
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            num_pieces,
        })
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.num_pieces == 0
    }

    pub fn set(&mut self, index: usize) -> Result<()> {
        if index >= self.num_pieces {
            return Err(PeerError::PieceIndexOutOfRange {
                index,
                num_pieces: self.num_pieces,
            }
            .into());
        }

        self.bits[index / 8] |= 1 << (7 - (index % 8));
        Ok(())
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        (self.bits[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true when `other` holds at least one piece this bitfield lacks.
    pub fn has_more_pieces(&self, other: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(ours, theirs)| theirs & !ours != 0)
    }

    pub fn completed(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }
}

impl Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bitfield {{ pieces: {}/{} }}",
            self.count(),
            self.num_pieces
        )
    }
}
