use bytes::Buf;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder as TokioDecoder, Encoder as TokioEncoder};

use crate::error::CodecError;
use crate::messages::PeerMessage;

#[derive(Debug)]
pub struct PeerMessageDecoder {
    max_frame_length: usize,
}

impl PeerMessageDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl TokioDecoder for PeerMessageDecoder {
    type Item = PeerMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() >= 4 {
            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if length > self.max_frame_length {
                return Err(CodecError::FrameTooLarge {
                    length,
                    max: self.max_frame_length,
                }
                .into());
            }
        }

        match PeerMessage::from_bytes(src.as_ref()) {
            Ok((n, message)) => {
                src.advance(n);
                Ok(Some(message))
            }
            Err(e) => match e.downcast_ref::<CodecError>() {
                Some(CodecError::IncompleteMessage { needed, available }) => {
                    src.reserve(needed - available);
                    Ok(None)
                }
                Some(CodecError::MessageTooShort(_)) => Ok(None),
                _ => Err(e),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerMessageEncoder;

impl PeerMessageEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl TokioEncoder<PeerMessage> for PeerMessageEncoder {
    type Error = anyhow::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}
