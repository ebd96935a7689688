//! Physical frame codec for `tokio_util::codec::Framed`.
//!
//! Unlike [`PacketIo`](super::packet::PacketIo) this codec does not join continuation frames;
//! every item is one frame with its sequence number. It is used where a peer is scripted frame
//! by frame, such as protocol tests playing the server side.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::protocol::constants::{FRAME_HEADER_LEN, MAX_FRAME_LEN};
use crate::protocol::wire::WireWrite;

/// One physical frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u8,
    pub payload: BytesMut,
}

impl Frame {
    pub fn new(sequence: u8, payload: impl AsRef<[u8]>) -> Self {
        Self {
            sequence,
            payload: BytesMut::from(payload.as_ref()),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // Frame header: 3 bytes length + 1 byte sequence id
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let payload_len = (src[0] as usize) | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
        let sequence = src[3];

        let total_len = FRAME_HEADER_LEN + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(total_len);
        payload.advance(FRAME_HEADER_LEN);
        Ok(Some(Frame { sequence, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > MAX_FRAME_LEN {
            return Err(Error::malformed(MAX_FRAME_LEN));
        }
        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_u24_le(frame.payload.len() as u32);
        dst.put_u8(frame.sequence);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
