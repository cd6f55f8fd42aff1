//! Stream framing for capture files and stream transports.
//!
//! Each frame is `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`. The framer
//! is fed arbitrary chunks and yields whole payloads; garbage between frames
//! (boot banners, console text) is skipped byte by byte.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::CodecError;
use crate::radio::codec::MAX_FRAME_SIZE;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: BytesMut,
    skipped: usize,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while searching for a frame header.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Next complete payload, or `None` until more data arrives.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            // Align to START1
            match self.buf.iter().position(|b| *b == START1) {
                Some(0) => {}
                Some(pos) => {
                    self.skipped += pos;
                    self.buf.advance(pos);
                }
                None => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let len = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if len > MAX_FRAME_SIZE {
                // Not a real header; resync past START1
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(len).freeze());
        }
    }
}

pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(payload.len()));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(START1);
    out.put_u8(START2);
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    Ok(out.freeze())
}
