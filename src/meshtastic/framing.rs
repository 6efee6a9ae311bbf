//! Stream API framing for Meshtastic serial links.
//!
//! In protobuf mode the radio emits and accepts frames of the form:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Anything between frames is the firmware's debug console text. The decoder
//! below can be fed arbitrary chunks; it skips non-frame bytes and resyncs on
//! a bad header by advancing one byte.
use bytes::{Buf, BytesMut};

use crate::errors::TransportError;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
/// Largest payload the firmware will send or accept in one frame
pub const MAX_PAYLOAD: usize = 512;

pub struct FrameDecoder {
    buf: BytesMut,
    discarded: usize,
    frames: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            discarded: 0,
            frames: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes skipped as console text or garbage so far.
    pub fn discarded_bytes(&self) -> usize {
        self.discarded
    }

    /// Whether at least one well-formed frame has been decoded.
    pub fn binary_detected(&self) -> bool {
        self.frames > 0
    }

    /// Extract the next complete frame payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // Realign to a start byte
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.advance(pos);
                    self.discarded += pos;
                }
                None => {
                    self.discarded += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.buf.advance(1);
                self.discarded += 1;
                continue;
            }
            if self.buf.len() < 4 {
                return None;
            }
            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_PAYLOAD {
                self.buf.advance(1);
                self.discarded += 1;
                continue;
            }
            if self.buf.len() < 4 + declared {
                return None;
            }
            self.buf.advance(4);
            let frame = self.buf.split_to(declared).to_vec();
            self.frames += 1;
            return Some(frame);
        }
    }
}

/// Wrap a protobuf payload in a stream API header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(TransportError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    Ok(out)
}
