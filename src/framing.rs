//! Length-prefixed message framing (C2, second half).
//!
//! `uint32_be length || utf8_json payload`, max payload length
//! [`MAX_FRAME_LEN`] (512 KiB, spec.md §2/§6). The decoder is a small state
//! machine over an internal byte buffer so it tolerates arbitrary
//! byte-boundary chunking from the underlying TLS stream — it never
//! assumes a `read()` returns a whole frame, or even a whole length prefix.

use bytes_buffer::FrameBuffer;

use crate::error::CribCallError;

pub const MAX_FRAME_LEN: usize = 512 * 1024;
const LENGTH_PREFIX_LEN: usize = 4;

/// Encode one JSON payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, CribCallError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(CribCallError::FrameTooLarge);
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Stateful incremental frame decoder. Feed it arbitrarily-sized chunks via
/// [`FrameDecoder::push`]; call [`FrameDecoder::next_frame`] after each push
/// to drain any complete frames now available.
#[derive(Default)]
pub struct FrameDecoder {
    buf: FrameBuffer,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly-read bytes to the decode buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk);
    }

    /// Pop the next complete frame's payload, if one is fully buffered.
    /// Returns `Ok(None)` when more bytes are needed. A payload whose
    /// declared length exceeds [`MAX_FRAME_LEN`] is a terminal error — the
    /// caller must close the session (spec.md §2).
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CribCallError> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = self.buf.peek_u32_be(0) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CribCallError::FrameTooLarge);
        }
        if self.buf.len() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }
        let frame = self.buf.split_off_front(LENGTH_PREFIX_LEN, len);
        Ok(Some(frame))
    }
}

/// Minimal growable byte ring used by [`FrameDecoder`]. Kept as its own
/// tiny module rather than pulling in a general-purpose buffer crate: the
/// access pattern here (append at the back, consume a known-length prefix
/// from the front) is narrow enough to hand-roll, in the same spirit the
/// teacher crate hand-rolls its own framed audio/laser buffers.
mod bytes_buffer {
    #[derive(Default)]
    pub struct FrameBuffer {
        data: Vec<u8>,
    }

    impl FrameBuffer {
        pub fn extend(&mut self, chunk: &[u8]) {
            self.data.extend_from_slice(chunk);
        }

        pub fn len(&self) -> usize {
            self.data.len()
        }

        pub fn peek_u32_be(&self, offset: usize) -> u32 {
            u32::from_be_bytes(
                self.data[offset..offset + 4]
                    .try_into()
                    .expect("checked length before calling peek_u32_be"),
            )
        }

        /// Remove and return the `payload_len` bytes starting after
        /// `prefix_len`, dropping the prefix and payload from the buffer.
        pub fn split_off_front(&mut self, prefix_len: usize, payload_len: usize) -> Vec<u8> {
            let total = prefix_len + payload_len;
            let rest = self.data.split_off(total);
            let mut consumed = std::mem::replace(&mut self.data, rest);
            consumed.drain(0..prefix_len);
            consumed
        }
    }
}
