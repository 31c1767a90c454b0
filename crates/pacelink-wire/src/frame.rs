//! # Control-Channel Framing
//!
//! The TCP command path carries discrete messages over a byte stream using
//! minimal delimiter framing:
//!
//! ```text
//! +------+----------------+=================+
//! | 0xFF | length (u16 BE) | payload bytes  |
//! +------+----------------+=================+
//! ```
//!
//! The receiver scans for the delimiter and reads the following two bytes
//! as a payload length. There is no escaping: a 0xFF byte inside a payload
//! is indistinguishable from a frame start, so this framing is only sound
//! for payloads that cannot contain the delimiter (the JSON control tokens
//! this relay exchanges).

use bytes::{Buf, Bytes, BytesMut};

/// Frame start marker.
pub const DELIMITER: u8 = 0xFF;

/// Delimiter byte + 16-bit length.
pub const FRAME_OVERHEAD: usize = 3;

/// Largest payload a frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Assemble one frame around `payload`.
///
/// Returns `None` when the payload exceeds the 16-bit length field.
pub fn encode_frame(payload: &[u8]) -> Option<BytesMut> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return None;
    }

    let mut frame = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.extend_from_slice(&[DELIMITER]);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Some(frame)
}

// ─── Incremental Decoder ────────────────────────────────────────────────────

/// Reassembles frames from a TCP byte stream delivered in arbitrary chunks.
///
/// Feed received bytes with [`extend`](FrameBuffer::extend), then drain
/// complete frames with [`next_frame`](FrameBuffer::next_frame) until it
/// returns `None`. Bytes preceding a delimiter are discarded; a frame whose
/// payload has not fully arrived stays buffered until the next chunk.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer {
            buf: BytesMut::new(),
        }
    }

    /// Append a received chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extract the next complete frame's payload, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        // Drop garbage ahead of the next delimiter.
        match self.buf.iter().position(|&b| b == DELIMITER) {
            Some(pos) if pos > 0 => self.buf.advance(pos),
            Some(_) => {}
            None => {
                self.buf.clear();
                return None;
            }
        }

        if self.buf.len() < FRAME_OVERHEAD {
            return None;
        }

        let payload_len = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
        if self.buf.len() < FRAME_OVERHEAD + payload_len {
            // incomplete frame
            return None;
        }

        self.buf.advance(FRAME_OVERHEAD);
        Some(self.buf.split_to(payload_len).freeze())
    }
}
