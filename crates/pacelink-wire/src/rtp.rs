//! # RTP / RTCP Headers
//!
//! Bounds-checked accessors over raw packet bytes. Parsing never mutates
//! the input and produces only a structured header value; callers keep the
//! payload as a slice of the original buffer.
//!
//! ## RTP fixed header (12 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## RTCP common header (8 bytes)
//!
//! ```text
//! |V=2|P|   RC    |      PT       |            Length             |
//! |                             SSRC                              |
//! ```

use bytes::BufMut;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Minimum RTP header size (no CSRCs, no extension).
pub const RTP_MIN_HEADER: usize = 12;

/// Minimum RTCP common-header size.
pub const RTCP_MIN_HEADER: usize = 8;

// ─── RTP Header ─────────────────────────────────────────────────────────────

/// Parsed RTP fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Protocol version (2 bits, expected 2).
    pub version: u8,
    /// Padding flag.
    pub padding: bool,
    /// Extension flag.
    pub extension: bool,
    /// Number of CSRC entries following the fixed header.
    pub csrc_count: u8,
    /// Marker bit — last packet of a frame.
    pub marker: bool,
    /// Payload type (7 bits).
    pub payload_type: u8,
    /// Sequence number.
    pub sequence: u16,
    /// Media timestamp.
    pub timestamp: u32,
    /// Synchronization source identifier.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header and compute the total header length
    /// (fixed part + CSRC list + extension words).
    ///
    /// Returns `None` if the buffer is shorter than 12 bytes or too short
    /// for the header length its own fields declare.
    pub fn parse(buf: &[u8]) -> Option<(RtpHeader, usize)> {
        if buf.len() < RTP_MIN_HEADER {
            return None;
        }

        let header = RtpHeader {
            version: buf[0] >> 6,
            padding: (buf[0] >> 5) & 0b1 == 1,
            extension: (buf[0] >> 4) & 0b1 == 1,
            csrc_count: buf[0] & 0b0000_1111,
            marker: buf[1] >> 7 == 1,
            payload_type: buf[1] & 0b0111_1111,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };

        let csrc_end = RTP_MIN_HEADER + 4 * header.csrc_count as usize;
        let header_len = if header.extension {
            // The extension length field sits two bytes past the CSRC list
            // and counts 32-bit words.
            if buf.len() < csrc_end + 4 {
                return None;
            }
            let ext_words = u16::from_be_bytes([buf[csrc_end + 2], buf[csrc_end + 3]]) as usize;
            csrc_end + 4 * ext_words
        } else {
            csrc_end
        };

        if buf.len() < header_len {
            return None;
        }

        Some((header, header_len))
    }

    /// Write the 12-byte fixed header. CSRC entries and extension data, if
    /// any, are the caller's to append.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(
            (self.version << 6)
                | (u8::from(self.padding) << 5)
                | (u8::from(self.extension) << 4)
                | (self.csrc_count & 0b0000_1111),
        );
        buf.put_u8((u8::from(self.marker) << 7) | (self.payload_type & 0b0111_1111));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

// ─── RTCP Header ────────────────────────────────────────────────────────────

/// Parsed RTCP common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Protocol version (2 bits, expected 2).
    pub version: u8,
    /// Padding flag.
    pub padding: bool,
    /// Report count (5 bits).
    pub report_count: u8,
    /// Packet type (e.g. 205 for transport-layer feedback).
    pub packet_type: u8,
    /// Packet length in 32-bit words minus one.
    pub length: u16,
    /// SSRC of the packet sender.
    pub ssrc: u32,
}

impl RtcpHeader {
    /// Parse the common header. Returns `None` for buffers shorter than
    /// 8 bytes.
    pub fn parse(buf: &[u8]) -> Option<RtcpHeader> {
        if buf.len() < RTCP_MIN_HEADER {
            return None;
        }

        Some(RtcpHeader {
            version: buf[0] >> 6,
            padding: (buf[0] >> 5) & 0b1 == 1,
            report_count: buf[0] & 0b0001_1111,
            packet_type: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            ssrc: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}
