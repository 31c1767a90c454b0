//! # pacelink-wire
//!
//! Wire-format logic for the Pacelink relay. Pure functions over byte
//! slices — no sockets, no threads, no allocation beyond the structured
//! header values and assembled frames.
//!
//! ## Crate structure
//!
//! - [`rtp`] — RTP fixed-header parse/build and RTCP common-header parse
//! - [`frame`] — delimiter framing for the TCP control channel
//! - [`token`] — compact JSON control tokens (bitrate hint / keyframe request)

pub mod frame;
pub mod rtp;
pub mod token;
