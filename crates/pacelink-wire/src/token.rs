//! # Control Tokens
//!
//! The control channel speaks single-object JSON tokens:
//!
//! - `{"t":"n","v":2000000}` — numeric bitrate hint in bits per second
//! - `{"t":"n","v":-1}` — keyframe request sentinel
//!
//! Tokens are consumed by the control-channel endpoint on the game-server
//! side; this module only defines the encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sentinel value meaning "request a keyframe".
pub const KEYFRAME_SENTINEL: i64 = -1;

/// One control-channel token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlToken {
    /// Token tag; `"n"` for numeric.
    pub t: String,
    /// Numeric value: a bitrate in bits per second, or [`KEYFRAME_SENTINEL`].
    pub v: i64,
}

impl ControlToken {
    pub fn numeric(v: i64) -> Self {
        ControlToken {
            t: "n".to_string(),
            v,
        }
    }

    pub fn is_keyframe_request(&self) -> bool {
        self.v == KEYFRAME_SENTINEL
    }
}

/// Encode a bitrate hint token.
pub fn bitrate_token(bits_per_second: u64) -> Bytes {
    encode(&ControlToken::numeric(bits_per_second as i64))
}

/// Encode the fixed keyframe-request token.
pub fn keyframe_token() -> Bytes {
    encode(&ControlToken::numeric(KEYFRAME_SENTINEL))
}

/// Decode a token, if the payload is one.
pub fn parse_token(payload: &[u8]) -> Option<ControlToken> {
    serde_json::from_slice(payload).ok()
}

fn encode(token: &ControlToken) -> Bytes {
    // A two-field struct of string + integer cannot fail to serialize.
    serde_json::to_vec(token).expect("control token serialization").into()
}
