//! # pacelink-relay
//!
//! A congestion-paced relay for real-time media. Socket adapters turn wire
//! bytes into typed messages and fan them out over bounded queues; RTP
//! streams land in a per-SSRC table whose outbound queues are drained by a
//! transmit scheduler under admission control from an external rate
//! controller; RTCP feedback closes the loop and surfaces bitrate /
//! keyframe requests on the control channel.
//!
//! One OS thread per worker role, no async runtime. Cancellation is
//! cooperative: every worker polls a shared stop flag at the boundary of a
//! bounded blocking call.
//!
//! ## Crate structure
//!
//! - [`msg`] — shared messages and bounded queues
//! - [`fabric`] — sink/source capabilities and the fan-out registry
//! - [`block`] — block lifecycle (init/start/stop) and configuration
//! - [`clock`] — Q16.16 fixed-point media clock
//! - [`control`] — rate-controller interface and the token-bucket pacer
//! - [`table`] — per-SSRC stream table with inactivity reaping
//! - [`scheduler`] — admission-gated egress drainer
//! - [`relay`] — the paced-relay block tying table, scheduler and feedback
//! - [`net`] — UDP/TCP socket adapter blocks
//! - [`convert`] — message type-conversion block
//! - [`feedback`] — receiver-side feedback endpoint block
//! - [`gen`] — synthetic RTP traffic source

pub mod block;
pub mod clock;
pub mod control;
pub mod convert;
pub mod fabric;
pub mod feedback;
pub mod gen;
pub mod msg;
pub mod net;
pub mod relay;
pub mod scheduler;
pub mod table;
