//! # Socket Adapters
//!
//! Blocks bridging raw network I/O to the message fabric: a bidirectional
//! UDP adapter for media/input streams and a length-framed TCP pair for
//! the command channel.

pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

pub use tcp_client::TcpClientAdapter;
pub use tcp_server::TcpServerAdapter;
pub use udp::UdpAdapter;

use std::io;

/// Whether an I/O error is the expected steady-state "nothing to read"
/// condition (receive timeout / would-block), which loops ignore silently.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
