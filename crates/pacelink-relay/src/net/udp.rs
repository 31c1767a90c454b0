//! # UDP Adapter
//!
//! Bidirectional datagram bridge: received datagrams become Raw messages
//! on the fan-out, Raw messages from the sink go out on the socket.
//!
//! The remote endpoint is either fixed (`remote_port` set) or dynamic
//! (`remote_port` 0): with a dynamic peer the adapter latches the source
//! address of the most recent received datagram — the pattern for the
//! game-server side, which picks its media ports at runtime.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::block::{parse_or, parse_params, Block, BlockCore, BlockError, Params};
use crate::fabric::{Sink, Source};
use crate::msg::{Msg, MsgKind, MsgQueue};

/// Receive buffer size — large enough for any datagram.
pub const UDP_BUFFER_SIZE: usize = 65536;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Bidirectional UDP socket block.
pub struct UdpAdapter {
    core: BlockCore,
    sink: Sink,
    source: Source,
    socket: Option<Arc<UdpSocket>>,
    /// Where outgoing messages go; `None` until a dynamic peer is learned.
    peer: Arc<Mutex<Option<SocketAddr>>>,
    fixed_peer: bool,
}

impl UdpAdapter {
    pub fn new(name: &str) -> Self {
        UdpAdapter {
            core: BlockCore::new(name),
            sink: Sink::new(),
            source: Source::new(),
            socket: None,
            peer: Arc::new(Mutex::new(None)),
            fixed_peer: false,
        }
    }

    pub fn queue(&self) -> MsgQueue {
        self.sink.queue()
    }

    pub fn register(&self, kind: MsgKind, queue: MsgQueue) -> bool {
        self.source.register(kind, queue)
    }

    pub fn unregister(&self, kind: MsgKind, queue: &MsgQueue) -> bool {
        self.source.unregister(kind, queue)
    }

    /// Local address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.local_addr().ok()
    }
}

impl Block for UdpAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, params: &Params) -> Result<(), BlockError> {
        self.core.guard_reinit()?;

        let name = self.core.name().to_string();
        let mut local_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut local_port = 0u16;
        let mut remote_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut remote_port = 0u16;
        parse_params(&name, params, |key, value| match key {
            "local_addr" => {
                local_ip = parse_or(&name, key, value, local_ip);
                true
            }
            "local_port" => {
                local_port = parse_or(&name, key, value, local_port);
                true
            }
            "remote_addr" => {
                remote_ip = parse_or(&name, key, value, remote_ip);
                true
            }
            "remote_port" => {
                remote_port = parse_or(&name, key, value, remote_port);
                true
            }
            _ => false,
        });

        self.fixed_peer = remote_port != 0;
        *lock_peer(&self.peer) = self
            .fixed_peer
            .then(|| SocketAddr::new(remote_ip, remote_port));

        self.socket = match UdpSocket::bind((local_ip, local_port)) {
            Ok(socket) => {
                if let Err(e) = socket.set_read_timeout(Some(READ_TIMEOUT)) {
                    tracing::error!(block = %name, error = %e, "failed to set socket timeout");
                }
                tracing::info!(
                    block = %name,
                    local = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                    remote = %format_args!("{remote_ip}:{remote_port}"),
                    dynamic_peer = !self.fixed_peer,
                    "udp adapter bound"
                );
                Some(Arc::new(socket))
            }
            Err(e) => {
                tracing::error!(block = %name, error = %e, "failed to bind socket");
                None
            }
        };

        self.core.mark_initialized();
        Ok(())
    }

    fn start(&mut self) {
        if !self.core.begin_start() {
            return;
        }

        // Read loop: datagrams in, Raw messages out.
        {
            let stop = self.core.stop_flag();
            let socket = self.socket.clone();
            let source = self.source.clone();
            let peer = self.peer.clone();
            let fixed_peer = self.fixed_peer;
            let name = self.core.name().to_string();
            self.core.spawn("rx", move || {
                let mut buf = vec![0u8; UDP_BUFFER_SIZE];
                while !stop.load(Ordering::Relaxed) {
                    let Some(socket) = socket.as_deref() else {
                        std::thread::sleep(READ_TIMEOUT);
                        continue;
                    };
                    match socket.recv_from(&mut buf) {
                        Ok((0, _)) => {}
                        Ok((n, from)) => {
                            if !fixed_peer {
                                *lock_peer(&peer) = Some(from);
                            }
                            source.forward(Msg::raw(Bytes::copy_from_slice(&buf[..n])));
                        }
                        Err(e) if super::is_transient(&e) => {}
                        Err(e) => {
                            tracing::error!(block = %name, error = %e, "error while reading socket");
                        }
                    }
                }
            });
        }

        // Send loop: Raw messages from the sink onto the wire.
        let stop = self.core.stop_flag();
        let socket = self.socket.clone();
        let sink = self.sink.clone();
        let peer = self.peer.clone();
        let name = self.core.name().to_string();
        self.core.spawn("tx", move || {
            while !stop.load(Ordering::Relaxed) {
                let Some(msg) = sink.recv_timeout() else {
                    continue;
                };
                if msg.kind != MsgKind::Raw || msg.is_empty() {
                    continue;
                }
                let Some(socket) = socket.as_deref() else {
                    continue;
                };
                let Some(dest) = *lock_peer(&peer) else {
                    tracing::debug!(block = %name, "no peer yet, dropping outbound datagram");
                    continue;
                };
                if let Err(e) = socket.send_to(&msg.payload, dest) {
                    tracing::error!(block = %name, error = %e, "error while sending data");
                }
            }
        });
    }

    fn stop(&mut self) {
        self.core.stop();
    }
}

fn lock_peer(peer: &Mutex<Option<SocketAddr>>) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
    peer.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>()
    }

    #[test]
    fn datagrams_become_raw_messages() {
        let mut adapter = UdpAdapter::new("udp-rx");
        adapter
            .init(&params(&[
                ("local_addr", "127.0.0.1"),
                ("local_port", "0"),
            ]))
            .unwrap();
        let out = MsgQueue::bounded(8);
        adapter.register(MsgKind::Raw, out.clone());
        adapter.start();

        let dest = adapter.local_addr().unwrap();
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.send_to(b"datagram", dest).unwrap();

        let msg = out.recv_timeout().expect("forwarded datagram");
        assert_eq!(msg.kind, MsgKind::Raw);
        assert_eq!(&msg.payload[..], b"datagram");

        adapter.stop();
    }

    #[test]
    fn fixed_peer_send_path() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();

        let mut adapter = UdpAdapter::new("udp-tx");
        adapter
            .init(&params(&[
                ("local_addr", "127.0.0.1"),
                ("local_port", "0"),
                ("remote_addr", "127.0.0.1"),
                ("remote_port", &dest.port().to_string()),
            ]))
            .unwrap();
        adapter.start();

        adapter
            .queue()
            .push(Msg::raw(Bytes::from_static(b"outbound")));

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).expect("datagram arrives");
        assert_eq!(&buf[..n], b"outbound");

        adapter.stop();
    }

    #[test]
    fn dynamic_peer_latched_from_ingress() {
        let mut adapter = UdpAdapter::new("udp-dyn");
        adapter
            .init(&params(&[
                ("local_addr", "127.0.0.1"),
                ("local_port", "0"),
                ("remote_port", "0"),
            ]))
            .unwrap();
        adapter.start();
        let dest = adapter.local_addr().unwrap();

        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        probe.send_to(b"hello", dest).unwrap();

        // Give the read loop a moment to latch the peer, then send back.
        std::thread::sleep(Duration::from_millis(100));
        adapter.queue().push(Msg::raw(Bytes::from_static(b"reply")));

        let mut buf = [0u8; 64];
        let (n, _) = probe.recv_from(&mut buf).expect("reply to learned peer");
        assert_eq!(&buf[..n], b"reply");

        adapter.stop();
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let mut adapter = UdpAdapter::new("udp-cfg");
        adapter
            .init(&params(&[
                ("local_addr", "127.0.0.1"),
                ("local_port", "0"),
                ("flux_capacitor", "1.21"),
            ]))
            .unwrap();
        adapter.stop(); // not running — diagnostic only
    }
}
