//! # TCP Client Adapter
//!
//! Connects to the command endpoint and speaks the delimiter framing from
//! `pacelink_wire::frame`: outbound Raw messages are written as frames,
//! inbound bytes are reassembled into frames and forwarded as Raw
//! messages.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pacelink_wire::frame::{encode_frame, FrameBuffer};

use crate::block::{parse_or, parse_params, Block, BlockCore, BlockError, Params};
use crate::fabric::{Sink, Source};
use crate::msg::{Msg, MsgKind, MsgQueue};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// Framed TCP client block.
pub struct TcpClientAdapter {
    core: BlockCore,
    sink: Sink,
    source: Source,
    stream: Option<Arc<TcpStream>>,
}

impl TcpClientAdapter {
    pub fn new(name: &str) -> Self {
        TcpClientAdapter {
            core: BlockCore::new(name),
            sink: Sink::new(),
            source: Source::new(),
            stream: None,
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
}

impl Block for TcpClientAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, params: &Params) -> Result<(), BlockError> {
        self.core.guard_reinit()?;

        let name = self.core.name().to_string();
        let mut remote_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut remote_port = 0u16;
        parse_params(&name, params, |key, value| match key {
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

        let remote = SocketAddr::new(remote_ip, remote_port);
        self.stream = match TcpStream::connect(remote) {
            Ok(stream) => {
                if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
                    tracing::error!(block = %name, error = %e, "failed to set socket timeout");
                }
                tracing::info!(block = %name, %remote, "connected to command endpoint");
                Some(Arc::new(stream))
            }
            Err(e) => {
                tracing::error!(block = %name, %remote, error = %e, "failed to connect");
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

        // Read loop: stream bytes → frames → Raw messages.
        {
            let stop = self.core.stop_flag();
            let stream = self.stream.clone();
            let source = self.source.clone();
            let name = self.core.name().to_string();
            self.core.spawn("rx", move || {
                let mut frames = FrameBuffer::new();
                let mut chunk = [0u8; READ_CHUNK];
                while !stop.load(Ordering::Relaxed) {
                    let Some(stream) = stream.as_deref() else {
                        std::thread::sleep(READ_TIMEOUT);
                        continue;
                    };
                    match (&*stream).read(&mut chunk) {
                        // 0 = orderly disconnect; nothing more will arrive
                        Ok(0) => std::thread::sleep(READ_TIMEOUT),
                        Ok(n) => {
                            frames.extend(&chunk[..n]);
                            while let Some(payload) = frames.next_frame() {
                                source.forward(Msg::raw(payload));
                            }
                        }
                        Err(e) if super::is_transient(&e) => {}
                        Err(e) => {
                            tracing::error!(block = %name, error = %e, "error while reading socket");
                        }
                    }
                }
            });
        }

        // Send loop: Raw messages → frames on the wire.
        let stop = self.core.stop_flag();
        let stream = self.stream.clone();
        let sink = self.sink.clone();
        let name = self.core.name().to_string();
        self.core.spawn("tx", move || {
            while !stop.load(Ordering::Relaxed) {
                let Some(msg) = sink.recv_timeout() else {
                    continue;
                };
                if msg.kind != MsgKind::Raw || msg.is_empty() {
                    continue;
                }
                let Some(stream) = stream.as_deref() else {
                    continue;
                };
                let Some(frame) = encode_frame(&msg.payload) else {
                    tracing::warn!(block = %name, len = msg.len(), "message too large to frame, dropped");
                    continue;
                };
                if let Err(e) = (&*stream).write_all(&frame) {
                    tracing::error!(block = %name, error = %e, "error while sending frame");
                }
            }
        });
    }

    fn stop(&mut self) {
        self.core.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::net::TcpListener;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>()
    }

    fn recv_soon(queue: &MsgQueue) -> Option<crate::msg::SharedMsg> {
        // recv_timeout waits 100 ms; allow a few rounds for thread startup
        (0..20).find_map(|_| queue.recv_timeout())
    }

    #[test]
    fn frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpClientAdapter::new("tcp-cmd");
        client
            .init(&params(&[
                ("remote_addr", "127.0.0.1"),
                ("remote_port", &addr.port().to_string()),
            ]))
            .unwrap();
        let inbox = MsgQueue::bounded(8);
        client.register(MsgKind::Raw, inbox.clone());
        client.start();

        let (mut server_side, _) = listener.accept().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();

        // client → server
        client
            .queue()
            .push(Msg::raw(Bytes::from_static(b"to-server")));
        let mut buf = [0u8; 64];
        let n = server_side.read(&mut buf).unwrap();
        let mut rx = FrameBuffer::new();
        rx.extend(&buf[..n]);
        assert_eq!(rx.next_frame().unwrap(), Bytes::from_static(b"to-server"));

        // server → client, split across two writes
        let frame = encode_frame(b"to-client").unwrap();
        server_side.write_all(&frame[..4]).unwrap();
        server_side.flush().unwrap();
        server_side.write_all(&frame[4..]).unwrap();

        let msg = recv_soon(&inbox).expect("framed message");
        assert_eq!(&msg.payload[..], b"to-client");

        client.stop();
    }

    #[test]
    fn failed_connect_leaves_block_usable() {
        let mut client = TcpClientAdapter::new("tcp-dead");
        // port 1 is almost certainly closed; init logs and continues
        client
            .init(&params(&[
                ("remote_addr", "127.0.0.1"),
                ("remote_port", "1"),
            ]))
            .unwrap();
        client.start();
        client
            .queue()
            .push(Msg::raw(Bytes::from_static(b"goes nowhere")));
        client.stop();
    }
}
