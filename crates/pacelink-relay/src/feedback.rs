//! # Feedback Endpoint
//!
//! The client side of the paced path: receives RTP datagrams on its UDP
//! socket, forwards them into the pipeline as RtpPacket messages, feeds
//! arrival accounting to the rate controller, and writes the controller's
//! feedback bytes back to the socket at frame boundaries — closing the
//! congestion loop toward the relay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pacelink_wire::rtp::RtpHeader;

use crate::block::{parse_or, parse_params, Block, BlockCore, BlockError, Params};
use crate::clock::MediaClock;
use crate::control::RateController;
use crate::fabric::{Sink, Source};
use crate::msg::{Msg, MsgKind, MsgQueue};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const UDP_BUFFER_SIZE: usize = 65536;

/// Receiver-side feedback block.
pub struct FeedbackEndpoint {
    core: BlockCore,
    #[allow(dead_code)]
    sink: Sink,
    source: Source,
    clock: MediaClock,
    controller: Arc<Mutex<Box<dyn RateController>>>,
    socket: Option<Arc<UdpSocket>>,
}

impl FeedbackEndpoint {
    pub fn new(name: &str, controller: Box<dyn RateController>, clock: MediaClock) -> Self {
        FeedbackEndpoint {
            core: BlockCore::new(name),
            sink: Sink::new(),
            source: Source::new(),
            clock,
            controller: Arc::new(Mutex::new(controller)),
            socket: None,
        }
    }

    pub fn register(&self, kind: MsgKind, queue: MsgQueue) -> bool {
        self.source.register(kind, queue)
    }

    pub fn unregister(&self, kind: MsgKind, queue: &MsgQueue) -> bool {
        self.source.unregister(kind, queue)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.local_addr().ok()
    }
}

impl Block for FeedbackEndpoint {
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

        self.socket = match UdpSocket::bind((local_ip, local_port)) {
            Ok(socket) => {
                if let Err(e) = socket.set_read_timeout(Some(READ_TIMEOUT)) {
                    tracing::error!(block = %name, error = %e, "failed to set socket timeout");
                }
                let remote = SocketAddr::new(remote_ip, remote_port);
                if let Err(e) = socket.connect(remote) {
                    tracing::error!(block = %name, %remote, error = %e, "failed to connect socket");
                }
                tracing::info!(
                    block = %name,
                    local = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                    %remote,
                    "feedback endpoint ready"
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

        let stop = self.core.stop_flag();
        let socket = self.socket.clone();
        let source = self.source.clone();
        let clock = self.clock.clone();
        let controller = self.controller.clone();
        let name = self.core.name().to_string();
        self.core.spawn("main", move || {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            while !stop.load(Ordering::Relaxed) {
                let Some(socket) = socket.as_deref() else {
                    std::thread::sleep(READ_TIMEOUT);
                    continue;
                };
                let n = match socket.recv(&mut buf) {
                    Ok(n) => n,
                    Err(e) if crate::net::is_transient(&e) => continue,
                    Err(e) => {
                        tracing::error!(block = %name, error = %e, "error while reading socket");
                        continue;
                    }
                };

                let Some((hdr, _)) = RtpHeader::parse(&buf[..n]) else {
                    tracing::debug!(block = %name, len = n, "malformed rtp packet dropped");
                    continue;
                };

                let now = clock.now_q16();
                source.forward(Msg::with_extra(
                    MsgKind::RtpPacket,
                    Bytes::copy_from_slice(&buf[..n]),
                    u64::from(now),
                ));

                let mut ctl = controller.lock().unwrap_or_else(|e| e.into_inner());
                ctl.on_media_frame(now, hdr.ssrc, n, hdr.marker);
                let feedback = ctl.build_feedback(now, hdr.marker);
                drop(ctl);

                if let Some(feedback) = feedback {
                    if let Err(e) = socket.send(&feedback) {
                        tracing::error!(block = %name, error = %e, "error while sending feedback");
                    }
                }
            }
        });
    }

    fn stop(&mut self) {
        self.core.stop();
    }
}
