//! # TCP Server Adapter
//!
//! Single-client command endpoint. The accept loop admits one client at a
//! time — extra connections are closed on arrival while one is active.
//! Client liveness is a shared slot plus an error flag: on read error or
//! orderly disconnect the flag goes up, the read thread parks on a condvar
//! (bounded wait, so stop stays responsive), and the next accepted client
//! swaps into the slot and releases it. Outbound sends are suppressed
//! while the flag is up.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use pacelink_wire::frame::{encode_frame, FrameBuffer};

use crate::block::{parse_or, parse_params, Block, BlockCore, BlockError, Params};
use crate::fabric::{Sink, Source};
use crate::msg::{Msg, MsgKind, MsgQueue};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const ACCEPT_RETRY: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// Shared client state between the accept, read and send paths.
#[derive(Default)]
struct ClientSlot {
    stream: Mutex<Option<Arc<TcpStream>>>,
    /// True while no usable client is connected.
    error: AtomicBool,
    /// Parks the read thread while `error` is up.
    gate: Condvar,
}

impl ClientSlot {
    fn new() -> Arc<Self> {
        let slot = ClientSlot::default();
        slot.error.store(true, Ordering::Relaxed);
        Arc::new(slot)
    }

    fn current(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in a fresh client and wake the read thread.
    fn install(&self, stream: TcpStream) {
        *self.stream.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(stream));
        self.error.store(false, Ordering::Release);
        self.gate.notify_all();
    }

    fn mark_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    fn has_error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    /// Bounded park while the error flag is up.
    fn wait_for_client(&self) {
        let guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self.gate.wait_timeout(guard, READ_TIMEOUT);
    }

    fn wake(&self) {
        self.gate.notify_all();
    }
}

/// Framed TCP server block, one client at a time.
pub struct TcpServerAdapter {
    core: BlockCore,
    sink: Sink,
    source: Source,
    listener: Option<Arc<TcpListener>>,
    client: Arc<ClientSlot>,
}

impl TcpServerAdapter {
    pub fn new(name: &str) -> Self {
        TcpServerAdapter {
            core: BlockCore::new(name),
            sink: Sink::new(),
            source: Source::new(),
            listener: None,
            client: ClientSlot::new(),
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

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }
}

impl Block for TcpServerAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, params: &Params) -> Result<(), BlockError> {
        self.core.guard_reinit()?;

        let name = self.core.name().to_string();
        let mut local_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut local_port = 0u16;
        parse_params(&name, params, |key, value| match key {
            "local_addr" => {
                local_ip = parse_or(&name, key, value, local_ip);
                true
            }
            "local_port" => {
                local_port = parse_or(&name, key, value, local_port);
                true
            }
            _ => false,
        });

        self.listener = match TcpListener::bind((local_ip, local_port)) {
            Ok(listener) => {
                // Nonblocking accept + bounded retry keeps stop latency low.
                if let Err(e) = listener.set_nonblocking(true) {
                    tracing::error!(block = %name, error = %e, "failed to set listener nonblocking");
                }
                tracing::info!(
                    block = %name,
                    local = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                    "waiting for command connection"
                );
                Some(Arc::new(listener))
            }
            Err(e) => {
                tracing::error!(block = %name, error = %e, "failed to bind listener");
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

        // Accept loop: admit one client, close the rest.
        {
            let stop = self.core.stop_flag();
            let listener = self.listener.clone();
            let client = self.client.clone();
            let name = self.core.name().to_string();
            self.core.spawn("accept", move || {
                while !stop.load(Ordering::Relaxed) {
                    let Some(listener) = listener.as_deref() else {
                        std::thread::sleep(ACCEPT_RETRY);
                        continue;
                    };
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            if client.has_error() {
                                if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
                                    tracing::error!(block = %name, error = %e, "failed to set client socket timeout");
                                }
                                tracing::info!(block = %name, %peer, "connection accepted");
                                client.install(stream);
                            } else {
                                tracing::info!(block = %name, %peer, "drop connection, already connected");
                                // stream closed on drop
                            }
                        }
                        Err(e) if super::is_transient(&e) => {
                            std::thread::sleep(ACCEPT_RETRY);
                        }
                        Err(e) => {
                            tracing::error!(block = %name, error = %e, "error during accept");
                            std::thread::sleep(ACCEPT_RETRY);
                        }
                    }
                }
            });
        }

        // Read loop: parked while no client, framing otherwise.
        {
            let stop = self.core.stop_flag();
            let client = self.client.clone();
            let source = self.source.clone();
            let name = self.core.name().to_string();
            self.core.spawn("rx", move || {
                let mut frames = FrameBuffer::new();
                let mut chunk = [0u8; READ_CHUNK];
                while !stop.load(Ordering::Relaxed) {
                    if client.has_error() {
                        // Partial data from a dead client must not frame
                        // into the next client's stream.
                        frames = FrameBuffer::new();
                        client.wait_for_client();
                        continue;
                    }
                    let Some(stream) = client.current() else {
                        continue;
                    };
                    match (&*stream).read(&mut chunk) {
                        Ok(0) => {
                            tracing::info!(block = %name, "client disconnected");
                            client.mark_error();
                        }
                        Ok(n) => {
                            frames.extend(&chunk[..n]);
                            while let Some(payload) = frames.next_frame() {
                                source.forward(Msg::raw(payload));
                            }
                        }
                        Err(e) if super::is_transient(&e) => {}
                        Err(e) => {
                            tracing::error!(block = %name, error = %e, "error while reading socket");
                            client.mark_error();
                        }
                    }
                }
            });
        }

        // Send loop: frames out, suppressed while the error flag is up.
        let stop = self.core.stop_flag();
        let client = self.client.clone();
        let sink = self.sink.clone();
        let name = self.core.name().to_string();
        self.core.spawn("tx", move || {
            while !stop.load(Ordering::Relaxed) {
                let Some(msg) = sink.recv_timeout() else {
                    continue;
                };
                if msg.kind != MsgKind::Raw || msg.is_empty() || client.has_error() {
                    continue;
                }
                let Some(stream) = client.current() else {
                    continue;
                };
                let Some(frame) = encode_frame(&msg.payload) else {
                    tracing::warn!(block = %name, len = msg.len(), "message too large to frame, dropped");
                    continue;
                };
                if let Err(e) = (&*stream).write_all(&frame) {
                    tracing::error!(block = %name, error = %e, "error while sending frame");
                    client.mark_error();
                }
            }
        });
    }

    fn stop(&mut self) {
        if self.core.request_stop() {
            // Release a read thread parked on the client gate.
            self.client.wake();
            self.core.join_workers();
        }
    }
}
