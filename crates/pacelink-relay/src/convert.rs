//! # Message Type Conversion
//!
//! A small block that rewrites a message's kind on its way between
//! adapters. Two shapes exist:
//!
//! - **Re-tagging** (`Raw ↔ RtpPacket`, `Raw ↔ RtcpPacket`): the payload
//!   crosses unchanged — the shared `Bytes` buffer is reused, only the
//!   kind differs.
//! - **Token synthesis** (`BitrateRequest → Raw`, `IframeRequest → Raw`):
//!   a compact control token is built for the command channel; the
//!   bitrate value rides in the message's `extra`, the keyframe request
//!   becomes the fixed −1 sentinel whatever the input carried.

use std::sync::Arc;

use pacelink_wire::token;

use crate::block::{parse_params, Block, BlockCore, BlockError, Params};
use crate::fabric::{Sink, Source};
use crate::msg::{Msg, MsgKind, MsgQueue, SharedMsg};

/// Converts messages of one kind into another.
pub struct TypeConverter {
    core: BlockCore,
    sink: Sink,
    source: Source,
    from: MsgKind,
    to: MsgKind,
}

impl TypeConverter {
    /// Build a converter for the given kind pair. Only identity,
    /// raw/packet re-tagging and control-token pairs are meaningful;
    /// anything else is rejected.
    pub fn new(name: &str, from: MsgKind, to: MsgKind) -> Result<Self, BlockError> {
        use MsgKind::*;
        let supported = from == to
            || matches!(
                (from, to),
                (Raw, RtpPacket)
                    | (Raw, RtcpPacket)
                    | (RtpPacket, Raw)
                    | (RtcpPacket, Raw)
                    | (BitrateRequest, Raw)
                    | (IframeRequest, Raw)
            );
        if !supported {
            return Err(BlockError::UnsupportedConversion(from, to));
        }

        Ok(TypeConverter {
            core: BlockCore::new(name),
            sink: Sink::new(),
            source: Source::new(),
            from,
            to,
        })
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

    fn convert(from: MsgKind, to: MsgKind, msg: &SharedMsg) -> SharedMsg {
        match (from, to) {
            (MsgKind::BitrateRequest, MsgKind::Raw) => {
                Msg::with_extra(MsgKind::Raw, token::bitrate_token(msg.extra), msg.extra)
            }
            (MsgKind::IframeRequest, MsgKind::Raw) => Msg::new(MsgKind::Raw, token::keyframe_token()),
            // Byte-identical crossing: share the payload, change the tag.
            _ => Arc::new(Msg {
                kind: to,
                payload: msg.payload.clone(),
                extra: msg.extra,
            }),
        }
    }
}

impl Block for TypeConverter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, params: &Params) -> Result<(), BlockError> {
        self.core.guard_reinit()?;
        parse_params(self.core.name(), params, |_, _| false);
        self.core.mark_initialized();
        Ok(())
    }

    fn start(&mut self) {
        if !self.core.begin_start() {
            return;
        }

        let stop = self.core.stop_flag();
        let sink = self.sink.clone();
        let source = self.source.clone();
        let (from, to) = (self.from, self.to);
        self.core.spawn("main", move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let Some(msg) = sink.recv_timeout() else {
                    continue;
                };
                if msg.kind != from {
                    continue;
                }
                let out = if from == to {
                    msg
                } else {
                    Self::convert(from, to, &msg)
                };
                source.forward(out);
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

    #[test]
    fn invalid_pairs_rejected() {
        assert!(matches!(
            TypeConverter::new("bad", MsgKind::RtpPacket, MsgKind::RtcpPacket),
            Err(BlockError::UnsupportedConversion(_, _))
        ));
        assert!(matches!(
            TypeConverter::new("bad", MsgKind::Raw, MsgKind::BitrateRequest),
            Err(BlockError::UnsupportedConversion(_, _))
        ));
        assert!(TypeConverter::new("ok", MsgKind::Raw, MsgKind::Raw).is_ok());
    }

    #[test]
    fn retag_shares_payload() {
        let payload = Bytes::from_static(b"\x80\x60rtp packet bytes");
        let msg = Msg::with_extra(MsgKind::Raw, payload.clone(), 7);
        let out = TypeConverter::convert(MsgKind::Raw, MsgKind::RtpPacket, &msg);
        assert_eq!(out.kind, MsgKind::RtpPacket);
        assert_eq!(out.payload, payload);
        assert_eq!(out.extra, 7);
    }

    #[test]
    fn bitrate_request_becomes_token() {
        let msg = Msg::with_extra(MsgKind::BitrateRequest, Bytes::new(), 2_000_000);
        let out = TypeConverter::convert(MsgKind::BitrateRequest, MsgKind::Raw, &msg);
        assert_eq!(out.kind, MsgKind::Raw);
        let parsed = token::parse_token(&out.payload).unwrap();
        assert_eq!(parsed.v, 2_000_000);
    }

    #[test]
    fn iframe_request_ignores_input_content() {
        let msg = Msg::with_extra(
            MsgKind::IframeRequest,
            Bytes::from_static(b"whatever was here"),
            12345,
        );
        let out = TypeConverter::convert(MsgKind::IframeRequest, MsgKind::Raw, &msg);
        let parsed = token::parse_token(&out.payload).unwrap();
        assert!(parsed.is_keyframe_request());
    }

    #[test]
    fn running_converter_filters_and_converts() {
        let mut conv =
            TypeConverter::new("bitrate-token", MsgKind::BitrateRequest, MsgKind::Raw).unwrap();
        conv.init(&Params::new()).unwrap();

        let out = MsgQueue::bounded(8);
        conv.register(MsgKind::Raw, out.clone());
        conv.start();

        let inbox = conv.queue();
        inbox.push(Msg::raw(Bytes::from_static(b"wrong kind, dropped")));
        inbox.push(Msg::with_extra(MsgKind::BitrateRequest, Bytes::new(), 500_000));

        let got = out.recv_timeout().expect("converted message");
        assert_eq!(token::parse_token(&got.payload).unwrap().v, 500_000);
        assert!(out.recv_timeout().is_none());

        conv.stop();
    }
}
