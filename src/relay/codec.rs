// src/relay/codec.rs
//! Frame codec
//!
//! Wire layout of a frame, after a 4-byte big-endian length prefix:
//!
//! ```text
//! ┌───────┬──────────────────┬───────────────┬────────────┐
//! │ flags │ context len (BE) │ context bytes │ body bytes │
//! │ 1 B   │ 4 B              │ n B           │ rest       │
//! └───────┴──────────────────┴───────────────┴────────────┘
//! ```

use crate::relay::Frame;
use crate::utils::errors::{PoolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted on either side (64 MiB)
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// flags + context length
const HEADER_LEN: usize = 5;

/// Length-delimited frame codec
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PoolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(mut buf) = self.inner.decode(src)? else {
            return Ok(None);
        };

        if buf.len() < HEADER_LEN {
            return Err(PoolError::Decode(format!(
                "frame of {} bytes is shorter than its header",
                buf.len()
            )));
        }

        let flags = buf.get_u8();
        let context_len = buf.get_u32() as usize;
        if context_len > buf.len() {
            return Err(PoolError::Decode(format!(
                "context length {} exceeds frame payload of {} bytes",
                context_len,
                buf.len()
            )));
        }

        let context = buf.split_to(context_len).freeze();
        let body = buf.freeze();

        Ok(Some(Frame {
            flags,
            context,
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PoolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = HEADER_LEN + frame.context.len() + frame.body.len();
        if len > MAX_FRAME_LENGTH {
            return Err(PoolError::Decode(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LENGTH
            )));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(frame.flags);
        buf.put_u32(frame.context.len() as u32);
        buf.put_slice(&frame.context);
        buf.put_slice(&frame.body);

        self.inner.encode(Bytes::from(buf), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::flags;
    use proptest::prelude::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(frame, &mut dst).unwrap();
        dst
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut wire = encode(Frame::data(Bytes::from("ctx"), Bytes::from("hello")));
        let tail = wire.split_off(6);

        let mut codec = FrameCodec::new();
        assert!(codec.decode(&mut wire).unwrap().is_none());

        wire.unsplit(tail);
        let frame = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.context, Bytes::from("ctx"));
        assert_eq!(frame.body, Bytes::from("hello"));
        assert_eq!(frame.flags, 0);
    }

    #[test]
    fn test_error_flag_survives_wire() {
        let mut wire = encode(Frame::error("boom"));
        let frame = FrameCodec::new().decode(&mut wire).unwrap().unwrap();
        assert!(frame.is_error());
        assert_eq!(frame.flags & flags::CONTROL, 0);
    }

    #[test]
    fn test_context_length_overflow_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u8(0);
        payload.put_u32(100);
        payload.put_slice(b"short");

        let mut wire = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(payload.freeze(), &mut wire)
            .unwrap();

        let err = FrameCodec::new().decode(&mut wire).unwrap_err();
        assert!(matches!(err, PoolError::Decode(_)));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut wire = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(&[1, 0]), &mut wire)
            .unwrap();

        assert!(FrameCodec::new().decode(&mut wire).is_err());
    }

    proptest! {
        #[test]
        fn prop_back_to_back_frames_decode_in_order(
            first in proptest::collection::vec(any::<u8>(), 0..256),
            second in proptest::collection::vec(any::<u8>(), 0..256),
            split in 0usize..600,
        ) {
            let mut wire = encode(Frame::data(Bytes::from(first.clone()), Bytes::new()));
            wire.extend_from_slice(&encode(Frame::data(Bytes::new(), Bytes::from(second.clone()))));

            // feed the stream in two arbitrary chunks
            let split = split.min(wire.len());
            let rest = wire.split_off(split);
            let mut codec = FrameCodec::new();
            let mut decoded = Vec::new();
            while let Some(frame) = codec.decode(&mut wire).unwrap() {
                decoded.push(frame);
            }
            wire.unsplit(rest);
            while let Some(frame) = codec.decode(&mut wire).unwrap() {
                decoded.push(frame);
            }

            prop_assert_eq!(decoded.len(), 2);
            prop_assert_eq!(decoded[0].context.as_ref(), first.as_slice());
            prop_assert_eq!(decoded[1].body.as_ref(), second.as_slice());
        }
    }
}
