//! Incremental frame parser.
//!
//! Bytes arrive in whatever pieces the socket hands out. The parser keeps an
//! accumulator of everything not yet consumed and emits each frame as soon as
//! its last byte is present, so feeding a stream in one call or split across
//! many calls produces the same frames.
//!
//! A malformed length prefix poisons the stream: the parser cannot find the
//! next frame boundary, so the whole accumulator is discarded.

use super::{Frame, FrameHeader, HEADER_LEN, LENGTH_PREFIX_LEN};
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Protocol errors raised while extracting frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The length prefix is zero or negative.
    #[error("invalid frame length {0}")]
    InvalidLength(i32),
    /// The length prefix cannot hold the 6-byte header.
    #[error("frame length {0} too small for header")]
    TooShort(i32),
    /// The length prefix exceeds the configured bound.
    #[error("frame length {length} exceeds limit of {limit} bytes")]
    TooLarge { length: i32, limit: usize },
}

/// Stateful, connection-scoped frame decoder.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
    max_frame_len: Option<usize>,
}

impl FrameParser {
    /// Create a parser with an unbounded frame length.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a parser that rejects frames whose length field exceeds `max`.
    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len: Some(max),
        }
    }

    /// Append `data` and emit every complete frame through `on_frame`.
    ///
    /// Returns the number of frames emitted by this call. On error, frames
    /// completed earlier in the same call have already been emitted, and all
    /// buffered bytes (including anything after the bad prefix) are dropped.
    pub fn process<F>(&mut self, data: &[u8], mut on_frame: F) -> Result<usize, FrameError>
    where
        F: FnMut(Frame),
    {
        if data.is_empty() {
            return Ok(0);
        }

        self.buffer.extend_from_slice(data);

        match self.drain(&mut on_frame) {
            Ok(emitted) => Ok(emitted),
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Parse and collect frames; convenience for callers that don't stream.
    pub fn process_collect(&mut self, data: &[u8]) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        self.process(data, |frame| frames.push(frame))?;
        Ok(frames)
    }

    /// Bytes currently buffered waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn drain<F>(&mut self, on_frame: &mut F) -> Result<usize, FrameError>
    where
        F: FnMut(Frame),
    {
        let mut emitted = 0;

        loop {
            if self.buffer.len() < LENGTH_PREFIX_LEN {
                break;
            }

            // Peek; the prefix is only consumed once the whole frame is here.
            let length = i32::from_le_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]);
            self.check_length(length)?;

            let frame_len = length as usize;
            if self.buffer.len() < LENGTH_PREFIX_LEN + frame_len {
                break;
            }

            self.buffer.advance(LENGTH_PREFIX_LEN);
            let mut body = self.buffer.split_to(frame_len).freeze();
            let header = FrameHeader::read_from(&body);
            body.advance(HEADER_LEN);

            on_frame(Frame {
                header,
                payload: body,
            });
            emitted += 1;
        }

        Ok(emitted)
    }

    fn check_length(&self, length: i32) -> Result<(), FrameError> {
        if length <= 0 {
            return Err(FrameError::InvalidLength(length));
        }
        if (length as usize) < HEADER_LEN {
            return Err(FrameError::TooShort(length));
        }
        if let Some(limit) = self.max_frame_len {
            if length as usize > limit {
                return Err(FrameError::TooLarge { length, limit });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::frame::encode_frame;
    use proptest::prelude::*;

    fn hello_frame() -> bytes::Bytes {
        encode_frame(FrameHeader::new(1, 0, 1), b"hello")
    }

    #[test]
    fn test_single_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.process_collect(&hello_frame()).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header, FrameHeader::new(1, 0, 1));
        assert_eq!(&frames[0].payload[..], b"hello");
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_frame_split_across_calls() {
        let wire = hello_frame();
        let mut parser = FrameParser::new();

        let first = parser.process_collect(&wire[..7]).unwrap();
        assert!(first.is_empty());
        assert_eq!(parser.buffered(), 7);

        let second = parser.process_collect(&wire[7..]).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(&second[0].payload[..], b"hello");
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_length_prefix_split() {
        let wire = hello_frame();
        let mut parser = FrameParser::new();

        assert_eq!(parser.process(&wire[..2], |_| {}).unwrap(), 0);
        assert_eq!(parser.process(&wire[2..], |_| {}).unwrap(), 1);
    }

    #[test]
    fn test_multiple_frames_and_trailing_partial() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(FrameHeader::new(1, 0, 2), b"ab"));
        wire.extend_from_slice(&encode_frame(FrameHeader::new(1, 1, 2), b"cd"));
        let third = encode_frame(FrameHeader::new(2, 0, 1), b"xyz");
        wire.extend_from_slice(&third[..5]);

        let mut parser = FrameParser::new();
        let frames = parser.process_collect(&wire).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].header.chunk_index, 1);
        assert_eq!(parser.buffered(), 5);

        let frames = parser.process_collect(&third[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"xyz");
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut parser = FrameParser::new();
        let frames = parser
            .process_collect(&encode_frame(FrameHeader::new(4, 0, 1), b""))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn test_empty_input_is_noop() {
        let mut parser = FrameParser::new();
        assert_eq!(parser.process(&[], |_| panic!("no frames")).unwrap(), 0);
    }

    #[test]
    fn test_non_positive_length_rejected() {
        for length in [0i32, -1, i32::MIN] {
            let mut parser = FrameParser::new();
            let err = parser.process(&length.to_le_bytes(), |_| {}).unwrap_err();
            assert_eq!(err, FrameError::InvalidLength(length));
            assert_eq!(parser.buffered(), 0);
        }
    }

    #[test]
    fn test_short_length_rejected_and_queued_frames_dropped() {
        for length in 1i32..=5 {
            let mut wire = Vec::new();
            wire.extend_from_slice(&length.to_le_bytes());
            wire.extend_from_slice(&hello_frame());

            let mut parser = FrameParser::new();
            let mut seen = 0;
            let err = parser.process(&wire, |_| seen += 1).unwrap_err();

            assert_eq!(err, FrameError::TooShort(length));
            assert_eq!(seen, 0);
            assert_eq!(parser.buffered(), 0);

            // Stream restarts cleanly after the poison is dropped.
            assert_eq!(parser.process(&hello_frame(), |_| {}).unwrap(), 1);
        }
    }

    #[test]
    fn test_frames_before_error_are_emitted() {
        let mut wire = hello_frame().to_vec();
        wire.extend_from_slice(&0i32.to_le_bytes());
        wire.extend_from_slice(&hello_frame());

        let mut parser = FrameParser::new();
        let mut seen = Vec::new();
        let err = parser.process(&wire, |f| seen.push(f)).unwrap_err();

        assert_eq!(err, FrameError::InvalidLength(0));
        assert_eq!(seen.len(), 1);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_max_frame_len() {
        let mut parser = FrameParser::with_max_frame_len(8);
        let err = parser.process(&hello_frame(), |_| {}).unwrap_err();
        assert_eq!(
            err,
            FrameError::TooLarge {
                length: 11,
                limit: 8
            }
        );
        assert_eq!(parser.buffered(), 0);

        let small = encode_frame(FrameHeader::single(1), b"ok");
        assert_eq!(parser.process(&small, |_| {}).unwrap(), 1);
    }

    fn frames_strategy() -> impl Strategy<Value = Vec<(i16, i16, i16, Vec<u8>)>> {
        prop::collection::vec(
            (
                any::<i16>(),
                any::<i16>(),
                any::<i16>(),
                prop::collection::vec(any::<u8>(), 0..64),
            ),
            1..8,
        )
    }

    proptest! {
        #[test]
        fn prop_split_invariance(
            frames in frames_strategy(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let mut wire = Vec::new();
            for (tid, idx, total, payload) in &frames {
                wire.extend_from_slice(&encode_frame(FrameHeader::new(*tid, *idx, *total), payload));
            }

            let whole = FrameParser::new().process_collect(&wire).unwrap();

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(wire.len() + 1)).collect();
            points.sort_unstable();
            points.dedup();

            let mut parser = FrameParser::new();
            let mut pieces = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(wire.len())) {
                pieces.extend(parser.process_collect(&wire[start..point]).unwrap());
                start = point;
            }

            prop_assert_eq!(pieces, whole);
            prop_assert_eq!(parser.buffered(), 0);
        }
    }
}
