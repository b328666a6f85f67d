//! Chunk-addressable frame protocol.
//!
//! A stream is a plain concatenation of frames with no separators. Every
//! integer is little-endian:
//!
//! ```text
//! offset 0:   i32  length         (6 + payload length)
//! offset 4:   i16  transaction_id
//! offset 6:   i16  chunk_index
//! offset 8:   i16  total_chunks
//! offset 10.. payload             (length - 6 bytes)
//! ```
//!
//! Example: one chunk of transaction 1 carrying `hello` is 15 bytes on the
//! wire, with a length field of 11.
//!
//! A logical message larger than one frame is split into chunks sharing a
//! transaction id; [`Transaction`] joins them back in chunk-index order.

#[cfg(target_os = "linux")]
pub mod handler;
pub mod parser;
pub mod transaction;

#[cfg(target_os = "linux")]
pub use handler::EchoHandler;
pub use parser::{FrameError, FrameParser};
pub use transaction::{ChunkError, ChunkStatus, Transaction, TransactionTable};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the header that follows the length prefix.
pub const HEADER_LEN: usize = 6;

/// Reasons a payload cannot be expressed as frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,
    /// The `i16` chunk count cannot address this many pieces.
    #[error("{len}-byte payload needs {chunks} chunks, more than {} allowed", i16::MAX)]
    TooManyChunks { len: usize, chunks: usize },
    /// One frame would overflow the `i32` length field.
    #[error("{0}-byte payload exceeds the frame length field")]
    PayloadTooLarge(usize),
}

/// Header carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    pub transaction_id: i16,
    pub chunk_index: i16,
    pub total_chunks: i16,
}

impl FrameHeader {
    pub fn new(transaction_id: i16, chunk_index: i16, total_chunks: i16) -> Self {
        Self {
            transaction_id,
            chunk_index,
            total_chunks,
        }
    }

    /// Header for a message that fits in a single frame.
    pub fn single(transaction_id: i16) -> Self {
        Self::new(transaction_id, 0, 1)
    }

    /// Decode the 6-byte header. `input` must hold at least [`HEADER_LEN`] bytes.
    fn read_from(input: &[u8]) -> Self {
        Self {
            transaction_id: i16::from_le_bytes([input[0], input[1]]),
            chunk_index: i16::from_le_bytes([input[2], input[3]]),
            total_chunks: i16::from_le_bytes([input[4], input[5]]),
        }
    }

    fn write_to(&self, out: &mut BytesMut) {
        out.put_i16_le(self.transaction_id);
        out.put_i16_le(self.chunk_index);
        out.put_i16_le(self.total_chunks);
    }
}

/// A decoded frame: header plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Encode this frame into its wire representation.
    pub fn encode(&self) -> Bytes {
        encode_frame(self.header, &self.payload)
    }
}

/// Encode a header and payload into one wire frame.
///
/// # Panics
/// Panics if the payload is too large for the `i32` length field. Use
/// [`try_encode_frame`] for payloads of unchecked size.
pub fn encode_frame(header: FrameHeader, payload: &[u8]) -> Bytes {
    let length = HEADER_LEN + payload.len();
    let length = i32::try_from(length).expect("frame payload exceeds i32 length field");
    write_frame(header, length, payload)
}

/// Encode a header and payload into one wire frame, rejecting payloads the
/// length field cannot describe.
pub fn try_encode_frame(header: FrameHeader, payload: &[u8]) -> Result<Bytes, EncodeError> {
    let length = i32::try_from(HEADER_LEN + payload.len())
        .map_err(|_| EncodeError::PayloadTooLarge(payload.len()))?;
    Ok(write_frame(header, length, payload))
}

fn write_frame(header: FrameHeader, length: i32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + length as usize);
    out.put_i32_le(length);
    header.write_to(&mut out);
    out.put_slice(payload);
    out.freeze()
}

/// Split `payload` into `chunk_size` pieces and encode each as a chunk of
/// `transaction_id`.
///
/// An empty payload still produces one (empty) chunk. Nothing is encoded
/// unless every piece fits.
pub fn encode_chunks(
    transaction_id: i16,
    payload: &[u8],
    chunk_size: usize,
) -> Result<Vec<Bytes>, EncodeError> {
    if chunk_size == 0 {
        return Err(EncodeError::ZeroChunkSize);
    }

    let chunks = payload.len().div_ceil(chunk_size).max(1);
    let total = i16::try_from(chunks).map_err(|_| EncodeError::TooManyChunks {
        len: payload.len(),
        chunks,
    })?;
    let largest = chunk_size.min(payload.len());
    let length = i32::try_from(HEADER_LEN + largest)
        .map_err(|_| EncodeError::PayloadTooLarge(largest))?;

    if payload.is_empty() {
        return Ok(vec![write_frame(FrameHeader::new(transaction_id, 0, total), length, payload)]);
    }

    Ok(payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(idx, piece)| {
            encode_frame(FrameHeader::new(transaction_id, idx as i16, total), piece)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_single_frame_layout() {
        let bytes = encode_frame(FrameHeader::new(1, 0, 1), b"hello");

        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[0..4], &11i32.to_le_bytes());
        assert_eq!(&bytes[4..6], &1i16.to_le_bytes());
        assert_eq!(&bytes[6..8], &0i16.to_le_bytes());
        assert_eq!(&bytes[8..10], &1i16.to_le_bytes());
        assert_eq!(&bytes[10..], b"hello");
    }

    #[test]
    fn test_header_read_back() {
        let bytes = encode_frame(FrameHeader::new(-3, 7, 300), b"");
        let header = FrameHeader::read_from(&bytes[LENGTH_PREFIX_LEN..]);
        assert_eq!(header, FrameHeader::new(-3, 7, 300));
    }

    #[test]
    fn test_encode_chunks() {
        let frames = encode_chunks(9, b"abcdefg", 3).unwrap();
        assert_eq!(frames.len(), 3);

        let last = &frames[2];
        assert_eq!(&last[0..4], &7i32.to_le_bytes());
        assert_eq!(FrameHeader::read_from(&last[4..]), FrameHeader::new(9, 2, 3));
        assert_eq!(&last[10..], b"g");

        let empty = encode_chunks(9, b"", 3).unwrap();
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].len(), LENGTH_PREFIX_LEN + HEADER_LEN);
        assert_eq!(FrameHeader::read_from(&empty[0][4..]), FrameHeader::new(9, 0, 1));
    }

    #[test]
    fn test_encode_chunks_limits() {
        assert_eq!(encode_chunks(1, b"abc", 0), Err(EncodeError::ZeroChunkSize));

        let max = vec![7u8; i16::MAX as usize];
        let frames = encode_chunks(1, &max, 1).unwrap();
        assert_eq!(frames.len(), i16::MAX as usize);
        assert_eq!(
            FrameHeader::read_from(&frames[frames.len() - 1][4..]),
            FrameHeader::new(1, i16::MAX - 1, i16::MAX)
        );

        let over = vec![7u8; 40_000];
        assert_eq!(
            encode_chunks(1, &over, 1),
            Err(EncodeError::TooManyChunks {
                len: 40_000,
                chunks: 40_000
            })
        );
    }

    #[test]
    fn test_try_encode_frame() {
        let bytes = try_encode_frame(FrameHeader::single(2), b"ok").unwrap();
        assert_eq!(bytes, encode_frame(FrameHeader::single(2), b"ok"));
    }
}
