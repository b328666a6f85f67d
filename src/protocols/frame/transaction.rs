//! Chunk reassembly.
//!
//! A [`Transaction`] collects the chunks of one logical message. The first
//! chunk fixes the transaction id and chunk count; later chunks must agree
//! with both and may arrive in any order. Assembly concatenates payloads by
//! ascending chunk index, never by arrival order.
//!
//! [`TransactionTable`] is the owner-side bookkeeping for many concurrent
//! transactions on one stream.

use super::Frame;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::warn;

/// Why a chunk was refused, or why assembly failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("transaction id mismatch: expected {expected}, found {found}")]
    TransactionMismatch { expected: i16, found: i16 },
    #[error("total chunk mismatch: expected {expected}, found {found}")]
    TotalChunksMismatch { expected: i16, found: i16 },
    #[error("duplicate chunk index {0}")]
    DuplicateChunk(i16),
    #[error("transaction payload would grow to {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("transaction incomplete: {received} of {expected:?} chunks")]
    Incomplete { received: usize, expected: Option<i16> },
}

/// Outcome of an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// More chunks are still expected.
    Incomplete,
    /// Every expected chunk is now present.
    Complete,
}

/// Accumulates the chunks of one multi-chunk transfer.
#[derive(Debug, Default)]
pub struct Transaction {
    transaction_id: Option<i16>,
    expected_total_chunks: Option<i16>,
    chunks: BTreeMap<i16, Bytes>,
    payload_size: usize,
    max_size: Option<usize>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transaction whose summed payload may not exceed `limit` bytes.
    pub fn with_max_size(limit: usize) -> Self {
        Self {
            max_size: Some(limit),
            ..Self::default()
        }
    }

    /// Record a chunk, returning `false` if it was rejected.
    ///
    /// A rejected chunk leaves the transaction untouched.
    pub fn try_add_chunk(
        &mut self,
        transaction_id: i16,
        chunk_index: i16,
        total_chunks: i16,
        payload: impl Into<Bytes>,
    ) -> bool {
        self.try_push(transaction_id, chunk_index, total_chunks, payload)
            .is_ok()
    }

    /// Record a chunk, reporting why it was rejected.
    pub fn try_push(
        &mut self,
        transaction_id: i16,
        chunk_index: i16,
        total_chunks: i16,
        payload: impl Into<Bytes>,
    ) -> Result<ChunkStatus, ChunkError> {
        if let Some(expected) = self.transaction_id {
            if expected != transaction_id {
                return Err(ChunkError::TransactionMismatch {
                    expected,
                    found: transaction_id,
                });
            }
        }
        if let Some(expected) = self.expected_total_chunks {
            if expected != total_chunks {
                return Err(ChunkError::TotalChunksMismatch {
                    expected,
                    found: total_chunks,
                });
            }
        }
        if self.chunks.contains_key(&chunk_index) {
            return Err(ChunkError::DuplicateChunk(chunk_index));
        }

        let payload = payload.into();
        let size = self.payload_size + payload.len();
        if let Some(limit) = self.max_size {
            if size > limit {
                return Err(ChunkError::TooLarge { size, limit });
            }
        }

        self.transaction_id = Some(transaction_id);
        self.expected_total_chunks = Some(total_chunks);
        self.chunks.insert(chunk_index, payload);
        self.payload_size = size;

        if self.is_complete() {
            Ok(ChunkStatus::Complete)
        } else {
            Ok(ChunkStatus::Incomplete)
        }
    }

    /// Record a decoded frame as a chunk.
    pub fn push_frame(&mut self, frame: &Frame) -> Result<ChunkStatus, ChunkError> {
        let h = frame.header;
        self.try_push(
            h.transaction_id,
            h.chunk_index,
            h.total_chunks,
            frame.payload.clone(),
        )
    }

    /// True once the recorded chunk count equals the expected total.
    pub fn is_complete(&self) -> bool {
        match self.expected_total_chunks {
            Some(total) => total >= 0 && self.chunks.len() == total as usize,
            None => false,
        }
    }

    /// Concatenate all chunks in ascending chunk-index order.
    pub fn assemble(&self) -> Result<Bytes, ChunkError> {
        if !self.is_complete() {
            return Err(ChunkError::Incomplete {
                received: self.chunks.len(),
                expected: self.expected_total_chunks,
            });
        }

        if self.chunks.len() == 1 {
            if let Some(only) = self.chunks.values().next() {
                return Ok(only.clone());
            }
        }

        let mut out = BytesMut::with_capacity(self.payload_size);
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }

    pub fn transaction_id(&self) -> Option<i16> {
        self.transaction_id
    }

    pub fn expected_total_chunks(&self) -> Option<i16> {
        self.expected_total_chunks
    }

    /// Number of chunks recorded so far.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Summed payload bytes recorded so far.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Forget every chunk and the fixed id/total, keeping the size limit.
    pub fn clear(&mut self) {
        self.transaction_id = None;
        self.expected_total_chunks = None;
        self.chunks.clear();
        self.payload_size = 0;
    }
}

/// In-progress transactions of one stream, keyed by transaction id.
#[derive(Debug, Default)]
pub struct TransactionTable {
    pending: HashMap<i16, Transaction>,
    max_size: Option<usize>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every transaction's summed payload to `limit` bytes.
    pub fn with_max_size(limit: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_size: Some(limit),
        }
    }

    /// Feed one frame.
    ///
    /// Returns `Ok(Some(payload))` when the frame completes its transaction,
    /// which is then removed. A conflicting chunk discards the whole
    /// transaction and returns the error.
    pub fn push(&mut self, frame: &Frame) -> Result<Option<Bytes>, ChunkError> {
        let id = frame.header.transaction_id;
        let max_size = self.max_size;
        let txn = self.pending.entry(id).or_insert_with(|| match max_size {
            Some(limit) => Transaction::with_max_size(limit),
            None => Transaction::new(),
        });

        match txn.push_frame(frame) {
            Ok(ChunkStatus::Incomplete) => Ok(None),
            Ok(ChunkStatus::Complete) => {
                let assembled = txn.assemble();
                self.pending.remove(&id);
                assembled.map(Some)
            }
            Err(e) => {
                warn!(transaction_id = id, error = %e, "Discarding transaction");
                self.pending.remove(&id);
                Err(e)
            }
        }
    }

    /// Number of transactions waiting for more chunks.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Abandon a transaction.
    pub fn discard(&mut self, transaction_id: i16) -> Option<Transaction> {
        self.pending.remove(&transaction_id)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::frame::FrameHeader;

    #[test]
    fn test_out_of_order_assembly() {
        let mut txn = Transaction::new();

        assert!(txn.try_add_chunk(5, 2, 3, &b"ghi"[..]));
        assert!(!txn.is_complete());
        assert!(txn.try_add_chunk(5, 0, 3, &b"abc"[..]));
        assert!(!txn.is_complete());
        assert!(txn.try_add_chunk(5, 1, 3, &b"def"[..]));
        assert!(txn.is_complete());

        assert_eq!(&txn.assemble().unwrap()[..], b"abcdefghi");
        assert_eq!(txn.payload_size(), 9);
    }

    #[test]
    fn test_first_chunk_fixes_id_and_total() {
        let mut txn = Transaction::new();
        assert!(txn.try_add_chunk(1, 0, 2, &b"a"[..]));

        assert_eq!(
            txn.try_push(2, 1, 2, &b"b"[..]),
            Err(ChunkError::TransactionMismatch {
                expected: 1,
                found: 2
            })
        );
        assert_eq!(
            txn.try_push(1, 1, 3, &b"b"[..]),
            Err(ChunkError::TotalChunksMismatch {
                expected: 2,
                found: 3
            })
        );

        // Rejections leave state untouched.
        assert_eq!(txn.len(), 1);
        assert_eq!(txn.payload_size(), 1);
        assert_eq!(txn.transaction_id(), Some(1));
        assert_eq!(txn.expected_total_chunks(), Some(2));
    }

    #[test]
    fn test_duplicate_chunk_rejected() {
        let mut txn = Transaction::new();
        assert!(txn.try_add_chunk(1, 0, 2, &b"first"[..]));
        assert!(!txn.try_add_chunk(1, 0, 2, &b"second"[..]));

        assert!(txn.try_add_chunk(1, 1, 2, &b"!"[..]));
        assert_eq!(&txn.assemble().unwrap()[..], b"first!");
    }

    #[test]
    fn test_transaction_id_zero_is_a_real_id() {
        let mut txn = Transaction::new();
        assert!(txn.try_add_chunk(0, 0, 2, &b"a"[..]));
        assert!(!txn.try_add_chunk(7, 1, 2, &b"b"[..]));
    }

    #[test]
    fn test_assemble_incomplete_fails() {
        let txn = Transaction::new();
        assert_eq!(
            txn.assemble(),
            Err(ChunkError::Incomplete {
                received: 0,
                expected: None
            })
        );

        let mut txn = Transaction::new();
        txn.try_add_chunk(1, 0, 2, &b"a"[..]);
        assert!(matches!(
            txn.assemble(),
            Err(ChunkError::Incomplete { received: 1, .. })
        ));
    }

    #[test]
    fn test_max_size() {
        let mut txn = Transaction::with_max_size(4);
        assert!(txn.try_add_chunk(1, 0, 2, &b"abc"[..]));
        assert_eq!(
            txn.try_push(1, 1, 2, &b"de"[..]),
            Err(ChunkError::TooLarge { size: 5, limit: 4 })
        );
        assert!(txn.try_add_chunk(1, 1, 2, &b"d"[..]));
        assert_eq!(&txn.assemble().unwrap()[..], b"abcd");
    }

    #[test]
    fn test_clear_resets() {
        let mut txn = Transaction::new();
        txn.try_add_chunk(3, 0, 1, &b"x"[..]);
        txn.clear();

        assert!(txn.is_empty());
        assert!(!txn.is_complete());
        assert_eq!(txn.transaction_id(), None);
        assert!(txn.try_add_chunk(4, 0, 1, &b"y"[..]));
    }

    #[test]
    fn test_table_interleaved_transactions() {
        let mut table = TransactionTable::new();
        fn f(tid: i16, idx: i16, total: i16, data: &'static [u8]) -> Frame {
            Frame::new(FrameHeader::new(tid, idx, total), data)
        }

        assert_eq!(table.push(&f(1, 1, 2, b"world")).unwrap(), None);
        assert_eq!(
            table.push(&f(2, 0, 1, b"solo")).unwrap().as_deref(),
            Some(&b"solo"[..])
        );
        assert_eq!(table.pending(), 1);

        let done = table.push(&f(1, 0, 2, b"hello ")).unwrap();
        assert_eq!(done.as_deref(), Some(&b"hello world"[..]));
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn test_table_discards_on_conflict() {
        let mut table = TransactionTable::new();
        let first = Frame::new(FrameHeader::new(1, 0, 3), &b"a"[..]);
        let dup = Frame::new(FrameHeader::new(1, 0, 3), &b"b"[..]);

        table.push(&first).unwrap();
        assert_eq!(table.push(&dup), Err(ChunkError::DuplicateChunk(0)));
        assert_eq!(table.pending(), 0);
    }
}
