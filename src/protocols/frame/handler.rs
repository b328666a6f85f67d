//! Echo handler for the frame protocol.
//!
//! Reassembles each transaction per connection and, once complete, sends the
//! payload back under the same transaction id. Useful for throughput testing
//! and as an end-to-end check of the send path.

use super::{encode_chunks, try_encode_frame, Frame, FrameHeader, TransactionTable};
use crate::runtime::{AcceptListener, ConnectionContext, CorrelationKey};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Per-connection transaction reassembly with echo replies.
#[derive(Debug, Default)]
pub struct EchoHandler {
    tables: Mutex<HashMap<CorrelationKey, TransactionTable>>,
    /// Split replies into chunks of this size; `None` replies with one frame.
    chunk_size: Option<usize>,
    max_transaction_size: Option<usize>,
}

impl EchoHandler {
    pub fn new(chunk_size: Option<usize>, max_transaction_size: Option<usize>) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            chunk_size: chunk_size.filter(|&size| size > 0),
            max_transaction_size,
        }
    }

    /// Subscribe to the listener's frame and disconnect events.
    pub fn attach(self: Arc<Self>, listener: &AcceptListener) {
        let handler = Arc::clone(&self);
        listener
            .events()
            .on_frame_received(move |ctx, frame| handler.on_frame(ctx, frame));

        listener
            .events()
            .on_disconnected(move |ctx, _| self.forget(ctx.key()));
    }

    /// Transactions still waiting for chunks, across all connections.
    pub fn pending(&self) -> usize {
        self.tables.lock().values().map(|t| t.pending()).sum()
    }

    fn on_frame(&self, ctx: &Arc<ConnectionContext>, frame: &Frame) {
        let assembled = {
            let mut tables = self.tables.lock();
            let table = tables.entry(ctx.key()).or_insert_with(|| match self.max_transaction_size {
                Some(limit) => TransactionTable::with_max_size(limit),
                None => TransactionTable::new(),
            });
            table.push(frame)
        };

        match assembled {
            Ok(Some(payload)) => self.reply(ctx, frame.header.transaction_id, payload),
            Ok(None) => trace!(
                conn_id = ctx.key().get(),
                transaction_id = frame.header.transaction_id,
                chunk_index = frame.header.chunk_index,
                "Chunk buffered"
            ),
            // The table has already discarded the transaction.
            Err(e) => trace!(
                conn_id = ctx.key().get(),
                transaction_id = frame.header.transaction_id,
                error = %e,
                "Chunk rejected, no reply"
            ),
        }
    }

    fn reply(&self, ctx: &Arc<ConnectionContext>, transaction_id: i16, payload: Bytes) {
        let encoded = match self.chunk_size {
            Some(size) => encode_chunks(transaction_id, &payload, size),
            None => try_encode_frame(FrameHeader::single(transaction_id), &payload).map(|f| vec![f]),
        };
        let frames = match encoded {
            Ok(frames) => frames,
            Err(e) => {
                warn!(
                    conn_id = ctx.key().get(),
                    transaction_id,
                    len = payload.len(),
                    error = %e,
                    "Echo reply cannot be encoded, dropped"
                );
                return;
            }
        };

        for frame in frames {
            if let Err(e) = ctx.send(&frame) {
                debug!(conn_id = ctx.key().get(), error = %e, "Echo reply dropped");
                return;
            }
        }
    }

    fn forget(&self, key: CorrelationKey) {
        self.tables.lock().remove(&key);
    }
}
