//! Linux io_uring completion queue.
//!
//! Completion-based I/O: operations are submitted to a shared ring and their
//! results are reaped by one or more dispatch loops.

mod queue;

pub use queue::{CompletionEvent, CompletionQueue, QueueError, DEFAULT_RING_ENTRIES};
