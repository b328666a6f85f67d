//! Completion-based networking runtime.
//!
//! - `BufferPool`: shared, injected buffer management
//! - `CorrelationKey` / tokens: operation tracking for completion correlation
//! - `CompletionQueue`: io_uring binding (Linux)
//! - `ConnectionContext`: per-connection receive and send cycles (Linux)
//! - `AcceptListener`: accept loop and dispatch threads (Linux)

mod buffer;
mod token;

pub use buffer::{BufferPool, PooledBuffer};
pub use token::{CorrelationKey, OpKind};

#[cfg(target_os = "linux")]
mod connection;
#[cfg(target_os = "linux")]
mod event;
#[cfg(target_os = "linux")]
mod listener;
#[cfg(target_os = "linux")]
mod uring;

#[cfg(target_os = "linux")]
pub use connection::{ConnState, ConnectionContext, ConnectionError, ConnectionRegistry};
#[cfg(target_os = "linux")]
pub use event::{ConnectionEvents, ListenerEvents, Subscribers};
#[cfg(target_os = "linux")]
pub use listener::{AcceptListener, ListenerConfig, ListenerError, ListenerState};
#[cfg(target_os = "linux")]
pub use uring::{CompletionEvent, CompletionQueue, QueueError, DEFAULT_RING_ENTRIES};
