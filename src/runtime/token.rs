//! Operation token tracking for completion correlation.
//!
//! Each submitted operation gets a unique token (io_uring `user_data`) that
//! identifies the operation kind and the correlation key of its owner when the
//! completion arrives. The kernel only ever sees these integers, never a
//! pointer to a connection.

use slab::Slab;
use std::fmt;

/// Opaque key routing completions back to their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(u64);

impl CorrelationKey {
    /// Key reserved for the accept listener.
    pub const LISTENER: CorrelationKey = CorrelationKey(u64::MAX);
    /// Key reserved for synthetic wake-ups.
    pub const WAKE: CorrelationKey = CorrelationKey(u64::MAX - 1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// True for keys that can belong to a connection.
    pub fn is_connection(self) -> bool {
        self != Self::LISTENER && self != Self::WAKE
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LISTENER => f.write_str("listener"),
            Self::WAKE => f.write_str("wake"),
            Self(raw) => write!(f, "{raw}"),
        }
    }
}

/// Kind of a completed operation as reported to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Accept,
    Receive,
    Send,
    /// Synthetic completion injected with `post_synthetic`.
    Posted,
}

/// An in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpType {
    /// Socket operation submitted on behalf of `key`.
    Io { key: CorrelationKey, kind: OpKind },
    /// Synthetic completion; reported with the caller's values.
    Posted {
        key: CorrelationKey,
        bytes: u32,
        token: u64,
    },
    /// Cancellation request; never surfaced to callers.
    Cancel,
}

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to efficiently allocate and deallocate tokens,
/// providing stable identifiers for in-flight operations.
pub(crate) struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a new token for an operation.
    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Free a token, returning the operation that was associated with it.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocator() {
        let mut alloc = TokenAllocator::new(16);
        let key = CorrelationKey::new(3);

        let t1 = alloc.alloc(OpType::Io {
            key: CorrelationKey::LISTENER,
            kind: OpKind::Accept,
        });
        let t2 = alloc.alloc(OpType::Io {
            key,
            kind: OpKind::Receive,
        });

        assert_eq!(alloc.len(), 2);

        assert!(alloc.free(t1).is_some());
        assert!(alloc.free(t1).is_none());
        assert_eq!(alloc.len(), 1);

        // Slab reuses the freed slot.
        let t3 = alloc.alloc(OpType::Cancel);
        assert_eq!(t3, t1);

        assert_eq!(
            alloc.free(t2),
            Some(OpType::Io {
                key,
                kind: OpKind::Receive
            })
        );
    }

    #[test]
    fn test_reserved_keys() {
        assert!(!CorrelationKey::LISTENER.is_connection());
        assert!(!CorrelationKey::WAKE.is_connection());
        assert!(CorrelationKey::new(0).is_connection());
        assert_eq!(CorrelationKey::LISTENER.to_string(), "listener");
        assert_eq!(CorrelationKey::new(12).to_string(), "12");
    }
}
