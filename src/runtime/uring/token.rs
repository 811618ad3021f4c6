//! Operation token tracking for io_uring completion correlation.
//!
//! Each submitted operation gets a token (its `user_data`) naming what the
//! operation was for. Tokens reference sessions by slab key only; the
//! session itself stays in the event loop's connection table.

use slab::Slab;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Accept on the listener socket.
    Accept,
    /// Receive into a session's read buffer.
    Recv {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
    /// Send of a session's outgoing record.
    Send {
        /// Connection identifier in the registry.
        conn_id: usize,
    },
    /// Read on the shutdown eventfd.
    Wake,
}

impl OpType {
    /// Session this operation belongs to, if any.
    pub fn conn_id(self) -> Option<usize> {
        match self {
            OpType::Recv { conn_id } | OpType::Send { conn_id } => Some(conn_id),
            OpType::Accept | OpType::Wake => None,
        }
    }
}

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to allocate and free tokens, providing stable identifiers
/// for in-flight operations.
pub struct TokenAllocator {
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

    /// Free a token, returning the operation it was tracking.
    ///
    /// Returns `None` if the token is unknown or already freed.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }

    /// Whether `token` is still in flight.
    pub fn contains(&self, token: u64) -> bool {
        self.ops.contains(token as usize)
    }

    /// Tokens of every operation still in flight.
    pub fn in_flight(&self) -> Vec<u64> {
        self.ops.iter().map(|(idx, _)| idx as u64).collect()
    }

    /// Number of operations in flight.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocator() {
        let mut tokens = TokenAllocator::new(16);

        let t1 = tokens.alloc(OpType::Accept);
        let t2 = tokens.alloc(OpType::Recv { conn_id: 1 });
        assert_eq!(tokens.len(), 2);

        assert!(tokens.contains(t2));
        assert_eq!(tokens.free(t2), Some(OpType::Recv { conn_id: 1 }));
        assert!(!tokens.contains(t2));
        assert_eq!(tokens.free(t2), None);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.in_flight(), vec![t1]);

        // Slab reuses the freed slot
        let t3 = tokens.alloc(OpType::Send { conn_id: 1 });
        assert_eq!(t3, t2);

        tokens.free(t1);
        tokens.free(t3);
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_conn_id() {
        assert_eq!(OpType::Recv { conn_id: 3 }.conn_id(), Some(3));
        assert_eq!(OpType::Send { conn_id: 4 }.conn_id(), Some(4));
        assert_eq!(OpType::Accept.conn_id(), None);
        assert_eq!(OpType::Wake.conn_id(), None);
    }
}
