//! Identifier types for tree nodes and revisions.
//!
//! Both identifiers are plain 64-bit values drawn from process-wide
//! monotonic counters. Node identifiers are only ever generated by the
//! tree itself; storage backends treat them as opaque keys.
//!
//! # Invariants
//!
//! - Generated values are never zero.
//! - Two calls to `generate()` in one process never return the same value.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

/// Identifier of a tree node.
///
/// Children are referenced through these identifiers and resolved via the
/// backing storage, never through in-memory links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Allocate a fresh, process-unique node identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw identifier value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tag stamped on every node created or forked by one tree update.
///
/// A node whose revision equals the revision of the tree performing a write
/// may be mutated in place; any other node must be forked first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

impl Revision {
    /// Allocate a fresh, process-unique revision.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_REVISION.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw revision value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids_are_unique_and_increasing() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert!(b > a);
        assert_ne!(a.as_u64(), 0);
    }

    #[test]
    fn test_revisions_are_unique() {
        let a = Revision::generate();
        let b = Revision::generate();
        assert_ne!(a, b);
        assert_eq!(Revision::from(7).as_u64(), 7);
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeId(12).to_string(), "#12");
        assert_eq!(Revision(3).to_string(), "r3");
    }
}
