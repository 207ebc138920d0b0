//! The caller-supplied payload contract.
//!
//! Payloads are stored directly in tree nodes, internal ones included.
//! The tree only needs three things from them: an ordered key, a deep
//! copy (used when a node is forked into a new revision), and a stable
//! 64-bit digest that feeds node checksums.

use std::fmt::Debug;

/// An entry stored in the tree.
///
/// # Invariants
///
/// - `key()` must be stable while the entry is inside the tree. A modify
///   callback that changes the key must report `ModifyResult::KeyChanged`.
/// - `clone()` must be a deep copy: a forked node never shares mutable
///   state with its predecessor.
pub trait Payload: Clone + Send + Sync + 'static {
    /// Totally ordered key type.
    type Key: Ord + Clone + Debug + Send + Sync;

    /// Extract the key of this entry.
    fn key(&self) -> Self::Key;

    /// Stable 64-bit digest of the entry content.
    fn digest(&self) -> u64;
}
