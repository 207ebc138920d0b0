// Test code is allowed to use unwrap() and expect() for convenience.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! An ordered, versioned index: a copy-on-write B-tree whose nodes live in
//! a pluggable asynchronous store.
//!
//! Each `BTree` handle writes under one `Revision`. Nodes belonging to any
//! other revision are forked before they are changed, so the root id of an
//! earlier revision stays a valid, unchanged snapshot that shares every
//! untouched subtree with later ones.
//!
//! Components, leaves first:
//!  - `btree::node`: node layout and split/merge/rotate primitives
//!  - `btree::context`: staged changes of one write, committed atomically
//!  - `btree::tree`: find/insert/delete/modify
//!  - `btree::cursor`: ordered traversal without parent links
//!  - `storage`: the backend trait and an in-memory backend
//!  - `invariants`: structural checks over a snapshot

pub mod btree;
pub mod config;
pub mod ids;
pub mod invariants;
pub mod payload;
pub mod storage;

mod e2e_tests;
#[cfg(test)]
mod testing;

pub use btree::{BTree, Cursor, ModifyResult, Node, NodeHeader, TreeError};
pub use config::{ConfigError, TreeConfig, WorkloadConfig};
pub use ids::{NodeId, Revision};
pub use invariants::{InvariantChecker, InvariantReport, InvariantViolation, TreeStats};
pub use payload::Payload;
pub use storage::{BTreeStorage, FaultConfig, MemoryStorage, StorageError};
