//! The copy-on-write B-tree: nodes, per-operation context, tree operations
//! and cursors.

pub mod context;
pub mod cursor;
pub mod node;
pub mod tree;

pub use cursor::Cursor;
pub use node::{Node, NodeHeader, NodeKind};
pub use tree::{BTree, ModifyResult, TreeError};
