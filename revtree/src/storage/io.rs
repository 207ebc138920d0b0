//! Storage abstraction for tree nodes.
//!
//! The tree never holds links between nodes; children are referenced by
//! `NodeId` and resolved through a `BTreeStorage`. This lets the same tree
//! code run over the in-memory backend used by tests and the demo binary,
//! or over any persistent backend a caller provides.
//!
//! All operations are asynchronous and may fail. Backends must be safe to
//! share between concurrent readers.

use std::future::Future;

use crate::btree::node::{Node, NodeHeader};
use crate::ids::NodeId;
use crate::payload::Payload;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The requested node does not exist.
    NodeNotFound(NodeId),
    /// A stored node failed its integrity check.
    Corruption { id: NodeId },
    /// Injected fault for simulation.
    InjectedFault(String),
    /// Failure reported by the backing store.
    Backend(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "node {id} not found"),
            Self::Corruption { id } => write!(f, "corruption detected in node {id}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Asynchronous node store.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `get_node` returns the content last passed to `store_node` for that id
/// - `get_node_header` is consistent with `get_node`
/// - Missing nodes are reported as `Ok(None)`, not as errors
/// - `remove_node` of an id that was never stored is an error
pub trait BTreeStorage<P: Payload>: Send + Sync {
    /// Load only the header of a node.
    fn get_node_header(
        &self,
        id: NodeId,
    ) -> impl Future<Output = Result<Option<NodeHeader>, StorageError>> + Send;

    /// Load a full node.
    fn get_node(
        &self,
        id: NodeId,
    ) -> impl Future<Output = Result<Option<Node<P>>, StorageError>> + Send;

    /// Create or replace a node.
    fn store_node(&self, node: &Node<P>) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Delete a node.
    fn remove_node(&self, id: NodeId) -> impl Future<Output = Result<(), StorageError>> + Send;
}
