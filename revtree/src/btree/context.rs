//! Scratch space for a single write operation.
//!
//! A `QueryContext` collects every node an insert, delete or modify touches:
//! - an arena of loaded and created nodes keyed by id
//! - the root-to-current path recorded during descent
//! - the sets of new, dirty and deleted node ids
//!
//! Nothing reaches the backing store before `commit()`. Dropping the
//! context instead leaves storage exactly as it was.
//!
//! # Ownership
//!
//! A node may only be mutated once it belongs to the context's revision.
//! The `modify_*` methods are the single gate for this: they fork foreign
//! nodes, patch the new id into the parent's child slot and continue up the
//! recorded path to the root.

use std::collections::{BTreeSet, HashMap};

use crate::btree::node::Node;
use crate::btree::tree::TreeError;
use crate::ids::{NodeId, Revision};
use crate::payload::Payload;
use crate::storage::io::BTreeStorage;

/// One step of the recorded descent: `child_idx` is the child slot of
/// `node` that leads to the next level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEntry {
    pub node: NodeId,
    pub child_idx: usize,
}

pub struct QueryContext<P> {
    revision: Revision,
    /// Root the operation started from.
    base_root: Option<NodeId>,
    path: Vec<PathEntry>,
    nodes: HashMap<NodeId, Node<P>>,
    new_nodes: BTreeSet<NodeId>,
    dirty_nodes: BTreeSet<NodeId>,
    deleted_nodes: BTreeSet<NodeId>,
    new_root: Option<NodeId>,
    /// Entry removed from the tree by a delete or a key-changing modify.
    target_entry: Option<P>,
}

impl<P: Payload> QueryContext<P> {
    #[must_use]
    pub fn new(revision: Revision, base_root: Option<NodeId>) -> Self {
        Self {
            revision,
            base_root,
            path: Vec::new(),
            nodes: HashMap::new(),
            new_nodes: BTreeSet::new(),
            dirty_nodes: BTreeSet::new(),
            deleted_nodes: BTreeSet::new(),
            new_root: None,
            target_entry: None,
        }
    }

    #[must_use]
    pub const fn revision(&self) -> Revision {
        self.revision
    }

    /// Root of the tree as seen by this operation so far.
    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        self.new_root.or(self.base_root)
    }

    // ========== Arena ==========

    /// Make sure a node is present in the arena, loading it if needed.
    pub async fn load<S: BTreeStorage<P>>(
        &mut self,
        storage: &S,
        id: NodeId,
    ) -> Result<&Node<P>, TreeError> {
        if !self.nodes.contains_key(&id) {
            let node = storage
                .get_node(id)
                .await?
                .ok_or(TreeError::MissingNode(id))?;
            self.nodes.insert(id, node);
        }
        Ok(self.node(id))
    }

    /// Get a node from the arena.
    ///
    /// # Panics
    /// Panics if the node was never loaded into this context.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node<P> {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("node {id} is not loaded"))
    }

    /// Get a node for mutation. Only nodes passed through the ownership
    /// gate (or created by this context) may be mutated.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<P> {
        debug_assert!(
            self.new_nodes.contains(&id) || self.dirty_nodes.contains(&id),
            "node {id} mutated without ownership"
        );
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("node {id} is not loaded"))
    }

    /// Remove a node from the arena, e.g. to split it by value.
    pub fn take(&mut self, id: NodeId) -> Node<P> {
        self.nodes
            .remove(&id)
            .unwrap_or_else(|| panic!("node {id} is not loaded"))
    }

    /// Register a freshly created node.
    pub fn add_new(&mut self, node: Node<P>) -> NodeId {
        let id = node.id();
        debug_assert_eq!(node.revision(), self.revision);
        self.new_nodes.insert(id);
        self.nodes.insert(id, node);
        id
    }

    /// Register the left half of a split of the node `old_id`.
    ///
    /// The half either kept the old identity (same revision) or is new.
    pub fn put_split_left(&mut self, old_id: NodeId, left: Node<P>) -> NodeId {
        let id = left.id();
        if id != old_id {
            return self.add_new(left);
        }
        if !self.new_nodes.contains(&id) {
            self.dirty_nodes.insert(id);
        }
        self.nodes.insert(id, left);
        id
    }

    /// Register a freshly created node as the new tree root.
    pub fn set_new_root(&mut self, node: Node<P>) -> NodeId {
        let id = self.add_new(node);
        self.new_root = Some(id);
        id
    }

    /// Make an already registered node the tree root.
    pub fn set_root(&mut self, id: NodeId) {
        debug_assert!(self.path.is_empty());
        self.new_root = Some(id);
    }

    /// Drop a node from the tree.
    ///
    /// Nodes created by this context are simply forgotten, nodes of this
    /// revision are queued for removal, and nodes of other revisions are
    /// left alone for the snapshots that still reference them.
    pub fn discard(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            self.retire(&node);
        }
    }

    fn retire(&mut self, node: &Node<P>) {
        let id = node.id();
        if self.new_nodes.remove(&id) {
            return;
        }
        if node.revision() == self.revision {
            self.dirty_nodes.remove(&id);
            self.deleted_nodes.insert(id);
        }
    }

    // ========== Path ==========

    #[must_use]
    pub fn path(&self) -> &[PathEntry] {
        &self.path
    }

    pub fn push(&mut self, entry: PathEntry) {
        self.path.push(entry);
    }

    pub fn pop(&mut self) -> Option<PathEntry> {
        self.path.pop()
    }

    pub fn clear_path(&mut self) {
        self.path.clear();
    }

    /// Point the deepest path entry at another child slot.
    pub fn set_top_child_idx(&mut self, child_idx: usize) {
        if let Some(top) = self.path.last_mut() {
            top.child_idx = child_idx;
        }
    }

    pub fn set_target_entry(&mut self, entry: P) {
        self.target_entry = Some(entry);
    }

    pub const fn take_target_entry(&mut self) -> Option<P> {
        self.target_entry.take()
    }

    // ========== Ownership gate ==========

    /// Take ownership of the child of the deepest path entry (the root if
    /// the path is empty). Returns the id under which the node can now be
    /// mutated.
    pub fn modify_child(&mut self, id: NodeId) -> NodeId {
        let parent = self
            .path
            .len()
            .checked_sub(1)
            .map(|level| (level, self.path[level].child_idx));
        self.modify_chain(id, parent)
    }

    /// Take ownership of the child in slot `slot` of the deepest path entry.
    pub fn modify_sibling(&mut self, id: NodeId, slot: usize) -> NodeId {
        let level = self
            .path
            .len()
            .checked_sub(1)
            .unwrap_or_else(|| panic!("sibling {id} of the root"));
        self.modify_chain(id, Some((level, slot)))
    }

    /// Take ownership of the path entry at `level`.
    pub fn modify_path(&mut self, level: usize) -> NodeId {
        let id = self.path[level].node;
        let parent = level
            .checked_sub(1)
            .map(|parent| (parent, self.path[parent].child_idx));
        let new_id = self.modify_chain(id, parent);
        self.path[level].node = new_id;
        new_id
    }

    /// Own `id`, then fold up the path from `parent` to the root, owning
    /// every ancestor and patching each one's child slot when the child
    /// below it was forked. Every ancestor ends up new or dirty so its
    /// subtree total is recomputed at commit.
    fn modify_chain(&mut self, id: NodeId, parent: Option<(usize, usize)>) -> NodeId {
        let new_id = self.own(id);
        let mut child = (id, new_id);
        let mut next = parent;

        while let Some((level, slot)) = next {
            let old_parent = self.path[level].node;
            let new_parent = self.own(old_parent);
            if child.0 != child.1 {
                self.node_mut(new_parent).set_child(slot, child.1);
            }
            self.path[level].node = new_parent;
            child = (old_parent, new_parent);
            next = level
                .checked_sub(1)
                .map(|level| (level, self.path[level].child_idx));
        }

        // The topmost node of the chain is the root.
        if child.0 != child.1 {
            self.new_root = Some(child.1);
        }
        new_id
    }

    /// Copy-on-write barrier for a single node.
    fn own(&mut self, id: NodeId) -> NodeId {
        let node = self.node(id);
        if node.revision() == self.revision {
            if !self.new_nodes.contains(&id) {
                self.dirty_nodes.insert(id);
            }
            return id;
        }

        let forked = node.fork(self.revision);
        let new_id = forked.id();
        tracing::trace!("forked {id} into {new_id} at revision {}", self.revision);
        self.nodes.remove(&id);
        self.add_new(forked)
    }

    // ========== Structural helpers ==========

    /// Rotate an entry from `left` into `right` through `parent`.
    pub fn rotate_right(&mut self, parent: NodeId, median_idx: usize, left: NodeId, right: NodeId) {
        let mut left_node = self.take(left);
        let mut right_node = self.take(right);
        self.node_mut(parent)
            .rotate_right(median_idx, &mut left_node, &mut right_node);
        self.nodes.insert(left, left_node);
        self.nodes.insert(right, right_node);
    }

    /// Rotate an entry from `right` into `left` through `parent`.
    pub fn rotate_left(&mut self, parent: NodeId, median_idx: usize, left: NodeId, right: NodeId) {
        let mut left_node = self.take(left);
        let mut right_node = self.take(right);
        self.node_mut(parent)
            .rotate_left(median_idx, &mut left_node, &mut right_node);
        self.nodes.insert(left, left_node);
        self.nodes.insert(right, right_node);
    }

    /// Merge two adjacent children of `parent` into a new node, retiring
    /// both sources. Returns the id of the merged node.
    pub fn merge(&mut self, parent: NodeId, median_idx: usize, left: NodeId, right: NodeId) -> NodeId {
        let mut left_node = self.take(left);
        let mut right_node = self.take(right);
        let merged = self
            .node_mut(parent)
            .merge(median_idx, &mut left_node, &mut right_node);
        self.retire(&left_node);
        self.retire(&right_node);
        self.add_new(merged)
    }

    // ========== Commit ==========

    /// Write all staged changes: deletions first, then new nodes, then
    /// modified nodes. Returns the new root if it changed.
    ///
    /// A failure in the middle of the writes is not rolled back.
    pub async fn commit<S: BTreeStorage<P>>(
        mut self,
        storage: &S,
    ) -> Result<Option<NodeId>, TreeError> {
        self.update_totals(storage).await?;

        for id in &self.deleted_nodes {
            storage.remove_node(*id).await?;
        }
        for id in &self.new_nodes {
            storage.store_node(self.node(*id)).await?;
        }
        for id in &self.dirty_nodes {
            storage.store_node(self.node(*id)).await?;
        }

        tracing::debug!(
            "committed revision {}: {} new, {} dirty, {} deleted, root {:?}",
            self.revision,
            self.new_nodes.len(),
            self.dirty_nodes.len(),
            self.deleted_nodes.len(),
            self.new_root
        );
        Ok(self.new_root)
    }

    /// Recompute `total_count` of every new and dirty node, children first.
    async fn update_totals<S: BTreeStorage<P>>(&mut self, storage: &S) -> Result<(), TreeError> {
        let pending: Vec<NodeId> = self
            .new_nodes
            .iter()
            .chain(self.dirty_nodes.iter())
            .copied()
            .collect();
        let mut totals: HashMap<NodeId, u64> = HashMap::with_capacity(pending.len());

        for start in pending {
            // (node, children already scheduled)
            let mut stack = vec![(start, false)];
            while let Some((id, expanded)) = stack.pop() {
                if totals.contains_key(&id) {
                    continue;
                }
                let node = self.node(id);
                let own_entries = node.len() as u64;
                let Some(children) = node.children().map(<[NodeId]>::to_vec) else {
                    totals.insert(id, own_entries);
                    continue;
                };

                if !expanded {
                    stack.push((id, true));
                    for child in children {
                        if self.is_pending(child) && !totals.contains_key(&child) {
                            stack.push((child, false));
                        }
                    }
                    continue;
                }

                let mut total = own_entries;
                for child in children {
                    total += match totals.get(&child) {
                        Some(count) => *count,
                        None => self.clean_total(storage, child).await?,
                    };
                }
                totals.insert(id, total);
            }
        }

        for (id, total) in totals {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.set_total_count(total);
            }
        }
        Ok(())
    }

    fn is_pending(&self, id: NodeId) -> bool {
        self.new_nodes.contains(&id) || self.dirty_nodes.contains(&id)
    }

    /// Subtree total of a node this operation did not change.
    async fn clean_total<S: BTreeStorage<P>>(&self, storage: &S, id: NodeId) -> Result<u64, TreeError> {
        if let Some(node) = self.nodes.get(&id) {
            return Ok(node.header().total_count);
        }
        storage
            .get_node_header(id)
            .await?
            .map(|header| header.total_count)
            .ok_or(TreeError::MissingNode(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::TestEntry;

    fn leaf(revision: Revision, keys: &[i64]) -> Node<TestEntry> {
        let mut node = Node::new_leaf(revision);
        for (idx, key) in keys.iter().enumerate() {
            node.insert_entry(idx, TestEntry::new(*key));
        }
        node
    }

    /// Store a two-level tree `[left] 10 [right]` under `revision`.
    async fn two_level(
        storage: &MemoryStorage<TestEntry>,
        revision: Revision,
    ) -> (NodeId, NodeId, NodeId) {
        let mut left = leaf(revision, &[1, 2, 3]);
        let mut right = leaf(revision, &[11, 12, 13]);
        left.set_total_count(3);
        right.set_total_count(3);
        let mut root = Node::new_internal(revision, left.id(), TestEntry::new(10), right.id());
        root.set_total_count(7);
        storage.store_node(&left).await.unwrap();
        storage.store_node(&right).await.unwrap();
        storage.store_node(&root).await.unwrap();
        (root.id(), left.id(), right.id())
    }

    #[tokio::test]
    async fn test_modify_child_forks_path() {
        let storage = MemoryStorage::new(1);
        let (root, left, right) = two_level(&storage, Revision(1)).await;

        let mut ctx = QueryContext::new(Revision(2), Some(root));
        ctx.load(&storage, root).await.unwrap();
        ctx.push(PathEntry {
            node: root,
            child_idx: 0,
        });
        ctx.load(&storage, left).await.unwrap();
        let owned = ctx.modify_child(left);

        assert_ne!(owned, left);
        let new_root = ctx.path()[0].node;
        assert_ne!(new_root, root);
        assert_eq!(ctx.root(), Some(new_root));
        assert_eq!(ctx.node(new_root).child(0), owned);
        assert_eq!(ctx.node(new_root).child(1), right);
        assert_eq!(ctx.node(owned).header().prev_version, Some(left));
    }

    #[tokio::test]
    async fn test_modify_same_revision_marks_dirty() {
        let storage = MemoryStorage::new(1);
        let (root, left, _) = two_level(&storage, Revision(3)).await;

        let mut ctx = QueryContext::new(Revision(3), Some(root));
        ctx.load(&storage, root).await.unwrap();
        ctx.push(PathEntry {
            node: root,
            child_idx: 0,
        });
        ctx.load(&storage, left).await.unwrap();
        assert_eq!(ctx.modify_child(left), left);
        assert_eq!(ctx.path()[0].node, root);
        assert_eq!(ctx.root(), Some(root));

        // Both the leaf and its ancestor are rewritten.
        ctx.node_mut(left).insert_entry(3, TestEntry::new(4));
        let new_root = ctx.commit(&storage).await.unwrap();
        assert_eq!(new_root, None);
        assert_eq!(storage.stats().writes, 3 + 2);
        let header = storage.get_node_header(root).await.unwrap().unwrap();
        assert_eq!(header.total_count, 8);
    }

    #[tokio::test]
    async fn test_discard_by_revision() {
        let revision = Revision(5);
        let storage = MemoryStorage::new(1);
        let (root, left, right) = two_level(&storage, Revision(4)).await;

        let mut ctx = QueryContext::new(revision, Some(root));
        for id in [root, left, right] {
            ctx.load(&storage, id).await.unwrap();
        }
        let fresh = ctx.add_new(leaf(revision, &[]));

        // Foreign and fresh nodes never reach storage.
        ctx.discard(left);
        ctx.discard(fresh);
        ctx.commit(&storage).await.unwrap();
        assert!(storage.contains(left));
        assert!(!storage.contains(fresh));
        assert_eq!(storage.stats().removes, 0);
    }

    #[tokio::test]
    async fn test_dropped_context_has_no_effect() {
        let storage = MemoryStorage::new(1);
        let (root, left, _) = two_level(&storage, Revision(1)).await;
        let before = storage.checksums();

        let mut ctx = QueryContext::new(Revision(2), Some(root));
        ctx.load(&storage, root).await.unwrap();
        ctx.push(PathEntry {
            node: root,
            child_idx: 0,
        });
        ctx.load(&storage, left).await.unwrap();
        let owned = ctx.modify_child(left);
        ctx.node_mut(owned).remove_entry(0);
        drop(ctx);

        assert_eq!(storage.checksums(), before);
    }

    #[tokio::test]
    async fn test_missing_node() {
        let storage = MemoryStorage::<TestEntry>::new(1);
        let mut ctx = QueryContext::new(Revision(1), None);
        let result = ctx.load(&storage, NodeId(424_242)).await;
        assert!(matches!(result, Err(TreeError::MissingNode(NodeId(424_242)))));
    }
}
