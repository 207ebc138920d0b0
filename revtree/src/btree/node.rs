//! B-tree node types and structural operations.
//!
//! Leaf and internal nodes share one header and one entry vector; only
//! internal nodes carry child identifiers:
//! - Leaf nodes: `n` entries
//! - Internal nodes: `n` entries and `n + 1` child node ids
//!
//! Entries live at whatever level they were inserted, so internal nodes hold
//! real payloads, not just separator keys.
//!
//! `Child[i]` contains keys < `Entry[i]`, `Child[i+1]` contains keys > `Entry[i]`.

use crate::ids::{NodeId, Revision};
use crate::payload::Payload;

/// Metadata shared by every node, loadable without the node body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub id: NodeId,
    /// Revision of the write that created or forked this node version.
    pub revision: Revision,
    /// Id of the previous version of this node if it was forked.
    pub prev_version: Option<NodeId>,
    /// Number of entries in this node.
    pub num_entries: usize,
    /// Number of entries in this node and all its descendants. Recomputed
    /// for every new or modified node during commit.
    pub total_count: u64,
}

/// Leaf/internal discriminant. Only internal nodes have children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal {
        /// Child node ids. `children.len()` == `entries.len()` + 1
        children: Vec<NodeId>,
    },
}

/// A B-tree node.
#[derive(Debug, Clone)]
pub struct Node<P> {
    header: NodeHeader,
    /// Entries in strictly ascending key order.
    entries: Vec<P>,
    kind: NodeKind,
}

/// Result of splitting a full node.
#[derive(Debug)]
pub struct Split<P> {
    pub left: Node<P>,
    pub right: Node<P>,
    /// Entry promoted into the parent between `left` and `right`.
    pub median: P,
}

impl<P: Payload> Node<P> {
    /// Create a new empty leaf node.
    #[must_use]
    pub fn new_leaf(revision: Revision) -> Self {
        Self::from_parts(revision, Vec::new(), NodeKind::Leaf)
    }

    /// Create an internal node with a single entry and two children.
    ///
    /// Used when the root splits and the tree grows by one level.
    #[must_use]
    pub fn new_internal(revision: Revision, left: NodeId, median: P, right: NodeId) -> Self {
        Self::from_parts(
            revision,
            vec![median],
            NodeKind::Internal {
                children: vec![left, right],
            },
        )
    }

    fn from_parts(revision: Revision, entries: Vec<P>, kind: NodeKind) -> Self {
        let mut node = Self {
            header: NodeHeader {
                id: NodeId::generate(),
                revision,
                prev_version: None,
                num_entries: 0,
                total_count: 0,
            },
            entries,
            kind,
        };
        node.sync_len();
        node
    }

    #[allow(clippy::missing_const_for_fn)] // Vec::len() through &mut is not const-stable
    fn sync_len(&mut self) {
        self.header.num_entries = self.entries.len();
    }

    #[must_use]
    pub const fn header(&self) -> &NodeHeader {
        &self.header
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.header.id
    }

    #[must_use]
    pub const fn revision(&self) -> Revision {
        self.header.revision
    }

    /// Set the subtree aggregate computed during commit.
    pub const fn set_total_count(&mut self, total_count: u64) {
        self.header.total_count = total_count;
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    /// Number of entries in this node.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[P] {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, idx: usize) -> &P {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut P {
        &mut self.entries[idx]
    }

    /// Replace the entry at `idx`, returning the previous one.
    pub fn set_entry(&mut self, idx: usize, entry: P) -> P {
        std::mem::replace(&mut self.entries[idx], entry)
    }

    /// Child ids, `None` for a leaf.
    #[must_use]
    pub fn children(&self) -> Option<&[NodeId]> {
        match &self.kind {
            NodeKind::Leaf => None,
            NodeKind::Internal { children } => Some(children),
        }
    }

    /// Get the child id at `idx`.
    ///
    /// # Panics
    /// Panics if the node is a leaf or `idx > len()`.
    #[must_use]
    pub fn child(&self, idx: usize) -> NodeId {
        match &self.kind {
            NodeKind::Leaf => panic!("leaf node {} has no children", self.header.id),
            NodeKind::Internal { children } => children[idx],
        }
    }

    pub fn set_child(&mut self, idx: usize, child: NodeId) {
        self.children_mut()[idx] = child;
    }

    fn children_mut(&mut self) -> &mut Vec<NodeId> {
        match &mut self.kind {
            NodeKind::Leaf => panic!("leaf node {} has no children", self.header.id),
            NodeKind::Internal { children } => children,
        }
    }

    /// Find position for the specified key.
    ///
    /// Returns the index of the exact match, or of the first entry whose key
    /// is greater. When every entry is smaller the result is `len()`, which
    /// for an internal node is also the child index to descend into.
    /// The result is never less than `start`.
    #[must_use]
    pub fn find(&self, key: &P::Key, start: usize) -> usize {
        assert!(start <= self.entries.len(), "search start past node end");
        match self.entries[start..].binary_search_by(|e| e.key().cmp(key)) {
            Ok(i) | Err(i) => start + i,
        }
    }

    /// Check whether the entry at `idx` exists and has exactly `key`.
    #[must_use]
    pub fn matches(&self, idx: usize, key: &P::Key) -> bool {
        self.entries.get(idx).is_some_and(|e| e.key() == *key)
    }

    /// Insert an entry into a leaf at a position obtained from `find()`.
    pub fn insert_entry(&mut self, idx: usize, entry: P) {
        assert!(self.is_leaf(), "entries are only inserted into leaves");
        self.entries.insert(idx, entry);
        self.sync_len();
    }

    /// Remove an entry from a leaf.
    pub fn remove_entry(&mut self, idx: usize) -> P {
        assert!(self.is_leaf(), "entries are only removed from leaves");
        let entry = self.entries.remove(idx);
        self.sync_len();
        entry
    }

    /// Absorb a child split: the median goes to `child_idx`, and the two
    /// halves take the child slots `child_idx` and `child_idx + 1`.
    pub fn insert_split(&mut self, child_idx: usize, median: P, left: NodeId, right: NodeId) {
        assert!(child_idx <= self.entries.len());
        self.entries.insert(child_idx, median);
        let children = self.children_mut();
        children[child_idx] = left;
        children.insert(child_idx + 1, right);
        self.sync_len();
    }

    /// Split a full node around `order / 2 - 1`.
    ///
    /// The left half keeps this node's identity when the node already
    /// belongs to `revision`; otherwise both halves are new nodes and this
    /// version is left for older revisions.
    #[must_use]
    pub fn split(mut self, revision: Revision, order: usize) -> Split<P> {
        assert_eq!(self.entries.len(), order - 1, "only a full node is split");
        let median_idx = order / 2 - 1;

        let right_entries = self.entries.split_off(median_idx + 1);
        let Some(median) = self.entries.pop() else {
            unreachable!("full node has a median entry");
        };
        let right_kind = match &mut self.kind {
            NodeKind::Leaf => NodeKind::Leaf,
            NodeKind::Internal { children } => NodeKind::Internal {
                children: children.split_off(median_idx + 1),
            },
        };
        let right = Self::from_parts(revision, right_entries, right_kind);

        let left = if self.header.revision == revision {
            self.sync_len();
            self
        } else {
            Self::from_parts(revision, self.entries, self.kind)
        };

        tracing::trace!(
            "split into {} and {} at revision {revision}",
            left.id(),
            right.id()
        );

        Split {
            left,
            right,
            median,
        }
    }

    /// Rotate one entry right around the median at `median_idx`: the last
    /// entry (and child) of `left` moves up, the median moves to the front
    /// of `right`.
    pub fn rotate_right(&mut self, median_idx: usize, left: &mut Self, right: &mut Self) {
        assert!(!self.is_leaf(), "rotation happens around a parent entry");
        let Some(moved) = left.entries.pop() else {
            unreachable!("rotation source {} is empty", left.id());
        };
        let median = std::mem::replace(&mut self.entries[median_idx], moved);
        right.entries.insert(0, median);
        match (&mut left.kind, &mut right.kind) {
            (NodeKind::Leaf, NodeKind::Leaf) => {}
            (NodeKind::Internal { children: from }, NodeKind::Internal { children: to }) => {
                let Some(child) = from.pop() else {
                    unreachable!("internal node without children");
                };
                to.insert(0, child);
            }
            _ => unreachable!("siblings must be on the same level"),
        }
        left.sync_len();
        right.sync_len();
    }

    /// Rotate one entry left around the median at `median_idx`: the first
    /// entry (and child) of `right` moves up, the median moves to the end
    /// of `left`.
    pub fn rotate_left(&mut self, median_idx: usize, left: &mut Self, right: &mut Self) {
        assert!(!self.is_leaf(), "rotation happens around a parent entry");
        assert!(!right.entries.is_empty(), "rotation source is empty");
        let moved = right.entries.remove(0);
        let median = std::mem::replace(&mut self.entries[median_idx], moved);
        left.entries.push(median);
        match (&mut left.kind, &mut right.kind) {
            (NodeKind::Leaf, NodeKind::Leaf) => {}
            (NodeKind::Internal { children: to }, NodeKind::Internal { children: from }) => {
                let child = from.remove(0);
                to.push(child);
            }
            _ => unreachable!("siblings must be on the same level"),
        }
        left.sync_len();
        right.sync_len();
    }

    /// Merge two adjacent children around the median at `median_idx`.
    ///
    /// The contents of `left` and `right` are moved into a new node, which
    /// takes the child slot `median_idx`; the median and the slot
    /// `median_idx + 1` are removed from this node. Both sources are left
    /// empty and should be discarded by the caller.
    #[must_use]
    pub fn merge(&mut self, median_idx: usize, left: &mut Self, right: &mut Self) -> Self {
        assert!(!self.is_leaf(), "merge happens around a parent entry");
        let median = self.entries.remove(median_idx);

        let mut entries = Vec::with_capacity(left.entries.len() + right.entries.len() + 1);
        entries.append(&mut left.entries);
        entries.push(median);
        entries.append(&mut right.entries);

        let kind = match (&mut left.kind, &mut right.kind) {
            (NodeKind::Leaf, NodeKind::Leaf) => NodeKind::Leaf,
            (NodeKind::Internal { children: l }, NodeKind::Internal { children: r }) => {
                let mut children = std::mem::take(l);
                children.append(r);
                NodeKind::Internal { children }
            }
            _ => unreachable!("siblings must be on the same level"),
        };
        let merged = Self::from_parts(self.header.revision, entries, kind);

        let children = self.children_mut();
        children[median_idx] = merged.id();
        children.remove(median_idx + 1);
        self.sync_len();
        left.sync_len();
        right.sync_len();

        tracing::trace!(
            "merged {} and {} into {}",
            left.id(),
            right.id(),
            merged.id()
        );
        merged
    }

    /// Copy-on-write barrier: clone this node under a new id and revision,
    /// remembering the id it was forked from.
    #[must_use]
    pub fn fork(&self, revision: Revision) -> Self {
        let mut node = self.clone();
        node.header.prev_version = Some(self.header.id);
        node.header.id = NodeId::generate();
        node.header.revision = revision;
        node
    }

    /// CRC32 over the node identity, entry digests and child ids.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.header.id.as_u64().to_le_bytes());
        hasher.update(&self.header.revision.as_u64().to_le_bytes());
        hasher.update(
            &self
                .header
                .prev_version
                .map_or(0, NodeId::as_u64)
                .to_le_bytes(),
        );
        hasher.update(&self.header.total_count.to_le_bytes());
        for entry in &self.entries {
            hasher.update(&entry.digest().to_le_bytes());
        }
        if let NodeKind::Internal { children } = &self.kind {
            for child in children {
                hasher.update(&child.as_u64().to_le_bytes());
            }
        }
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEntry;

    fn leaf_with(revision: Revision, keys: &[i64]) -> Node<TestEntry> {
        let mut node = Node::new_leaf(revision);
        for (idx, key) in keys.iter().enumerate() {
            node.insert_entry(idx, TestEntry::new(*key));
        }
        node
    }

    fn keys(node: &Node<TestEntry>) -> Vec<i64> {
        node.entries().iter().map(|e| e.key).collect()
    }

    fn internal_with(
        revision: Revision,
        keys: &[i64],
        children: &[NodeId],
    ) -> Node<TestEntry> {
        Node::from_parts(
            revision,
            keys.iter().map(|k| TestEntry::new(*k)).collect(),
            NodeKind::Internal {
                children: children.to_vec(),
            },
        )
    }

    #[test]
    fn test_find() {
        let node = leaf_with(Revision(1), &[10, 20, 30]);
        assert_eq!(node.find(&5, 0), 0);
        assert_eq!(node.find(&10, 0), 0);
        assert_eq!(node.find(&15, 0), 1);
        assert_eq!(node.find(&30, 0), 2);
        assert_eq!(node.find(&35, 0), 3);
        // Never returns less than the start index
        assert_eq!(node.find(&5, 2), 2);
        assert!(node.matches(1, &20));
        assert!(!node.matches(1, &21));
        assert!(!node.matches(3, &30));
    }

    #[test]
    fn test_leaf_insert_remove() {
        let mut node = leaf_with(Revision(1), &[10, 30]);
        let idx = node.find(&20, 0);
        node.insert_entry(idx, TestEntry::new(20));
        assert_eq!(keys(&node), vec![10, 20, 30]);
        assert_eq!(node.header().num_entries, 3);

        let removed = node.remove_entry(0);
        assert_eq!(removed.key, 10);
        assert_eq!(keys(&node), vec![20, 30]);
        assert_eq!(node.header().num_entries, 2);
    }

    #[test]
    fn test_split_same_revision_reuses_left() {
        let revision = Revision(1);
        let node = leaf_with(revision, &[1, 2, 3, 4, 5]);
        let id = node.id();

        let split = node.split(revision, 6);
        assert_eq!(split.left.id(), id);
        assert_ne!(split.right.id(), id);
        assert_eq!(keys(&split.left), vec![1, 2]);
        assert_eq!(split.median.key, 3);
        assert_eq!(keys(&split.right), vec![4, 5]);
    }

    #[test]
    fn test_split_other_revision_allocates_both() {
        let node = leaf_with(Revision(1), &[1, 2, 3, 4, 5, 6]);
        let id = node.id();

        let split = node.split(Revision(2), 7);
        assert_ne!(split.left.id(), id);
        assert_ne!(split.right.id(), id);
        assert_eq!(split.left.revision(), Revision(2));
        assert_eq!(split.right.revision(), Revision(2));
        assert_eq!(keys(&split.left), vec![1, 2]);
        assert_eq!(split.median.key, 3);
        assert_eq!(keys(&split.right), vec![4, 5, 6]);
    }

    #[test]
    fn test_split_internal_partitions_children() {
        let children: Vec<NodeId> = (0..6).map(NodeId).collect();
        let node = internal_with(Revision(1), &[10, 20, 30, 40, 50], &children);

        let split = node.split(Revision(1), 6);
        assert_eq!(split.left.children(), Some(&children[..3]));
        assert_eq!(split.right.children(), Some(&children[3..]));
        assert_eq!(split.median.key, 30);
    }

    #[test]
    fn test_insert_split() {
        let mut parent = internal_with(Revision(1), &[10, 50], &[NodeId(1), NodeId(2), NodeId(3)]);
        parent.insert_split(1, TestEntry::new(30), NodeId(20), NodeId(21));
        assert_eq!(keys(&parent), vec![10, 30, 50]);
        assert_eq!(
            parent.children(),
            Some(&[NodeId(1), NodeId(20), NodeId(21), NodeId(3)][..])
        );
    }

    #[test]
    fn test_rotate_right_leaves() {
        let revision = Revision(1);
        let mut left = leaf_with(revision, &[1, 2, 3]);
        let mut right = leaf_with(revision, &[6]);
        let mut parent = internal_with(revision, &[5], &[left.id(), right.id()]);

        parent.rotate_right(0, &mut left, &mut right);
        assert_eq!(keys(&left), vec![1, 2]);
        assert_eq!(keys(&parent), vec![3]);
        assert_eq!(keys(&right), vec![5, 6]);
    }

    #[test]
    fn test_rotate_left_internal_moves_child() {
        let revision = Revision(1);
        let mut left = internal_with(revision, &[2], &[NodeId(1), NodeId(2)]);
        let mut right = internal_with(revision, &[8, 9], &[NodeId(3), NodeId(4), NodeId(5)]);
        let mut parent = internal_with(revision, &[5], &[left.id(), right.id()]);

        parent.rotate_left(0, &mut left, &mut right);
        assert_eq!(keys(&left), vec![2, 5]);
        assert_eq!(left.children(), Some(&[NodeId(1), NodeId(2), NodeId(3)][..]));
        assert_eq!(keys(&parent), vec![8]);
        assert_eq!(keys(&right), vec![9]);
        assert_eq!(right.children(), Some(&[NodeId(4), NodeId(5)][..]));
    }

    #[test]
    fn test_merge() {
        let revision = Revision(1);
        let mut left = leaf_with(revision, &[1, 2]);
        let mut right = leaf_with(revision, &[6]);
        let mut parent = internal_with(revision, &[5, 10], &[left.id(), right.id(), NodeId(99)]);

        let merged = parent.merge(0, &mut left, &mut right);
        assert_eq!(keys(&merged), vec![1, 2, 5, 6]);
        assert!(merged.is_leaf());
        assert_eq!(keys(&parent), vec![10]);
        assert_eq!(parent.children(), Some(&[merged.id(), NodeId(99)][..]));
        assert!(left.is_empty());
        assert!(right.is_empty());
    }

    #[test]
    fn test_fork() {
        let node = leaf_with(Revision(1), &[1, 2]);
        let forked = node.fork(Revision(2));
        assert_ne!(forked.id(), node.id());
        assert_eq!(forked.header().prev_version, Some(node.id()));
        assert_eq!(forked.revision(), Revision(2));
        assert_eq!(keys(&forked), keys(&node));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut node = leaf_with(Revision(1), &[1, 2]);
        let clone = node.clone();
        assert_eq!(node.checksum(), clone.checksum());

        node.entry_mut(0).value = 99;
        assert_ne!(node.checksum(), clone.checksum());
    }
}
