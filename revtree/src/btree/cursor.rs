//! Forward-only traversal over a tree snapshot.
//!
//! Nodes hold no parent links, so the cursor keeps the path from the root
//! to its current position as a stack of loaded nodes. It is always in one
//! of four states:
//! - Initial: nothing loaded yet
//! - In a leaf: `leaf` is set, `entry_idx` is the current entry
//! - At a median: no leaf, the top frame's `child_idx` names the current
//!   separator entry of an internal node
//! - End reached: terminal
//!
//! A cursor only reads from storage, so any number of them may run
//! concurrently as long as no writer is active on the tree.

use crate::btree::node::Node;
use crate::btree::tree::TreeError;
use crate::ids::NodeId;
use crate::payload::Payload;
use crate::storage::io::BTreeStorage;

/// An internal node on the cursor path.
#[derive(Debug)]
struct Frame<P> {
    node: Node<P>,
    /// Child being visited, which is also the index of the median that
    /// follows it.
    child_idx: usize,
}

pub struct Cursor<'a, S, P> {
    storage: &'a S,
    root: Option<NodeId>,
    path: Vec<Frame<P>>,
    leaf: Option<Node<P>>,
    entry_idx: usize,
    end_reached: bool,
}

impl<'a, S: BTreeStorage<P>, P: Payload> Cursor<'a, S, P> {
    pub(crate) const fn new(storage: &'a S, root: Option<NodeId>) -> Self {
        Self {
            storage,
            root,
            path: Vec::new(),
            leaf: None,
            entry_idx: 0,
            end_reached: false,
        }
    }

    /// Get the next entry in key order, `None` once the end is reached.
    pub async fn next(&mut self) -> Result<Option<P>, TreeError> {
        if self.end_reached {
            return Ok(None);
        }

        if self.is_initial() {
            if !self.load_root().await? {
                return Ok(None);
            }
            if self.leaf.is_none() {
                self.find_leaf().await?;
            }
            return Ok(self.leaf_entry());
        }

        if let Some(leaf) = &self.leaf {
            self.entry_idx += 1;
            if self.entry_idx < leaf.len() {
                return Ok(Some(leaf.entry(self.entry_idx).clone()));
            }
            self.leaf = None;
            return Ok(self.ascend_to_median());
        }

        // At a median: continue with the leftmost leaf right of it.
        loop {
            let Some(frame) = self.path.last_mut() else {
                self.end_reached = true;
                return Ok(None);
            };
            if frame.child_idx >= frame.node.len() {
                self.path.pop();
                continue;
            }
            frame.child_idx += 1;
            break;
        }
        self.find_leaf().await?;
        Ok(self.leaf_entry())
    }

    /// Seek forward to `key`.
    ///
    /// Returns the entry with `key`, or the first entry after it, or `None`
    /// at the end. The cursor never moves backward: seeking a key at or
    /// before the current position returns the current entry again.
    pub async fn seek(&mut self, key: &P::Key) -> Result<Option<P>, TreeError> {
        if self.end_reached {
            return Ok(None);
        }

        if self.is_initial() {
            if !self.load_root().await? {
                return Ok(None);
            }
            if self.leaf.is_none() {
                self.find_node(key).await?;
            }
        } else {
            if !self.trim_path(key) && self.leaf.is_none() {
                // Positioned on a median; don't look behind it.
                let median = self.median();
                if *key <= median.key() {
                    return Ok(Some(median.clone()));
                }
            }
            self.find_node(key).await?;
        }

        if let Some(leaf) = &self.leaf {
            self.entry_idx = leaf.find(key, self.entry_idx);
            if self.entry_idx < leaf.len() {
                return Ok(Some(leaf.entry(self.entry_idx).clone()));
            }
            self.leaf = None;
            // The remaining path only holds medians >= key.
            return Ok(self.ascend_to_median());
        }

        let median = self.median();
        debug_assert!(median.key() == *key, "descent stopped on a non-matching median");
        Ok(Some(median.clone()))
    }

    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    fn is_initial(&self) -> bool {
        self.path.is_empty() && self.leaf.is_none()
    }

    fn leaf_entry(&self) -> Option<P> {
        self.leaf
            .as_ref()
            .and_then(|leaf| leaf.entries().get(self.entry_idx))
            .cloned()
    }

    /// Current median entry.
    fn median(&self) -> &P {
        let Some(frame) = self.path.last() else {
            unreachable!("cursor at a median has a path");
        };
        frame.node.entry(frame.child_idx)
    }

    async fn load(&self, id: NodeId) -> Result<Node<P>, TreeError> {
        self.storage
            .get_node(id)
            .await?
            .ok_or(TreeError::MissingNode(id))
    }

    /// Load the root. Returns `false` (and ends the cursor) for an empty tree.
    async fn load_root(&mut self) -> Result<bool, TreeError> {
        let Some(root_id) = self.root else {
            self.end_reached = true;
            return Ok(false);
        };
        let root = self.load(root_id).await?;
        if root.is_leaf() {
            if root.is_empty() {
                self.end_reached = true;
                return Ok(false);
            }
            self.leaf = Some(root);
            self.entry_idx = 0;
        } else {
            self.path.push(Frame {
                node: root,
                child_idx: 0,
            });
        }
        Ok(true)
    }

    /// Descend from the current child of the top frame to its leftmost leaf.
    async fn find_leaf(&mut self) -> Result<(), TreeError> {
        let Some(frame) = self.path.last() else {
            unreachable!("leaf search starts from a path");
        };
        let mut id = frame.node.child(frame.child_idx);
        loop {
            let node = self.load(id).await?;
            if node.is_leaf() {
                self.leaf = Some(node);
                self.entry_idx = 0;
                return Ok(());
            }
            id = node.child(0);
            self.path.push(Frame { node, child_idx: 0 });
        }
    }

    /// Descend from the top frame towards `key`. Stops either on an exact
    /// match in an internal node (at a median) or in a leaf with
    /// `entry_idx` reset to zero. Never ascends.
    async fn find_node(&mut self, key: &P::Key) -> Result<(), TreeError> {
        if self.leaf.is_some() {
            return Ok(());
        }
        loop {
            let Some(frame) = self.path.last_mut() else {
                unreachable!("node search starts from a path");
            };
            frame.child_idx = frame.node.find(key, frame.child_idx);
            if frame.node.matches(frame.child_idx, key) {
                return Ok(());
            }
            let child = frame.node.child(frame.child_idx);
            let node = self.load(child).await?;
            if node.is_leaf() {
                self.leaf = Some(node);
                self.entry_idx = 0;
                return Ok(());
            }
            self.path.push(Frame { node, child_idx: 0 });
        }
    }

    /// Drop the part of the path that cannot contain `key`: everything
    /// below the first ancestor whose pending median is less than `key`.
    /// Returns `true` if the path was trimmed.
    fn trim_path(&mut self, key: &P::Key) -> bool {
        let stale = self.path.iter().position(|frame| {
            frame.child_idx < frame.node.len() && frame.node.entry(frame.child_idx).key() < *key
        });
        match stale {
            Some(level) => {
                self.path.truncate(level + 1);
                self.leaf = None;
                true
            }
            None => false,
        }
    }

    /// Pop exhausted frames and return the first pending median, or end
    /// the cursor if there is none.
    fn ascend_to_median(&mut self) -> Option<P> {
        while let Some(frame) = self.path.last() {
            if frame.child_idx < frame.node.len() {
                return Some(frame.node.entry(frame.child_idx).clone());
            }
            self.path.pop();
        }
        self.end_reached = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::btree::tree::BTree;
    use crate::config::TreeConfig;
    use crate::ids::Revision;
    use crate::storage::MemoryStorage;
    use crate::testing::TestEntry;

    async fn tree_with(
        keys: impl IntoIterator<Item = i64>,
    ) -> BTree<MemoryStorage<TestEntry>, TestEntry> {
        let config = TreeConfig::new(6).unwrap();
        let mut tree =
            BTree::new(Arc::new(MemoryStorage::new(1)), Revision::generate(), None, config)
                .unwrap();
        for key in keys {
            tree.insert(TestEntry::new(key), false).await.unwrap();
        }
        tree
    }

    async fn next_key(cursor: &mut Cursor<'_, MemoryStorage<TestEntry>, TestEntry>) -> Option<i64> {
        cursor.next().await.unwrap().map(|e| e.key)
    }

    async fn seek_key(
        cursor: &mut Cursor<'_, MemoryStorage<TestEntry>, TestEntry>,
        key: i64,
    ) -> Option<i64> {
        cursor.seek(&key).await.unwrap().map(|e| e.key)
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let tree = tree_with([]).await;
        let mut cursor = tree.cursor();
        assert_eq!(next_key(&mut cursor).await, None);
        assert_eq!(next_key(&mut cursor).await, None);
        let mut cursor = tree.cursor();
        assert_eq!(seek_key(&mut cursor, 5).await, None);
    }

    #[tokio::test]
    async fn test_iterates_in_order() {
        let tree = tree_with((1..=100).rev()).await;
        let mut cursor = tree.cursor();
        for expected in 1..=100 {
            assert_eq!(next_key(&mut cursor).await, Some(expected));
        }
        assert_eq!(next_key(&mut cursor).await, None);
    }

    #[tokio::test]
    async fn test_seek_exact_and_gap() {
        let tree = tree_with((0..50).map(|k| k * 10)).await;
        let mut cursor = tree.cursor();
        assert_eq!(seek_key(&mut cursor, 100).await, Some(100));
        assert_eq!(seek_key(&mut cursor, 101).await, Some(110));
        assert_eq!(seek_key(&mut cursor, 255).await, Some(260));
        assert_eq!(seek_key(&mut cursor, 490).await, Some(490));
        assert_eq!(seek_key(&mut cursor, 491).await, None);
        assert_eq!(next_key(&mut cursor).await, None);
    }

    #[tokio::test]
    async fn test_seek_never_moves_backward() {
        let tree = tree_with(1..=60).await;
        let mut cursor = tree.cursor();
        assert_eq!(seek_key(&mut cursor, 30).await, Some(30));
        assert_eq!(seek_key(&mut cursor, 30).await, Some(30));
        assert_eq!(seek_key(&mut cursor, 10).await, Some(30));
        assert_eq!(next_key(&mut cursor).await, Some(31));
    }

    #[tokio::test]
    async fn test_every_key_reachable_by_seek_then_next() {
        let tree = tree_with(1..=80).await;
        for start in 1..=80 {
            let mut cursor = tree.cursor();
            assert_eq!(seek_key(&mut cursor, start).await, Some(start));
            let mut expected = start + 1;
            while let Some(key) = next_key(&mut cursor).await {
                assert_eq!(key, expected);
                expected += 1;
            }
            assert_eq!(expected, 81);
        }
    }
}
