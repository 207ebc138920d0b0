//! Copy-on-write B-tree over an asynchronous node store.
//!
//! A `BTree` is bound to a storage, a target revision and an optional base
//! root. Every node it creates or forks is stamped with its revision; nodes
//! of any other revision are never mutated, so a root obtained from an
//! earlier revision keeps describing exactly the tree it described before.
//!
//! # Operations
//!
//! - `find`: point lookup
//! - `insert`: proactive top-down splitting, single root-to-leaf pass
//! - `delete` / `modify`: descent, optional replacement from an adjacent
//!   leaf, then bottom-up rebalancing along the recorded path
//! - `cursor`: ordered forward traversal
//!
//! Each mutating call stages its changes in a `QueryContext` and commits
//! them at the very end, so a failure before commit has no effect.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::btree::context::{PathEntry, QueryContext};
use crate::btree::cursor::Cursor;
use crate::btree::node::{Node, Split};
use crate::config::{ConfigError, TreeConfig};
use crate::ids::{NodeId, Revision};
use crate::payload::Payload;
use crate::storage::io::{BTreeStorage, StorageError};

/// Outcome of a `modify` call, and the verdict a modify callback returns.
///
/// Callbacks may return `NoChange`, `Changed`, `KeyChanged` or `Delete`.
/// `NotFound` and `KeyCollision` are only ever produced by the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyResult {
    /// No entry with the requested key exists.
    NotFound,
    /// The entry's new key already exists and overwriting was not allowed.
    KeyCollision,
    /// The entry was left untouched.
    NoChange,
    /// The entry was changed in place; its key is unchanged.
    Changed,
    /// The entry's key changed; it was moved to its new position.
    KeyChanged,
    /// The entry was removed.
    Delete,
}

/// Errors that can occur during tree operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Invalid tree configuration.
    Config(ConfigError),
    /// Backing store failure.
    Storage(StorageError),
    /// A referenced node is absent from storage.
    MissingNode(NodeId),
    /// A modify callback returned a result reserved for the tree.
    InvalidModifyResult(ModifyResult),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::MissingNode(id) => write!(f, "node {id} is missing from storage"),
            Self::InvalidModifyResult(result) => {
                write!(f, "modify callback returned invalid result {result:?}")
            }
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::MissingNode(_) | Self::InvalidModifyResult(_) => None,
        }
    }
}

impl From<ConfigError> for TreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StorageError> for TreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// What an insert pass did with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertOutcome {
    Inserted,
    Replaced,
    Exists,
}

/// Which end of a subtree to walk to.
#[derive(Debug, Clone, Copy)]
enum Edge {
    Leftmost,
    Rightmost,
}

/// A B-tree handle bound to one revision.
///
/// # Concurrency
///
/// Mutating operations take `&mut self` and readers take `&self`, so no
/// writer can run alongside cursors or other writers on the same handle.
/// Any number of cursors may be driven concurrently.
pub struct BTree<S, P> {
    storage: Arc<S>,
    revision: Revision,
    root: Option<NodeId>,
    config: TreeConfig,
    _payload: PhantomData<fn() -> P>,
}

impl<S: BTreeStorage<P>, P: Payload> BTree<S, P> {
    /// Create a tree handle.
    ///
    /// With `root = None` the tree starts empty; otherwise `root` is used as
    /// the copy-on-write base for `revision`.
    pub fn new(
        storage: Arc<S>,
        revision: Revision,
        root: Option<NodeId>,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        config.validate()?;
        Ok(Self {
            storage,
            revision,
            root,
            config,
            _payload: PhantomData,
        })
    }

    /// Current root, `None` for a tree that never had an entry.
    #[must_use]
    pub const fn root_id(&self) -> Option<NodeId> {
        self.root
    }

    #[must_use]
    pub const fn revision(&self) -> Revision {
        self.revision
    }

    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    #[must_use]
    pub const fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Create a cursor positioned before the first entry.
    #[must_use]
    pub fn cursor(&self) -> Cursor<'_, S, P> {
        Cursor::new(&self.storage, self.root)
    }

    /// Number of entries in the tree, read from the root's subtree total.
    pub async fn count(&self) -> Result<u64, TreeError> {
        let Some(root) = self.root else {
            return Ok(0);
        };
        let header = self
            .storage
            .get_node_header(root)
            .await?
            .ok_or(TreeError::MissingNode(root))?;
        Ok(header.total_count)
    }

    /// Look up the entry with `key`.
    pub async fn find(&self, key: &P::Key) -> Result<Option<P>, TreeError> {
        let mut id = match self.root {
            Some(root) => root,
            None => return Ok(None),
        };
        loop {
            let node = self.load(id).await?;
            let idx = node.find(key, 0);
            if node.matches(idx, key) {
                return Ok(Some(node.entry(idx).clone()));
            }
            if node.is_leaf() {
                return Ok(None);
            }
            id = node.child(idx);
        }
    }

    /// Insert an entry.
    ///
    /// Returns `false` if an entry with the same key already exists. With
    /// `overwrite` that entry is replaced, otherwise nothing changes.
    pub async fn insert(&mut self, entry: P, overwrite: bool) -> Result<bool, TreeError> {
        let mut ctx = self.context();
        let outcome = self.insert_into(&mut ctx, entry, overwrite).await?;
        if outcome != InsertOutcome::Exists {
            self.commit(ctx).await?;
        }
        Ok(outcome == InsertOutcome::Inserted)
    }

    /// Delete the entry with `key`. Returns `false` if it does not exist.
    pub async fn delete(&mut self, key: &P::Key) -> Result<bool, TreeError> {
        let result = self
            .delete_or_modify(key, false, None::<fn(&mut P) -> ModifyResult>)
            .await?;
        Ok(result == ModifyResult::Delete)
    }

    /// Apply `f` to the entry with `key`.
    ///
    /// The callback's verdict decides what happens to the entry:
    /// - `NoChange`: nothing is written
    /// - `Changed`: the entry is stored as changed, in place
    /// - `KeyChanged`: the entry is moved to its new key; if that key is
    ///   taken and `overwrite` is not set, `KeyCollision` is returned and
    ///   nothing is written
    /// - `Delete`: the entry is removed
    ///
    /// Returns `NotFound` without calling `f` if there is no such entry.
    pub async fn modify<F>(
        &mut self,
        key: &P::Key,
        overwrite: bool,
        f: F,
    ) -> Result<ModifyResult, TreeError>
    where
        F: FnOnce(&mut P) -> ModifyResult + Send,
    {
        self.delete_or_modify(key, overwrite, Some(f)).await
    }

    fn context(&self) -> QueryContext<P> {
        QueryContext::new(self.revision, self.root)
    }

    async fn load(&self, id: NodeId) -> Result<Node<P>, TreeError> {
        self.storage
            .get_node(id)
            .await?
            .ok_or(TreeError::MissingNode(id))
    }

    async fn commit(&mut self, ctx: QueryContext<P>) -> Result<(), TreeError> {
        if let Some(root) = ctx.commit(&*self.storage).await? {
            self.root = Some(root);
        }
        Ok(())
    }

    /// Single root-to-leaf insert pass, splitting full nodes on the way
    /// down so the parent always has room for a promoted median.
    async fn insert_into(
        &self,
        ctx: &mut QueryContext<P>,
        entry: P,
        overwrite: bool,
    ) -> Result<InsertOutcome, TreeError> {
        let key = entry.key();
        let mut id = match ctx.root() {
            Some(root) => root,
            None => ctx.set_new_root(Node::new_leaf(self.revision)),
        };

        loop {
            let node = ctx.load(&*self.storage, id).await?;
            if node.len() == self.config.max_entries() {
                let Split {
                    left,
                    right,
                    median,
                } = ctx.take(id).split(self.revision, self.config.order);
                let ordering = key.cmp(&median.key());
                let median = if ordering == Ordering::Equal && overwrite {
                    entry.clone()
                } else {
                    median
                };
                let left_id = ctx.put_split_left(id, left);
                let right_id = ctx.add_new(right);

                if ctx.path().is_empty() {
                    let root = Node::new_internal(self.revision, left_id, median, right_id);
                    let root_id = ctx.set_new_root(root);
                    ctx.push(PathEntry {
                        node: root_id,
                        child_idx: 0,
                    });
                } else {
                    let level = ctx.path().len() - 1;
                    let parent = ctx.modify_path(level);
                    let child_idx = ctx.path()[level].child_idx;
                    ctx.node_mut(parent)
                        .insert_split(child_idx, median, left_id, right_id);
                }

                match ordering {
                    Ordering::Equal if overwrite => return Ok(InsertOutcome::Replaced),
                    Ordering::Equal => return Ok(InsertOutcome::Exists),
                    Ordering::Less => id = left_id,
                    Ordering::Greater => {
                        let child_idx = ctx.path()[ctx.path().len() - 1].child_idx;
                        ctx.set_top_child_idx(child_idx + 1);
                        id = right_id;
                    }
                }
                continue;
            }

            let idx = node.find(&key, 0);
            let found = node.matches(idx, &key);
            let is_leaf = node.is_leaf();
            let child = if found || is_leaf {
                None
            } else {
                Some(node.child(idx))
            };

            if found {
                if !overwrite {
                    return Ok(InsertOutcome::Exists);
                }
                let owned = ctx.modify_child(id);
                ctx.node_mut(owned).set_entry(idx, entry);
                return Ok(InsertOutcome::Replaced);
            }
            match child {
                None => {
                    let owned = ctx.modify_child(id);
                    ctx.node_mut(owned).insert_entry(idx, entry);
                    return Ok(InsertOutcome::Inserted);
                }
                Some(child) => {
                    ctx.push(PathEntry {
                        node: id,
                        child_idx: idx,
                    });
                    id = child;
                }
            }
        }
    }

    /// Shared implementation of `delete` (no callback) and `modify`.
    async fn delete_or_modify<F>(
        &mut self,
        key: &P::Key,
        overwrite: bool,
        f: Option<F>,
    ) -> Result<ModifyResult, TreeError>
    where
        F: FnOnce(&mut P) -> ModifyResult + Send,
    {
        let Some(root) = self.root else {
            return Ok(ModifyResult::NotFound);
        };
        let mut ctx = self.context();
        let mut id = root;

        let result = loop {
            let node = ctx.load(&*self.storage, id).await?;
            let idx = node.find(key, 0);
            let is_leaf = node.is_leaf();
            if !node.matches(idx, key) {
                if is_leaf {
                    return Ok(ModifyResult::NotFound);
                }
                let child = node.child(idx);
                ctx.push(PathEntry {
                    node: id,
                    child_idx: idx,
                });
                id = child;
                continue;
            }

            let owned = ctx.modify_child(id);
            let result = match f {
                Some(f) => apply_modify(f, ctx.node_mut(owned).entry_mut(idx))?,
                None => ModifyResult::Delete,
            };
            match result {
                ModifyResult::NoChange => return Ok(result),
                ModifyResult::Changed => {
                    self.commit(ctx).await?;
                    return Ok(result);
                }
                _ => {}
            }

            id = if is_leaf {
                let removed = ctx.node_mut(owned).remove_entry(idx);
                ctx.set_target_entry(removed);
                owned
            } else {
                ctx.push(PathEntry {
                    node: owned,
                    child_idx: idx,
                });
                self.take_replacement(&mut ctx, idx).await?
            };
            break result;
        };

        self.rebalance(&mut ctx, id).await?;

        if result == ModifyResult::KeyChanged {
            let Some(entry) = ctx.take_target_entry() else {
                unreachable!("removed entry is recorded in the context");
            };
            ctx.clear_path();
            if self.insert_into(&mut ctx, entry, overwrite).await? == InsertOutcome::Exists {
                return Ok(ModifyResult::KeyCollision);
            }
        }

        self.commit(ctx).await?;
        Ok(result)
    }

    /// Replace the entry at `idx` of the internal node on top of the path
    /// with the adjacent entry from the neighbouring subtree that has more
    /// room to spare: the last entry of the rightmost leaf under the left
    /// child, or the first entry of the leftmost leaf under the right child.
    ///
    /// Extends the path down to that leaf and returns the leaf's id.
    async fn take_replacement(
        &self,
        ctx: &mut QueryContext<P>,
        idx: usize,
    ) -> Result<NodeId, TreeError> {
        let level = ctx.path().len() - 1;
        let internal = ctx.path()[level].node;
        let left_child = ctx.node(internal).child(idx);
        let right_child = ctx.node(internal).child(idx + 1);

        let (left_trail, left_leaf) = self.edge_trail(ctx, left_child, Edge::Rightmost).await?;
        let (right_trail, right_leaf) = self.edge_trail(ctx, right_child, Edge::Leftmost).await?;
        let use_left = ctx.node(left_leaf).len() > ctx.node(right_leaf).len();

        let (trail, leaf) = if use_left {
            (left_trail, left_leaf)
        } else {
            ctx.set_top_child_idx(idx + 1);
            (right_trail, right_leaf)
        };
        for step in trail {
            ctx.push(step);
        }

        let leaf = ctx.modify_child(leaf);
        let replacement = if use_left {
            let last = ctx.node(leaf).len() - 1;
            ctx.node_mut(leaf).remove_entry(last)
        } else {
            ctx.node_mut(leaf).remove_entry(0)
        };

        let internal = ctx.path()[level].node;
        let removed = ctx.node_mut(internal).set_entry(idx, replacement);
        ctx.set_target_entry(removed);
        Ok(leaf)
    }

    /// Walk from `start` to its leftmost or rightmost leaf. Returns the
    /// path entries of the internal nodes passed and the leaf id.
    async fn edge_trail(
        &self,
        ctx: &mut QueryContext<P>,
        start: NodeId,
        edge: Edge,
    ) -> Result<(Vec<PathEntry>, NodeId), TreeError> {
        let mut trail = Vec::new();
        let mut id = start;
        loop {
            let node = ctx.load(&*self.storage, id).await?;
            if node.is_leaf() {
                return Ok((trail, id));
            }
            let child_idx = match edge {
                Edge::Leftmost => 0,
                Edge::Rightmost => node.len(),
            };
            let child = node.child(child_idx);
            trail.push(PathEntry { node: id, child_idx });
            id = child;
        }
    }

    /// Restore the lower fanout bound bottom-up along the recorded path,
    /// starting at the node `id` that just lost an entry.
    async fn rebalance(&self, ctx: &mut QueryContext<P>, mut id: NodeId) -> Result<(), TreeError> {
        let min = self.config.min_entries();

        while let Some(top) = ctx.path().last().copied() {
            if ctx.node(id).len() >= min {
                break;
            }
            let level = ctx.path().len() - 1;
            let parent = ctx.modify_path(level);
            let idx = top.child_idx;
            let parent_len = ctx.node(parent).len();

            if idx > 0 {
                let left = ctx.node(parent).child(idx - 1);
                if ctx.load(&*self.storage, left).await?.len() > min {
                    let left = ctx.modify_sibling(left, idx - 1);
                    ctx.rotate_right(parent, idx - 1, left, id);
                    return Ok(());
                }
            }
            if idx < parent_len {
                let right = ctx.node(parent).child(idx + 1);
                if ctx.load(&*self.storage, right).await?.len() > min {
                    let right = ctx.modify_sibling(right, idx + 1);
                    ctx.rotate_left(parent, idx, id, right);
                    return Ok(());
                }
            }

            let merged = if idx > 0 {
                let left = ctx.node(parent).child(idx - 1);
                ctx.merge(parent, idx - 1, left, id)
            } else {
                let right = ctx.node(parent).child(idx + 1);
                ctx.merge(parent, idx, id, right)
            };
            ctx.pop();

            if ctx.node(parent).is_empty() {
                // Only the root can run out of entries; the tree shrinks.
                assert!(ctx.path().is_empty(), "non-root node {parent} emptied");
                ctx.discard(parent);
                ctx.set_root(merged);
                tracing::trace!("root collapsed into {merged}");
                return Ok(());
            }
            id = parent;
        }
        Ok(())
    }
}

/// Run a modify callback, rejecting the results reserved for the tree.
fn apply_modify<P, F>(f: F, entry: &mut P) -> Result<ModifyResult, TreeError>
where
    F: FnOnce(&mut P) -> ModifyResult,
{
    match f(entry) {
        result @ (ModifyResult::NotFound | ModifyResult::KeyCollision) => {
            Err(TreeError::InvalidModifyResult(result))
        }
        result => Ok(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::{TestEntry, keys_of};

    type TestTree = BTree<MemoryStorage<TestEntry>, TestEntry>;

    fn new_tree(order: usize) -> TestTree {
        let config = TreeConfig::new(order).unwrap();
        BTree::new(Arc::new(MemoryStorage::new(1)), Revision::generate(), None, config).unwrap()
    }

    #[test]
    fn test_rejects_small_order() {
        let result = TestTree::new(
            Arc::new(MemoryStorage::new(1)),
            Revision(1),
            None,
            TreeConfig { order: 5 },
        );
        assert!(matches!(
            result,
            Err(TreeError::Config(ConfigError::OrderTooSmall { order: 5, min: 6 }))
        ));
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let mut tree = new_tree(6);
        assert_eq!(tree.root_id(), None);
        assert_eq!(tree.find(&1).await.unwrap(), None);
        assert!(!tree.delete(&1).await.unwrap());
        assert_eq!(
            tree.modify(&1, false, |_| ModifyResult::Changed).await.unwrap(),
            ModifyResult::NotFound
        );
        assert_eq!(tree.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_splits_root() {
        let mut tree = new_tree(6);
        for key in 1..=5 {
            assert!(tree.insert(TestEntry::new(key), false).await.unwrap());
        }
        let leaf_root = tree.root_id().unwrap();

        // The sixth insert finds a full root and grows the tree.
        assert!(tree.insert(TestEntry::new(6), false).await.unwrap());
        let root = tree.storage().get_node(tree.root_id().unwrap()).await.unwrap().unwrap();
        assert!(!root.is_leaf());
        assert_eq!(root.len(), 1);
        assert_eq!(root.entry(0).key, 3);
        assert_eq!(root.child(0), leaf_root);
        assert_eq!(tree.count().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_insert_existing() {
        let mut tree = new_tree(6);
        tree.insert(TestEntry::with_value(1, 10), false).await.unwrap();
        let writes = tree.storage().stats().writes;

        assert!(!tree.insert(TestEntry::with_value(1, 20), false).await.unwrap());
        assert_eq!(tree.find(&1).await.unwrap().unwrap().value, 10);
        assert_eq!(tree.storage().stats().writes, writes);

        assert!(!tree.insert(TestEntry::with_value(1, 30), true).await.unwrap());
        assert_eq!(tree.find(&1).await.unwrap().unwrap().value, 30);
    }

    #[tokio::test]
    async fn test_overwrite_median_during_split() {
        let mut tree = new_tree(6);
        for key in 1..=5 {
            tree.insert(TestEntry::new(key), false).await.unwrap();
        }
        // Key 3 is the median of the full root.
        assert!(!tree.insert(TestEntry::with_value(3, 99), true).await.unwrap());
        assert_eq!(tree.find(&3).await.unwrap().unwrap().value, 99);
        assert_eq!(keys_of(&tree).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_delete_internal_entry() {
        let mut tree = new_tree(6);
        for key in 1..=30 {
            tree.insert(TestEntry::new(key), false).await.unwrap();
        }
        let root = tree.storage().get_node(tree.root_id().unwrap()).await.unwrap().unwrap();
        let internal_key = root.entry(0).key;

        assert!(tree.delete(&internal_key).await.unwrap());
        assert_eq!(tree.find(&internal_key).await.unwrap(), None);
        let expected: Vec<i64> = (1..=30).filter(|k| *k != internal_key).collect();
        assert_eq!(keys_of(&tree).await, expected);
        assert_eq!(tree.count().await.unwrap(), 29);
    }

    #[tokio::test]
    async fn test_delete_everything_collapses_root() {
        let mut tree = new_tree(6);
        for key in 1..=50 {
            tree.insert(TestEntry::new(key), false).await.unwrap();
        }
        for key in 1..=50 {
            assert!(tree.delete(&key).await.unwrap(), "delete {key}");
        }
        let root = tree.storage().get_node(tree.root_id().unwrap()).await.unwrap().unwrap();
        assert!(root.is_leaf());
        assert!(root.is_empty());
        assert_eq!(tree.count().await.unwrap(), 0);
        // Only the empty root is left.
        assert_eq!(tree.storage().node_count(), 1);
    }

    #[tokio::test]
    async fn test_modify_results() {
        let mut tree = new_tree(6);
        for key in [10, 20, 30] {
            tree.insert(TestEntry::new(key), false).await.unwrap();
        }

        let result = tree.modify(&20, false, |_| ModifyResult::NoChange).await.unwrap();
        assert_eq!(result, ModifyResult::NoChange);

        let result = tree
            .modify(&20, false, |e| {
                e.value = 7;
                ModifyResult::Changed
            })
            .await
            .unwrap();
        assert_eq!(result, ModifyResult::Changed);
        assert_eq!(tree.find(&20).await.unwrap().unwrap().value, 7);

        let result = tree.modify(&20, false, |_| ModifyResult::Delete).await.unwrap();
        assert_eq!(result, ModifyResult::Delete);
        assert_eq!(tree.find(&20).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_modify_invalid_result() {
        let mut tree = new_tree(6);
        tree.insert(TestEntry::new(1), false).await.unwrap();
        let before = tree.storage().checksums();

        let result = tree.modify(&1, false, |_| ModifyResult::NotFound).await;
        assert_eq!(
            result,
            Err(TreeError::InvalidModifyResult(ModifyResult::NotFound))
        );
        let result = tree.modify(&1, false, |_| ModifyResult::KeyCollision).await;
        assert_eq!(
            result,
            Err(TreeError::InvalidModifyResult(ModifyResult::KeyCollision))
        );
        assert_eq!(tree.storage().checksums(), before);
    }

    #[tokio::test]
    async fn test_modify_key_collision() {
        let mut tree = new_tree(6);
        tree.insert(TestEntry::with_value(1, 100), false).await.unwrap();
        tree.insert(TestEntry::with_value(2, 200), false).await.unwrap();

        let move_to_two = |e: &mut TestEntry| {
            e.key = 2;
            ModifyResult::KeyChanged
        };
        let result = tree.modify(&1, false, move_to_two).await.unwrap();
        assert_eq!(result, ModifyResult::KeyCollision);
        assert_eq!(tree.find(&1).await.unwrap().unwrap().value, 100);
        assert_eq!(tree.find(&2).await.unwrap().unwrap().value, 200);

        let result = tree.modify(&1, true, move_to_two).await.unwrap();
        assert_eq!(result, ModifyResult::KeyChanged);
        assert_eq!(tree.find(&1).await.unwrap(), None);
        assert_eq!(tree.find(&2).await.unwrap().unwrap().value, 100);
    }

    #[test]
    fn test_tree_error_display() {
        assert_eq!(
            TreeError::MissingNode(NodeId(5)).to_string(),
            "node #5 is missing from storage"
        );
        assert_eq!(
            TreeError::InvalidModifyResult(ModifyResult::NotFound).to_string(),
            "modify callback returned invalid result NotFound"
        );
    }
}
