//! Common helpers for end-to-end tests.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::btree::BTree;
use crate::config::TreeConfig;
use crate::ids::{NodeId, Revision};
use crate::invariants::InvariantChecker;
use crate::storage::MemoryStorage;
use crate::testing::{TestEntry, collect_entries};

pub type TestStorage = MemoryStorage<TestEntry>;
pub type TestTree = BTree<TestStorage, TestEntry>;

/// Order in which a key set is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    Ascending,
    Descending,
    Shuffle,
}

impl KeyOrder {
    pub const ALL: [Self; 3] = [Self::Ascending, Self::Descending, Self::Shuffle];

    /// Arrange `keys` (given ascending) in this order.
    pub fn arrange(self, keys: &[i64]) -> Vec<i64> {
        let mut keys = keys.to_vec();
        match self {
            Self::Ascending => {}
            Self::Descending => keys.reverse(),
            Self::Shuffle => keys.shuffle(&mut StdRng::seed_from_u64(42)),
        }
        keys
    }
}

#[must_use]
pub fn new_storage() -> Arc<TestStorage> {
    Arc::new(MemoryStorage::new(42))
}

/// Open a tree on `storage` under a fresh revision.
#[must_use]
pub fn open_tree(storage: &Arc<TestStorage>, root: Option<NodeId>, order: usize) -> TestTree {
    let config = TreeConfig::new(order).expect("valid order");
    BTree::new(Arc::clone(storage), Revision::generate(), root, config).expect("valid tree")
}

/// Create an empty tree on its own storage.
#[must_use]
pub fn new_tree(order: usize) -> TestTree {
    open_tree(&new_storage(), None, order)
}

/// Reopen the same snapshot under a fresh revision.
#[must_use]
pub fn next_revision(tree: &TestTree) -> TestTree {
    open_tree(tree.storage(), tree.root_id(), tree.config().order)
}

pub async fn insert_all(tree: &mut TestTree, keys: &[i64]) {
    for key in keys {
        let inserted = tree
            .insert(TestEntry::new(*key), false)
            .await
            .expect("insert succeeds");
        assert!(inserted, "key {key} inserted");
    }
}

/// Build a tree holding `keys` under one revision.
pub async fn tree_with(order: usize, keys: &[i64]) -> TestTree {
    let mut tree = new_tree(order);
    insert_all(&mut tree, keys).await;
    tree
}

pub async fn keys(tree: &TestTree) -> Vec<i64> {
    collect_entries(tree)
        .await
        .expect("traversal succeeds")
        .iter()
        .map(|e| e.key)
        .collect()
}

/// Assert every structural invariant and that the root total is exact.
pub async fn verify(tree: &TestTree) {
    let report = InvariantChecker::check_tree(tree)
        .await
        .expect("check succeeds");
    assert!(
        report.is_ok(),
        "invariant violations: {:?}",
        report.violations
    );
    assert_eq!(
        tree.count().await.expect("count succeeds"),
        report.stats.entries
    );
}
