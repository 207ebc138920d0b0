//! Snapshot isolation between revisions.

use std::sync::Arc;

use crate::btree::BTree;
use crate::e2e_tests::helpers::*;
use crate::ids::Revision;
use crate::invariants::InvariantChecker;
use crate::storage::BTreeStorage;
use crate::testing::TestEntry;

#[tokio::test]
async fn test_old_root_unchanged_after_insert() {
    let base_keys: Vec<i64> = (1..=30).collect();
    let old = tree_with(6, &base_keys).await;
    let root_a = old.root_id().unwrap();
    let before = old.storage().checksums();

    let mut new = next_revision(&old);
    assert!(new.insert(TestEntry::new(31), false).await.unwrap());
    let root_b = new.root_id().unwrap();
    assert_ne!(root_a, root_b);

    // No node reachable from the old root was touched.
    let after = new.storage().checksums();
    for (id, checksum) in &before {
        assert_eq!(after.get(id), Some(checksum), "node {id} changed");
    }

    assert_eq!(keys(&old).await, base_keys);
    assert_eq!(old.find(&31).await.unwrap(), None);
    assert_eq!(new.find(&31).await.unwrap(), Some(TestEntry::new(31)));
    verify(&old).await;
    verify(&new).await;
}

#[tokio::test]
async fn test_fork_links_previous_version() {
    let old = tree_with(6, &[1, 2, 3]).await;
    let root_a = old.root_id().unwrap();

    let mut new = next_revision(&old);
    new.insert(TestEntry::new(4), false).await.unwrap();
    let root_b = new.root_id().unwrap();
    let header = new.storage().get_node_header(root_b).await.unwrap().unwrap();
    assert_eq!(header.prev_version, Some(root_a));
    assert_eq!(header.revision, new.revision());

    // Writes in the same revision reuse the fork.
    new.insert(TestEntry::new(5), false).await.unwrap();
    assert_eq!(new.root_id(), Some(root_b));
}

#[tokio::test]
async fn test_shared_subtrees() {
    let old = tree_with(6, &(0..200).collect::<Vec<_>>()).await;
    let nodes_before = old.storage().node_count();

    let mut new = next_revision(&old);
    new.insert(TestEntry::new(1000), false).await.unwrap();

    // Only the root-to-leaf path was copied, plus split halves on it.
    let report = InvariantChecker::check_tree(&new).await.unwrap();
    let copied = old.storage().node_count() - nodes_before;
    assert!(copied <= 2 * report.stats.height + 1, "copied {copied} nodes");
    assert!(copied * 4 < nodes_before);
}

#[tokio::test]
async fn test_old_snapshot_survives_heavy_changes() {
    let base_keys: Vec<i64> = (0..150).collect();
    let old = tree_with(7, &base_keys).await;
    let before = old.storage().checksums();

    let mut new = next_revision(&old);
    for key in (0..150).filter(|k| k % 3 != 0) {
        assert!(new.delete(&key).await.unwrap());
    }
    for key in 150..220 {
        new.insert(TestEntry::new(key), false).await.unwrap();
    }
    for key in (0..150).step_by(6) {
        new.insert(TestEntry::with_value(key, 7), true).await.unwrap();
    }
    verify(&new).await;

    let after = new.storage().checksums();
    for (id, checksum) in &before {
        assert_eq!(after.get(id), Some(checksum), "node {id} changed");
    }
    assert_eq!(keys(&old).await, base_keys);
    assert_eq!(old.count().await.unwrap(), 150);
    verify(&old).await;

    let expected: Vec<i64> = (0..150).filter(|k| k % 3 == 0).chain(150..220).collect();
    assert_eq!(keys(&new).await, expected);
}

#[tokio::test]
async fn test_chain_of_revisions() {
    let storage = new_storage();
    let mut roots = Vec::new();
    let mut tree = open_tree(&storage, None, 6);

    for round in 0..5i64 {
        insert_all(&mut tree, &(round * 20..(round + 1) * 20).collect::<Vec<_>>()).await;
        roots.push(tree.root_id());
        tree = next_revision(&tree);
    }

    for (round, root) in (1i64..).zip(&roots) {
        let snapshot =
            BTree::new(Arc::clone(&storage), Revision::generate(), *root, *tree.config()).unwrap();
        let expected: Vec<i64> = (0..round * 20).collect();
        assert_eq!(keys(&snapshot).await, expected);
        verify(&snapshot).await;
    }
}
