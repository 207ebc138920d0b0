//! Storage failures abort an operation without a partial effect.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::btree::{ModifyResult, TreeError};
use crate::e2e_tests::helpers::*;
use crate::ids::NodeId;
use crate::storage::{FaultConfig, MemoryStorageStats, StorageError};
use crate::testing::TestEntry;

#[tokio::test]
async fn test_failed_write_leaves_storage_unchanged() {
    let mut tree = tree_with(6, &(0..40).collect::<Vec<_>>()).await;
    let root = tree.root_id();
    let before = tree.storage().checksums();

    tree.storage().set_fault_config(FaultConfig::failing_writes());
    let result = tree.insert(TestEntry::new(100), false).await;
    assert!(matches!(
        result,
        Err(TreeError::Storage(StorageError::InjectedFault(_)))
    ));
    assert_eq!(tree.root_id(), root);
    assert_eq!(tree.storage().checksums(), before);

    tree.storage().set_fault_config(FaultConfig::no_faults());
    assert_eq!(tree.find(&100).await.unwrap(), None);
    assert!(tree.insert(TestEntry::new(100), false).await.unwrap());
    verify(&tree).await;
}

#[tokio::test]
async fn test_failed_read_leaves_storage_unchanged() {
    let mut tree = tree_with(6, &(0..40).collect::<Vec<_>>()).await;
    let before = tree.storage().checksums();

    tree.storage().set_fault_config(FaultConfig {
        read_error_rate: 1.0,
        ..FaultConfig::default()
    });
    assert!(tree.delete(&10).await.is_err());
    assert!(tree.modify(&11, false, |_| ModifyResult::Delete).await.is_err());
    assert_eq!(tree.storage().checksums(), before);
    assert!(tree.storage().stats().injected_read_errors >= 2);

    tree.storage().set_fault_config(FaultConfig::no_faults());
    assert_eq!(keys(&tree).await, (0..40).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_corrupted_node_detected() {
    let tree = tree_with(6, &(0..40).collect::<Vec<_>>()).await;
    let root = tree.root_id().unwrap();

    assert!(tree.storage().corrupt_node(root));
    assert_eq!(
        tree.find(&5).await,
        Err(TreeError::Storage(StorageError::Corruption { id: root }))
    );
    let mut cursor = tree.cursor();
    assert!(cursor.next().await.is_err());
}

#[tokio::test]
async fn test_missing_root() {
    let storage = new_storage();
    let mut tree = open_tree(&storage, Some(NodeId(u64::MAX)), 6);
    assert_eq!(
        tree.find(&1).await,
        Err(TreeError::MissingNode(NodeId(u64::MAX)))
    );
    assert_eq!(
        tree.insert(TestEntry::new(1), false).await,
        Err(TreeError::MissingNode(NodeId(u64::MAX)))
    );
    assert_eq!(storage.node_count(), 0);
}

/// Random operations under read faults. Reads happen before any write of
/// a commit, so every failed operation must leave the tree as it was.
#[tokio::test]
async fn test_random_read_faults() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut tree = new_tree(6);
    let mut model = BTreeSet::new();
    let faults = FaultConfig {
        read_error_rate: 0.05,
        ..FaultConfig::default()
    };
    let mut failures = 0;

    for step in 0..600 {
        let key = rng.random_range(0..200i64);
        tree.storage().set_fault_config(faults.clone());
        let result = if rng.random_bool(0.6) {
            tree.insert(TestEntry::new(key), false).await.map(|inserted| {
                if inserted {
                    model.insert(key);
                }
            })
        } else {
            tree.delete(&key).await.map(|deleted| {
                if deleted {
                    model.remove(&key);
                }
            })
        };
        if result.is_err() {
            failures += 1;
        }

        tree.storage().set_fault_config(FaultConfig::no_faults());
        if step % 25 == 0 || result.is_err() {
            assert_eq!(keys(&tree).await, model.iter().copied().collect::<Vec<_>>());
            verify(&tree).await;
        }
    }
    assert!(failures > 0);
}

/// Sparse faults of every kind. Each operation writes a fresh revision,
/// so a failed commit leaves at most unreachable new nodes behind and the
/// last good snapshot stays readable.
#[tokio::test]
async fn test_low_fault_rate_keeps_last_snapshot() {
    let initial: Vec<i64> = (0..100).map(|k| k * 2).collect();
    let mut rng = StdRng::seed_from_u64(11);
    let mut tree = tree_with(6, &initial).await;
    let mut model: BTreeSet<i64> = initial.into_iter().collect();
    let storage = Arc::clone(tree.storage());

    storage.reset_stats();
    assert_eq!(storage.stats(), MemoryStorageStats::default());

    let mut failures = 0u64;
    for step in 0..1500 {
        let key = rng.random_range(0..300i64);
        let insert = rng.random_bool(0.5);
        let mut next = next_revision(&tree);

        storage.set_fault_config(FaultConfig::low_faults());
        let result = if insert {
            next.insert(TestEntry::new(key), false).await
        } else {
            next.delete(&key).await
        };
        storage.set_fault_config(FaultConfig::no_faults());

        let failed = result.is_err();
        match result {
            Ok(true) if insert => {
                model.insert(key);
                tree = next;
            }
            Ok(true) => {
                model.remove(&key);
                tree = next;
            }
            Ok(false) => {}
            Err(_) => failures += 1,
        }

        if step % 50 == 0 || failed {
            assert_eq!(keys(&tree).await, model.iter().copied().collect::<Vec<_>>());
            verify(&tree).await;
        }
    }

    let stats = storage.stats();
    let injected = stats.injected_read_errors
        + stats.injected_write_errors
        + stats.injected_remove_errors
        + stats.corrupted_reads;
    assert!(failures > 0);
    assert!(injected >= failures);
}
