//! Insert, find, delete and modify on small trees.

use crate::btree::ModifyResult;
use crate::e2e_tests::helpers::*;
use crate::testing::TestEntry;

#[tokio::test]
async fn test_insert_ascending_order_six() {
    let keys_in: Vec<i64> = (1..=20).collect();
    let tree = tree_with(6, &keys_in).await;

    let found = tree.find(&7).await.unwrap().unwrap();
    assert_eq!(found.key, 7);
    assert_eq!(keys(&tree).await, keys_in);
    verify(&tree).await;
}

#[tokio::test]
async fn test_delete_middle_key() {
    let mut tree = tree_with(6, &[10, 20, 30, 40, 50]).await;

    assert!(tree.delete(&30).await.unwrap());
    assert_eq!(keys(&tree).await, vec![10, 20, 40, 50]);
    assert_eq!(tree.find(&30).await.unwrap(), None);
    verify(&tree).await;
}

#[tokio::test]
async fn test_delete_absent_key_changes_nothing() {
    let mut tree = tree_with(6, &[10, 20, 30, 40, 50, 60, 70]).await;
    let root = tree.root_id();
    let before = tree.storage().checksums();

    assert!(!tree.delete(&35).await.unwrap());
    assert_eq!(tree.root_id(), root);
    assert_eq!(tree.storage().checksums(), before);
}

#[tokio::test]
async fn test_modify_changes_key() {
    let mut tree = tree_with(6, &[10, 20, 30]).await;

    let result = tree
        .modify(&20, false, |e| {
            e.key = 25;
            ModifyResult::KeyChanged
        })
        .await
        .unwrap();
    assert_eq!(result, ModifyResult::KeyChanged);
    assert_eq!(tree.find(&20).await.unwrap(), None);
    let moved = tree.find(&25).await.unwrap().unwrap();
    assert_eq!(moved, TestEntry::with_value(25, 20));
    assert_eq!(keys(&tree).await, vec![10, 25, 30]);
    verify(&tree).await;
}

#[tokio::test]
async fn test_modify_changes_key_across_subtrees() {
    let mut tree = tree_with(6, &(1..=60).map(|k| k * 10).collect::<Vec<_>>()).await;

    // Move every key by a large offset so entries change subtree and level.
    for key in (1..=60).map(|k| k * 10) {
        let result = tree
            .modify(&key, false, |e| {
                e.key += 1001;
                ModifyResult::KeyChanged
            })
            .await
            .unwrap();
        assert_eq!(result, ModifyResult::KeyChanged);
        verify(&tree).await;
    }
    let expected: Vec<i64> = (1..=60).map(|k| k * 10 + 1001).collect();
    assert_eq!(keys(&tree).await, expected);
}

#[tokio::test]
async fn test_duplicate_insert() {
    let mut tree = tree_with(7, &(0..40).collect::<Vec<_>>()).await;

    for key in 0..40 {
        let replaced = tree
            .insert(TestEntry::with_value(key, 1000), false)
            .await
            .unwrap();
        assert!(!replaced);
        assert_eq!(tree.find(&key).await.unwrap(), Some(TestEntry::new(key)));
    }
    for key in 0..40 {
        let inserted = tree
            .insert(TestEntry::with_value(key, 1000), true)
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(tree.find(&key).await.unwrap().unwrap().value, 1000);
    }
    verify(&tree).await;
}

#[tokio::test]
async fn test_delete_all_then_reuse() {
    let keys_in: Vec<i64> = (0..100).collect();
    let mut tree = tree_with(8, &keys_in).await;

    for key in &keys_in {
        assert!(tree.delete(key).await.unwrap());
        verify(&tree).await;
    }
    assert!(keys(&tree).await.is_empty());
    assert_eq!(tree.count().await.unwrap(), 0);

    insert_all(&mut tree, &keys_in).await;
    assert_eq!(keys(&tree).await, keys_in);
    verify(&tree).await;
}
