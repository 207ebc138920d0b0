//! Many cursors driven concurrently over one snapshot.

use futures::future::join_all;

use crate::e2e_tests::helpers::*;
use crate::testing::TestEntry;

async fn scan_from(tree: &TestTree, start: i64) -> Vec<i64> {
    let mut cursor = tree.cursor();
    let mut keys = Vec::new();
    let mut next = cursor.seek(&start).await.unwrap();
    while let Some(entry) = next {
        keys.push(entry.key);
        // Yield so the scans interleave.
        tokio::task::yield_now().await;
        next = cursor.next().await.unwrap();
    }
    keys
}

#[tokio::test]
async fn test_concurrent_scans_agree() {
    let all: Vec<i64> = (0..500).collect();
    let tree = tree_with(8, &KeyOrder::Shuffle.arrange(&all)).await;

    let starts: Vec<i64> = (0..16).map(|i| i * 31).collect();
    let scans = join_all(starts.iter().map(|start| scan_from(&tree, *start))).await;

    for (start, scan) in starts.iter().zip(scans) {
        let expected: Vec<i64> = (*start..500).collect();
        assert_eq!(scan, expected, "scan from {start}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_snapshots_across_threads() {
    let base: Vec<i64> = (0..300).collect();
    let old = tree_with(6, &base).await;
    let mut new = next_revision(&old);
    for key in (0..300).step_by(2) {
        new.delete(&key).await.unwrap();
    }
    new.insert(TestEntry::new(1000), false).await.unwrap();

    let old_root = old.root_id();
    let new_root = new.root_id();
    let storage = old.storage();

    let mut handles = Vec::new();
    for i in 0..8 {
        let root = if i % 2 == 0 { old_root } else { new_root };
        let tree = open_tree(storage, root, 6);
        handles.push(tokio::spawn(async move { keys(&tree).await }));
    }

    let expected_new: Vec<i64> = (1..300).step_by(2).chain([1000]).collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let scanned = handle.await.unwrap();
        if i % 2 == 0 {
            assert_eq!(scanned, base);
        } else {
            assert_eq!(scanned, expected_new);
        }
    }
}
