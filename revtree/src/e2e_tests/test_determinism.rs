//! Test that the same sequence of operations produces identical trees.

use crate::btree::ModifyResult;
use crate::e2e_tests::helpers::*;
use crate::invariants::{InvariantChecker, TreeStats};
use crate::testing::TestEntry;

async fn run_sequence() -> (Vec<i64>, TreeStats, u64) {
    let mut tree = new_tree(7);
    insert_all(&mut tree, &KeyOrder::Shuffle.arrange(&(0..250).collect::<Vec<_>>())).await;
    for key in (0..250).step_by(4) {
        tree.delete(&key).await.unwrap();
    }
    tree = next_revision(&tree);
    for key in (1..250).step_by(4) {
        tree.modify(&key, false, |e| {
            e.key += 1000;
            ModifyResult::KeyChanged
        })
        .await
        .unwrap();
    }
    tree.insert(TestEntry::new(-1), false).await.unwrap();

    let stats = InvariantChecker::check_tree(&tree).await.unwrap().stats;
    (keys(&tree).await, stats, tree.count().await.unwrap())
}

#[tokio::test]
async fn test_deterministic_sequence() {
    let run1 = run_sequence().await;
    let run2 = run_sequence().await;

    assert_eq!(run1, run2);
    assert_eq!(run1.2, 250 - 63 + 1);
}
