//! Cursor lookup and iteration patterns over trees of various shapes.
//!
//! Data sets use even keys so every lookup of `key - 1` falls into a gap.

use crate::e2e_tests::helpers::*;

const ORDERS: [usize; 4] = [6, 7, 8, 9];
const SIZES: [i64; 6] = [0, 1, 4, 5, 30, 300];

fn data(count: i64) -> Vec<i64> {
    (0..count).map(|k| k * 2 + 2).collect()
}

async fn trees() -> Vec<(TestTree, Vec<i64>)> {
    let mut trees = Vec::new();
    for order in ORDERS {
        for size in SIZES {
            let keys = data(size);
            for mode in KeyOrder::ALL {
                trees.push((tree_with(order, &mode.arrange(&keys)).await, keys.clone()));
            }
        }
    }
    trees
}

async fn seek(tree: &TestTree, key: i64) -> Option<i64> {
    tree.cursor().seek(&key).await.unwrap().map(|e| e.key)
}

#[tokio::test]
async fn test_sequential_lookup() {
    for (tree, keys) in trees().await {
        if let Some(first) = keys.first() {
            assert_eq!(seek(&tree, first - 1).await, Some(*first));
        }
        for key in &keys {
            assert_eq!(seek(&tree, *key).await, Some(*key));
            assert_eq!(seek(&tree, key - 1).await, Some(*key));
        }
        let past_end = keys.last().map_or(42, |last| last + 1);
        assert_eq!(seek(&tree, past_end).await, None);
    }
}

#[tokio::test]
async fn test_iteration() {
    for (tree, keys) in trees().await {
        let mut cursor = tree.cursor();
        for key in &keys {
            assert_eq!(cursor.next().await.unwrap().map(|e| e.key), Some(*key));
        }
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.next().await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_iteration_after_lookup() {
    for (tree, keys) in trees().await {
        for (idx, key) in keys.iter().enumerate() {
            let mut cursor = tree.cursor();
            assert_eq!(cursor.seek(key).await.unwrap().map(|e| e.key), Some(*key));
            for expected in keys.iter().skip(idx + 1).take(5) {
                assert_eq!(cursor.next().await.unwrap().map(|e| e.key), Some(*expected));
            }
        }
    }
}

#[tokio::test]
async fn test_lookup_continuation() {
    for skip in [0, 1, 3] {
        for (tree, keys) in trees().await {
            let mut cursor = tree.cursor();
            for key in keys.iter().step_by(skip + 1) {
                // Repeating a key, or going back, returns the same entry.
                for probe in [*key, *key, key - 1] {
                    assert_eq!(cursor.seek(&probe).await.unwrap().map(|e| e.key), Some(*key));
                }
            }
            let last_visited = keys.is_empty() || (keys.len() - 1) % (skip + 1) == 0;
            if last_visited {
                assert_eq!(cursor.next().await.unwrap(), None);
            }
        }
    }
}

#[tokio::test]
async fn test_mixed_lookup_iteration() {
    for (after_lookup, rounds_per_cursor) in [(1, None), (2, None), (3, Some(2)), (5, Some(1))] {
        for (tree, keys) in trees().await {
            let mut cursor = tree.cursor();
            let mut iterations = 0;
            let mut rounds = 0;
            for key in &keys {
                iterations += 1;
                let found = if iterations == 1 {
                    cursor.seek(key).await.unwrap()
                } else {
                    let found = cursor.next().await.unwrap();
                    if iterations > after_lookup {
                        iterations = 0;
                        rounds += 1;
                        if rounds_per_cursor.is_some_and(|limit| rounds >= limit) {
                            rounds = 0;
                            cursor = tree.cursor();
                        }
                    }
                    found
                };
                assert_eq!(found.map(|e| e.key), Some(*key));
            }
        }
    }
}
