//! Randomized operations checked against `BTreeMap`.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::btree::ModifyResult;
use crate::e2e_tests::helpers::*;
use crate::testing::{TestEntry, collect_entries};

async fn assert_matches_model(tree: &TestTree, model: &BTreeMap<i64, u64>) {
    let entries = collect_entries(tree).await.unwrap();
    let expected: Vec<TestEntry> = model
        .iter()
        .map(|(key, value)| TestEntry::with_value(*key, *value))
        .collect();
    assert_eq!(entries, expected);
}

async fn run_model(order: usize, seed: u64, steps: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tree = new_tree(order);
    let mut model: BTreeMap<i64, u64> = BTreeMap::new();

    for step in 0..steps {
        let key = rng.random_range(0..300i64);
        match rng.random_range(0..100) {
            0..40 => {
                let value = rng.random::<u64>();
                let overwrite = rng.random_bool(0.3);
                let inserted = tree
                    .insert(TestEntry::with_value(key, value), overwrite)
                    .await
                    .unwrap();
                assert_eq!(inserted, !model.contains_key(&key));
                if inserted || overwrite {
                    model.insert(key, value);
                }
            }
            40..65 => {
                let deleted = tree.delete(&key).await.unwrap();
                assert_eq!(deleted, model.remove(&key).is_some());
            }
            65..80 => {
                let value = rng.random::<u64>();
                let result = tree
                    .modify(&key, false, |e| {
                        e.value = value;
                        ModifyResult::Changed
                    })
                    .await
                    .unwrap();
                match model.get_mut(&key) {
                    Some(stored) => {
                        assert_eq!(result, ModifyResult::Changed);
                        *stored = value;
                    }
                    None => assert_eq!(result, ModifyResult::NotFound),
                }
            }
            80..95 => {
                let new_key = rng.random_range(0..300i64);
                let overwrite = rng.random_bool(0.5);
                let result = tree
                    .modify(&key, overwrite, |e| {
                        e.key = new_key;
                        ModifyResult::KeyChanged
                    })
                    .await
                    .unwrap();
                let Some(value) = model.get(&key).copied() else {
                    assert_eq!(result, ModifyResult::NotFound);
                    continue;
                };
                if new_key != key && model.contains_key(&new_key) && !overwrite {
                    assert_eq!(result, ModifyResult::KeyCollision);
                } else {
                    assert_eq!(result, ModifyResult::KeyChanged);
                    model.remove(&key);
                    model.insert(new_key, value);
                }
            }
            _ => {
                // Start a new revision on top of the current snapshot.
                tree = next_revision(&tree);
            }
        }

        assert_matches_model(&tree, &model).await;
        if step % 10 == 0 {
            verify(&tree).await;
        }
    }
    verify(&tree).await;
}

#[tokio::test]
async fn test_model_orders() {
    for order in [6, 7, 8, 9, 16] {
        run_model(order, 1000 + order as u64, 800).await;
    }
}

#[tokio::test]
async fn test_model_seeds() {
    for seed in 0..6 {
        run_model(6, seed, 500).await;
    }
}
