//! Shared test helpers.

use crate::btree::tree::{BTree, TreeError};
use crate::payload::Payload;
use crate::storage::io::BTreeStorage;

/// A small payload: an integer key with an attached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestEntry {
    pub key: i64,
    pub value: u64,
}

impl TestEntry {
    /// Create an entry whose value is derived from the key.
    #[must_use]
    pub const fn new(key: i64) -> Self {
        Self {
            key,
            value: key.unsigned_abs(),
        }
    }

    #[must_use]
    pub const fn with_value(key: i64, value: u64) -> Self {
        Self { key, value }
    }
}

impl Payload for TestEntry {
    type Key = i64;

    fn key(&self) -> i64 {
        self.key
    }

    fn digest(&self) -> u64 {
        let key = u64::from_le_bytes(self.key.to_le_bytes());
        key.rotate_left(29) ^ self.value.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

/// Read every entry of a tree in cursor order.
pub async fn collect_entries<S, P>(tree: &BTree<S, P>) -> Result<Vec<P>, TreeError>
where
    S: BTreeStorage<P>,
    P: Payload,
{
    let mut cursor = tree.cursor();
    let mut entries = Vec::new();
    while let Some(entry) = cursor.next().await? {
        entries.push(entry);
    }
    Ok(entries)
}

/// Keys of a `TestEntry` tree in cursor order.
pub async fn keys_of<S: BTreeStorage<TestEntry>>(tree: &BTree<S, TestEntry>) -> Vec<i64> {
    collect_entries(tree)
        .await
        .expect("tree traversal succeeds")
        .iter()
        .map(|e| e.key)
        .collect()
}
