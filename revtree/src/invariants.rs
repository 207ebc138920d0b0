//! Structural verification of a tree snapshot.
//!
//! The checker walks every node reachable from a root and reports each
//! broken invariant instead of stopping at the first one:
//! - every non-root node has `min_entries..=max_entries` entries
//! - an internal root has at least one entry
//! - internal nodes have exactly one more child than entries
//! - keys are strictly ascending and inside the range their ancestors allow
//! - all leaves are at the same depth
//! - `total_count` equals the real number of entries in the subtree
//!
//! Storage errors abort the check; a missing node is a violation.

use std::collections::HashMap;
use std::fmt;

use crate::btree::tree::{BTree, TreeError};
use crate::config::TreeConfig;
use crate::ids::NodeId;
use crate::payload::Payload;
use crate::storage::io::BTreeStorage;

/// A broken structural invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    Underflow { node: NodeId, entries: usize, min: usize },
    Overflow { node: NodeId, entries: usize, max: usize },
    EmptyInternalRoot { node: NodeId },
    ChildCount { node: NodeId, entries: usize, children: usize },
    /// Entry `index` is out of order or outside the node's key range.
    KeyOrder { node: NodeId, index: usize },
    UnevenDepth { node: NodeId, depth: usize, expected: usize },
    TotalCount { node: NodeId, stored: u64, actual: u64 },
    MissingNode { node: NodeId },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Underflow { node, entries, min } => {
                write!(f, "node {node} has {entries} entries, fewer than {min}")
            }
            Self::Overflow { node, entries, max } => {
                write!(f, "node {node} has {entries} entries, more than {max}")
            }
            Self::EmptyInternalRoot { node } => write!(f, "internal root {node} is empty"),
            Self::ChildCount {
                node,
                entries,
                children,
            } => write!(f, "node {node} has {entries} entries but {children} children"),
            Self::KeyOrder { node, index } => {
                write!(f, "entry {index} of node {node} is out of order")
            }
            Self::UnevenDepth {
                node,
                depth,
                expected,
            } => write!(f, "leaf {node} at depth {depth}, expected {expected}"),
            Self::TotalCount {
                node,
                stored,
                actual,
            } => write!(f, "node {node} stores total {stored}, actual {actual}"),
            Self::MissingNode { node } => write!(f, "node {node} is missing"),
        }
    }
}

/// Shape of a checked snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub nodes: usize,
    pub leaves: usize,
    /// Number of levels, 0 for a tree without root.
    pub height: usize,
    pub entries: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvariantReport {
    pub stats: TreeStats,
    pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A node waiting to be visited, with the key range its ancestors allow.
struct Pending<K> {
    id: NodeId,
    depth: usize,
    lower: Option<K>,
    upper: Option<K>,
}

/// Per-node data needed once the walk is done.
struct Visited {
    id: NodeId,
    own_entries: u64,
    stored_total: u64,
    children: Vec<NodeId>,
}

pub struct InvariantChecker {
    config: TreeConfig,
}

impl InvariantChecker {
    #[must_use]
    pub const fn new(config: TreeConfig) -> Self {
        Self { config }
    }

    /// Check the current snapshot of a tree.
    pub async fn check_tree<S, P>(tree: &BTree<S, P>) -> Result<InvariantReport, TreeError>
    where
        S: BTreeStorage<P>,
        P: Payload,
    {
        Self::new(*tree.config())
            .check::<S, P>(tree.storage().as_ref(), tree.root_id())
            .await
    }

    /// Check the snapshot rooted at `root`.
    pub async fn check<S, P>(
        &self,
        storage: &S,
        root: Option<NodeId>,
    ) -> Result<InvariantReport, TreeError>
    where
        S: BTreeStorage<P>,
        P: Payload,
    {
        let mut report = InvariantReport::default();
        let Some(root) = root else {
            return Ok(report);
        };

        let mut leaf_depth: Option<usize> = None;
        let mut visited = Vec::new();
        let mut stack = vec![Pending::<P::Key> {
            id: root,
            depth: 0,
            lower: None,
            upper: None,
        }];

        while let Some(pending) = stack.pop() {
            let Some(node) = storage.get_node(pending.id).await? else {
                report
                    .violations
                    .push(InvariantViolation::MissingNode { node: pending.id });
                continue;
            };
            let id = node.id();
            let entries = node.len();
            report.stats.nodes += 1;
            report.stats.entries += entries as u64;

            let is_root = pending.depth == 0;
            if entries > self.config.max_entries() {
                report.violations.push(InvariantViolation::Overflow {
                    node: id,
                    entries,
                    max: self.config.max_entries(),
                });
            }
            if !is_root && entries < self.config.min_entries() {
                report.violations.push(InvariantViolation::Underflow {
                    node: id,
                    entries,
                    min: self.config.min_entries(),
                });
            }

            for (index, entry) in node.entries().iter().enumerate() {
                let key = entry.key();
                let after_previous = index == 0 || node.entry(index - 1).key() < key;
                let above_lower = pending.lower.as_ref().is_none_or(|lower| *lower < key);
                let below_upper = pending.upper.as_ref().is_none_or(|upper| key < *upper);
                if !(after_previous && above_lower && below_upper) {
                    report
                        .violations
                        .push(InvariantViolation::KeyOrder { node: id, index });
                }
            }

            let children = node.children().map(<[NodeId]>::to_vec).unwrap_or_default();
            if node.is_leaf() {
                report.stats.leaves += 1;
                match leaf_depth {
                    None => leaf_depth = Some(pending.depth),
                    Some(expected) if expected != pending.depth => {
                        report.violations.push(InvariantViolation::UnevenDepth {
                            node: id,
                            depth: pending.depth,
                            expected,
                        });
                    }
                    Some(_) => {}
                }
            } else {
                if is_root && entries == 0 {
                    report
                        .violations
                        .push(InvariantViolation::EmptyInternalRoot { node: id });
                }
                if children.len() != entries + 1 {
                    report.violations.push(InvariantViolation::ChildCount {
                        node: id,
                        entries,
                        children: children.len(),
                    });
                }
                // Push in reverse so the leftmost child is visited first.
                for (idx, child) in children.iter().enumerate().rev() {
                    let lower = match idx {
                        0 => pending.lower.clone(),
                        _ => node.entries().get(idx - 1).map(Payload::key),
                    };
                    let upper = match node.entries().get(idx) {
                        Some(entry) => Some(entry.key()),
                        None => pending.upper.clone(),
                    };
                    stack.push(Pending {
                        id: *child,
                        depth: pending.depth + 1,
                        lower,
                        upper,
                    });
                }
            }

            visited.push(Visited {
                id,
                own_entries: entries as u64,
                stored_total: node.header().total_count,
                children,
            });
        }

        // Pre-order visit, so children always come after their parent.
        let mut totals: HashMap<NodeId, u64> = HashMap::with_capacity(visited.len());
        for node in visited.iter().rev() {
            let actual = node.own_entries
                + node
                    .children
                    .iter()
                    .map(|child| totals.get(child).copied().unwrap_or(0))
                    .sum::<u64>();
            if actual != node.stored_total {
                report.violations.push(InvariantViolation::TotalCount {
                    node: node.id,
                    stored: node.stored_total,
                    actual,
                });
            }
            totals.insert(node.id, actual);
        }

        report.stats.height = leaf_depth.map_or(0, |depth| depth + 1);
        if !report.is_ok() {
            tracing::warn!(
                "snapshot {root} has {} invariant violations",
                report.violations.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::btree::node::Node;
    use crate::ids::Revision;
    use crate::storage::MemoryStorage;
    use crate::testing::TestEntry;

    fn leaf(keys: &[i64]) -> Node<TestEntry> {
        let mut node = Node::new_leaf(Revision(1));
        for (idx, key) in keys.iter().enumerate() {
            node.insert_entry(idx, TestEntry::new(*key));
        }
        node.set_total_count(keys.len() as u64);
        node
    }

    fn checker() -> InvariantChecker {
        InvariantChecker::new(TreeConfig::new(6).unwrap())
    }

    #[tokio::test]
    async fn test_valid_tree() {
        let config = TreeConfig::new(6).unwrap();
        let storage = Arc::new(MemoryStorage::new(1));
        let mut tree = BTree::new(storage, Revision::generate(), None, config).unwrap();
        for key in 0..200 {
            tree.insert(TestEntry::new(key), false).await.unwrap();
        }

        let report = InvariantChecker::check_tree(&tree).await.unwrap();
        assert!(report.is_ok(), "{:?}", report.violations);
        assert_eq!(report.stats.entries, 200);
        assert!(report.stats.height > 2);
        assert!(report.stats.leaves < report.stats.nodes);
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let storage = MemoryStorage::<TestEntry>::new(1);
        let report = checker().check(&storage, None).await.unwrap();
        assert!(report.is_ok());
        assert_eq!(report.stats, TreeStats::default());
    }

    #[tokio::test]
    async fn test_detects_violations() {
        let storage = MemoryStorage::new(1);
        // Left child underflows and holds a key above the separator.
        let left = leaf(&[60]);
        let right = leaf(&[70, 80]);
        let mut root = Node::new_internal(Revision(1), left.id(), TestEntry::new(50), right.id());
        root.set_total_count(10);
        for node in [&left, &right, &root] {
            storage.store_node(node).await.unwrap();
        }

        let report = checker().check(&storage, Some(root.id())).await.unwrap();
        assert!(report.violations.contains(&InvariantViolation::Underflow {
            node: left.id(),
            entries: 1,
            min: 2,
        }));
        assert!(report.violations.contains(&InvariantViolation::KeyOrder {
            node: left.id(),
            index: 0,
        }));
        assert!(report.violations.contains(&InvariantViolation::TotalCount {
            node: root.id(),
            stored: 10,
            actual: 4,
        }));
    }

    #[tokio::test]
    async fn test_detects_missing_node() {
        let storage = MemoryStorage::new(1);
        let present = leaf(&[1, 2]);
        let root = Node::new_internal(Revision(1), present.id(), TestEntry::new(5), NodeId(987_654));
        storage.store_node(&present).await.unwrap();
        storage.store_node(&root).await.unwrap();

        let report = checker().check(&storage, Some(root.id())).await.unwrap();
        assert!(report.violations.contains(&InvariantViolation::MissingNode {
            node: NodeId(987_654)
        }));
    }
}
