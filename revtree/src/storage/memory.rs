//! In-memory node storage for tests and the demo binary.
//!
//! Nodes are kept in a map together with the checksum computed when they
//! were stored, so every read can verify integrity. The backend supports
//! fault injection at various levels:
//! - Read errors
//! - Write errors
//! - Remove errors
//! - Corruption detected on read
//!
//! Faults are drawn from a seeded RNG, so the same seed and the same
//! sequence of operations produce the same faults.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::btree::node::{Node, NodeHeader};
use crate::ids::NodeId;
use crate::payload::Payload;
use crate::storage::io::{BTreeStorage, StorageError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a remove error (0.0 - 1.0).
    pub remove_error_rate: f64,
    /// Probability that a read observes a corrupted node (0.0 - 1.0).
    pub corruption_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
            remove_error_rate: 0.001,
            corruption_rate: 0.001,
        }
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            remove_error_rate: 0.05,
            corruption_rate: 0.05,
        }
    }

    /// Fail every write and keep reads intact.
    #[must_use]
    pub const fn failing_writes() -> Self {
        Self {
            read_error_rate: 0.0,
            write_error_rate: 1.0,
            remove_error_rate: 0.0,
            corruption_rate: 0.0,
        }
    }
}

/// Statistics about storage operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryStorageStats {
    /// Number of header reads.
    pub header_reads: u64,
    /// Number of node reads.
    pub reads: u64,
    /// Number of node writes.
    pub writes: u64,
    /// Number of node removals.
    pub removes: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected remove errors.
    pub injected_remove_errors: u64,
    /// Number of reads that failed the integrity check.
    pub corrupted_reads: u64,
}

/// A node together with the checksum computed at store time.
#[derive(Debug, Clone)]
struct StoredNode<P> {
    node: Node<P>,
    checksum: u32,
}

struct State<P> {
    nodes: HashMap<NodeId, StoredNode<P>>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStorageStats,
}

impl<P> State<P> {
    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Shared read path: injected errors, then integrity check.
    fn read(&mut self, id: NodeId) -> Result<Option<&StoredNode<P>>, StorageError>
    where
        P: Payload,
    {
        if self.should_inject_fault(self.fault_config.read_error_rate) {
            self.stats.injected_read_errors += 1;
            tracing::warn!("injecting read error for node {id}");
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }
        let corrupt = self.should_inject_fault(self.fault_config.corruption_rate);

        let Some(stored) = self.nodes.get(&id) else {
            return Ok(None);
        };
        if corrupt || stored.checksum != stored.node.checksum() {
            self.stats.corrupted_reads += 1;
            tracing::warn!("checksum mismatch reading node {id}");
            return Err(StorageError::Corruption { id });
        }
        Ok(Some(stored))
    }
}

/// In-memory `BTreeStorage` implementation.
///
/// # Thread Safety
///
/// All state sits behind one mutex that is never held across an await
/// point, so the storage can be shared by any number of concurrent readers.
pub struct MemoryStorage<P> {
    state: Mutex<State<P>>,
}

impl<P: Payload> MemoryStorage<P> {
    /// Create a new fault-free storage with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new storage with custom fault configuration.
    ///
    /// The seed ensures deterministic behavior: the same seed will produce
    /// the same sequence of faults.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            state: Mutex::new(State {
                nodes: HashMap::new(),
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStorageStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<P>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a snapshot of the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStorageStats {
        self.lock().stats.clone()
    }

    /// Reset statistics.
    pub fn reset_stats(&self) {
        self.lock().stats = MemoryStorageStats::default();
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.lock().fault_config = config;
    }

    /// Number of stored nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.lock().nodes.contains_key(&id)
    }

    /// Stored checksum of every node, ordered by id.
    #[must_use]
    pub fn checksums(&self) -> BTreeMap<NodeId, u32> {
        self.lock()
            .nodes
            .iter()
            .map(|(id, stored)| (*id, stored.checksum))
            .collect()
    }

    /// Damage the stored checksum of a node so the next read detects it.
    ///
    /// Returns `false` if the node does not exist.
    pub fn corrupt_node(&self, id: NodeId) -> bool {
        let mut state = self.lock();
        let Some(stored) = state.nodes.get_mut(&id) else {
            return false;
        };
        stored.checksum = !stored.checksum;
        true
    }
}

impl<P: Payload> BTreeStorage<P> for MemoryStorage<P> {
    async fn get_node_header(&self, id: NodeId) -> Result<Option<NodeHeader>, StorageError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.stats.header_reads += 1;
        Ok(state.read(id)?.map(|stored| *stored.node.header()))
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node<P>>, StorageError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.stats.reads += 1;
        Ok(state.read(id)?.map(|stored| stored.node.clone()))
    }

    async fn store_node(&self, node: &Node<P>) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.stats.writes += 1;

        if state.should_inject_fault(state.fault_config.write_error_rate) {
            state.stats.injected_write_errors += 1;
            tracing::warn!("injecting write error for node {}", node.id());
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        state.nodes.insert(
            node.id(),
            StoredNode {
                node: node.clone(),
                checksum: node.checksum(),
            },
        );
        Ok(())
    }

    async fn remove_node(&self, id: NodeId) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.stats.removes += 1;

        if state.should_inject_fault(state.fault_config.remove_error_rate) {
            state.stats.injected_remove_errors += 1;
            tracing::warn!("injecting remove error for node {id}");
            return Err(StorageError::InjectedFault(
                "simulated remove error".to_string(),
            ));
        }

        match state.nodes.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StorageError::NodeNotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Revision;
    use crate::testing::TestEntry;

    fn leaf(keys: &[i64]) -> Node<TestEntry> {
        let mut node = Node::new_leaf(Revision(1));
        for (idx, key) in keys.iter().enumerate() {
            node.insert_entry(idx, TestEntry::new(*key));
        }
        node
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let storage = MemoryStorage::new(1);
        let node = leaf(&[1, 2, 3]);
        storage.store_node(&node).await.unwrap();

        let loaded = storage.get_node(node.id()).await.unwrap().unwrap();
        assert_eq!(loaded.entries(), node.entries());
        let header = storage.get_node_header(node.id()).await.unwrap().unwrap();
        assert_eq!(header, *node.header());
        assert_eq!(storage.node_count(), 1);

        let stats = storage.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.header_reads, 1);
    }

    #[tokio::test]
    async fn test_missing_node_is_none() {
        let storage = MemoryStorage::<TestEntry>::new(1);
        assert!(storage.get_node(NodeId(12345)).await.unwrap().is_none());
        assert!(storage.get_node_header(NodeId(12345)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_absent_node_fails() {
        let storage = MemoryStorage::<TestEntry>::new(1);
        assert_eq!(
            storage.remove_node(NodeId(777)).await,
            Err(StorageError::NodeNotFound(NodeId(777)))
        );

        let node = leaf(&[1]);
        storage.store_node(&node).await.unwrap();
        storage.remove_node(node.id()).await.unwrap();
        assert!(!storage.contains(node.id()));
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let storage = MemoryStorage::new(1);
        let node = leaf(&[4, 5]);
        storage.store_node(&node).await.unwrap();

        assert!(storage.corrupt_node(node.id()));
        assert_eq!(
            storage.get_node(node.id()).await.unwrap_err(),
            StorageError::Corruption { id: node.id() }
        );
        assert_eq!(storage.stats().corrupted_reads, 1);
        assert!(!storage.corrupt_node(NodeId(999_999)));
    }

    #[tokio::test]
    async fn test_injected_write_fault() {
        let storage = MemoryStorage::with_config(1, FaultConfig::failing_writes());
        let node = leaf(&[1]);
        let result = storage.store_node(&node).await;
        assert!(matches!(result, Err(StorageError::InjectedFault(_))));
        assert_eq!(storage.node_count(), 0);
        assert_eq!(storage.stats().injected_write_errors, 1);

        storage.set_fault_config(FaultConfig::no_faults());
        storage.store_node(&node).await.unwrap();
        assert_eq!(storage.node_count(), 1);
    }

    #[tokio::test]
    async fn test_faults_are_deterministic() {
        async fn run(seed: u64) -> Vec<bool> {
            let storage = MemoryStorage::with_config(seed, FaultConfig::high_faults());
            let mut outcomes = Vec::new();
            for key in 0..200 {
                outcomes.push(storage.store_node(&leaf(&[key])).await.is_ok());
            }
            outcomes
        }

        assert_eq!(run(7).await, run(7).await);
    }
}
