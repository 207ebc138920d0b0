// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use revtree::{
    BTree, InvariantChecker, MemoryStorage, Payload, Revision, TreeError, WorkloadConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Workload entry: a random key and the step that inserted it.
#[derive(Debug, Clone, Copy)]
struct DemoEntry {
    key: i64,
    step: u64,
}

impl Payload for DemoEntry {
    type Key = i64;

    fn key(&self) -> i64 {
        self.key
    }

    fn digest(&self) -> u64 {
        u64::from_le_bytes(self.key.to_le_bytes()).rotate_left(17) ^ self.step
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "revtree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match WorkloadConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: order={}, entries={}, seed={}",
        config.tree.order,
        config.entries,
        config.seed
    );

    if let Err(e) = run(config).await {
        tracing::error!("Workload failed: {e}");
        std::process::exit(1);
    }
}

/// Build one revision with `entries` random keys, then delete every other
/// key in a second revision and verify both snapshots.
async fn run(config: WorkloadConfig) -> Result<(), TreeError> {
    let storage = Arc::new(MemoryStorage::<DemoEntry>::new(config.seed));
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut tree = BTree::new(Arc::clone(&storage), Revision::generate(), None, config.tree)?;
    let mut keys = Vec::with_capacity(config.entries);
    let mut step = 0;
    while keys.len() < config.entries {
        let key = rng.random_range(0..i64::MAX);
        if tree.insert(DemoEntry { key, step }, false).await? {
            keys.push(key);
        }
        step += 1;
    }
    let first_root = tree.root_id();
    tracing::info!(
        "revision {} built: root {:?}, {} entries, {} nodes stored",
        tree.revision(),
        first_root,
        tree.count().await?,
        storage.node_count()
    );

    let mut next = BTree::new(Arc::clone(&storage), Revision::generate(), first_root, config.tree)?;
    for key in keys.iter().step_by(2) {
        next.delete(key).await?;
    }
    tracing::info!(
        "revision {} built: root {:?}, {} entries, {} nodes stored",
        next.revision(),
        next.root_id(),
        next.count().await?,
        storage.node_count()
    );

    let mut healthy = true;
    for snapshot in [&tree, &next] {
        let report = InvariantChecker::check_tree(snapshot).await?;
        tracing::info!(
            "revision {}: {} nodes, {} leaves, height {}, {} entries",
            snapshot.revision(),
            report.stats.nodes,
            report.stats.leaves,
            report.stats.height,
            report.stats.entries
        );
        for violation in &report.violations {
            tracing::error!("revision {}: {violation}", snapshot.revision());
        }
        healthy &= report.is_ok();
    }

    let stats = storage.stats();
    tracing::info!(
        "storage: {} reads, {} header reads, {} writes, {} removes",
        stats.reads,
        stats.header_reads,
        stats.writes,
        stats.removes
    );

    if !healthy {
        tracing::error!("invariant violations found");
        std::process::exit(2);
    }
    Ok(())
}
