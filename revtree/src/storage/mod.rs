//! Node storage: the backend trait and an in-memory implementation.

pub mod io;
pub mod memory;

pub use io::{BTreeStorage, StorageError};
pub use memory::{FaultConfig, MemoryStorage, MemoryStorageStats};
