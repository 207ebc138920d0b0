//! End-to-end tests at the tree API level.
//!
//! Each test file covers a specific scenario against the in-memory
//! storage, using seeded inputs so every run is deterministic.

#![cfg(test)]

mod helpers;

mod test_basic_scenarios;
mod test_concurrent_readers;
mod test_copy_on_write;
mod test_cursor_patterns;
mod test_determinism;
mod test_fault_atomicity;
mod test_model;
mod test_revision_matrix;
