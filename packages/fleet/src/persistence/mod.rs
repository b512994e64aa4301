// packages/fleet/src/persistence/mod.rs
//! Crash-recovery persistence
//!
//! - **Snapshot**: TTL'd agent snapshots in memory or SQLite

pub mod snapshot;

pub use snapshot::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
