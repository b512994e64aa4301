// packages/fleet/src/persistence/snapshot.rs
//! Agent snapshot storage
//!
//! Snapshots are serialised agent records with a time-to-live. They exist
//! for crash recovery only; live reads always go to the in-memory registry.
//! Expired snapshots are invisible to `load`/`list` and removed by
//! `purge_expired`.

use crate::registry::agent::Agent;
use crate::utils::errors::{FleetError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Persistence backend for agent snapshots
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot of `agent`, expiring after `ttl`
    fn save(&self, agent: &Agent, ttl: Duration) -> Result<()>;

    /// Load an unexpired snapshot
    fn load(&self, agent_id: &str) -> Result<Option<Agent>>;

    /// Delete a snapshot; deleting a missing one is not an error
    fn delete(&self, agent_id: &str) -> Result<()>;

    /// All unexpired snapshots
    fn list(&self) -> Result<Vec<Agent>>;

    /// Remove expired snapshots, returning how many were dropped
    fn purge_expired(&self) -> Result<usize>;
}

/// Saturates at the latest representable instant
fn expiry(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Volatile store, used when persistence is disabled and in tests
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, (Agent, DateTime<Utc>)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, agent: &Agent, ttl: Duration) -> Result<()> {
        self.snapshots
            .lock()
            .insert(agent.id.clone(), (agent.clone(), expiry(ttl)));
        Ok(())
    }

    fn load(&self, agent_id: &str) -> Result<Option<Agent>> {
        let now = Utc::now();
        Ok(self
            .snapshots
            .lock()
            .get(agent_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(agent, _)| agent.clone()))
    }

    fn delete(&self, agent_id: &str) -> Result<()> {
        self.snapshots.lock().remove(agent_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Agent>> {
        let now = Utc::now();
        Ok(self
            .snapshots
            .lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(agent, _)| agent.clone())
            .collect())
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - snapshots.len())
    }
}

/// SQLite-backed snapshot store
pub struct SqliteSnapshotStore {
    db: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    FleetError::StorageFailed(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| FleetError::StorageFailed(format!("Failed to open database: {}", e)))?;

        let store = Self::with_connection(conn)?;
        info!("Snapshot storage initialized at {:?}", path);
        Ok(store)
    }

    /// In-memory SQLite database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FleetError::StorageFailed(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS agent_snapshots (
                agent_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                saved_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| FleetError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshot_expiry ON agent_snapshots(expires_at)",
            [],
        )
        .map_err(|e| FleetError::StorageFailed(format!("Index creation failed: {}", e)))?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, agent: &Agent, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(agent)?;
        let db = self.db.lock();
        db.execute(
            r#"
            INSERT INTO agent_snapshots (agent_id, payload, saved_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(agent_id) DO UPDATE SET
                payload = excluded.payload,
                saved_at = excluded.saved_at,
                expires_at = excluded.expires_at
            "#,
            params![
                agent.id,
                payload,
                Utc::now().timestamp_millis(),
                expiry(ttl).timestamp_millis(),
            ],
        )
        .map_err(|e| FleetError::StorageFailed(format!("Failed to save snapshot: {}", e)))?;

        debug!(agent_id = %agent.id, "Snapshot saved");
        Ok(())
    }

    fn load(&self, agent_id: &str) -> Result<Option<Agent>> {
        let db = self.db.lock();
        let payload: Option<String> = db
            .query_row(
                "SELECT payload FROM agent_snapshots WHERE agent_id = ?1 AND expires_at > ?2",
                params![agent_id, Utc::now().timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(FleetError::from))
            .transpose()
    }

    fn delete(&self, agent_id: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "DELETE FROM agent_snapshots WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Agent>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT payload FROM agent_snapshots WHERE expires_at > ?1 ORDER BY saved_at",
        )?;

        let payloads = stmt
            .query_map(params![Utc::now().timestamp_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(FleetError::from))
            .collect()
    }

    fn purge_expired(&self) -> Result<usize> {
        let db = self.db.lock();
        let removed = db.execute(
            "DELETE FROM agent_snapshots WHERE expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::template::{AgentOverrides, AgentTemplate};
    use tempfile::tempdir;

    fn agent(id: &str) -> Agent {
        AgentTemplate::new("t", "worker").instantiate(
            id.to_string(),
            &AgentOverrides::default(),
            Path::new("/tmp"),
        )
    }

    fn exercise(store: &dyn SnapshotStore) {
        let a1 = agent("a1");
        store.save(&a1, Duration::from_secs(60)).unwrap();
        store.save(&agent("a2"), Duration::from_secs(60)).unwrap();

        let loaded = store.load("a1").unwrap().unwrap();
        assert_eq!(loaded.id, a1.id);
        assert_eq!(loaded.template, a1.template);
        assert_eq!(loaded.status, a1.status);
        assert_eq!(store.list().unwrap().len(), 2);

        store.delete("a1").unwrap();
        store.delete("a1").unwrap();
        assert_eq!(store.load("a1").unwrap(), None);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemorySnapshotStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        let dir = tempdir().unwrap();
        let store = SqliteSnapshotStore::open(&dir.path().join("snapshots.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots.db");

        {
            let store = SqliteSnapshotStore::open(&path).unwrap();
            store.save(&agent("a1"), Duration::from_secs(60)).unwrap();
        }

        let store = SqliteSnapshotStore::open(&path).unwrap();
        assert!(store.load("a1").unwrap().is_some());
    }

    #[test]
    fn test_expired_snapshots_hidden_and_purged() {
        let store = SqliteSnapshotStore::open_in_memory().unwrap();
        store.save(&agent("old"), Duration::ZERO).unwrap();
        store.save(&agent("new"), Duration::from_secs(60)).unwrap();

        assert_eq!(store.load("old").unwrap(), None);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.purge_expired().unwrap(), 1);

        let memory = MemorySnapshotStore::new();
        memory.save(&agent("old"), Duration::ZERO).unwrap();
        assert_eq!(memory.load("old").unwrap(), None);
        assert_eq!(memory.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_huge_ttl_saturates() {
        assert_eq!(expiry(Duration::from_secs(u64::MAX)), DateTime::<Utc>::MAX_UTC);
        assert_eq!(expiry(Duration::from_secs(10_000_000_000_000)), DateTime::<Utc>::MAX_UTC);

        let store = SqliteSnapshotStore::open_in_memory().unwrap();
        store.save(&agent("a1"), Duration::from_secs(u64::MAX)).unwrap();
        assert!(store.load("a1").unwrap().is_some());
    }
}
