//! Identity store: SQLite-backed bindings with an in-memory index
//!
//! The whole bindings table is loaded at open and kept in memory for O(1)
//! lookups. Writes go to SQLite first and only then to the index, so the
//! index never holds a binding that is not durable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OpenFlags};

use super::bindings::{list_bindings, upsert_binding};
use super::migrations::run_migrations;
use crate::error::Result;
use crate::types::{Binding, StorageConfig, StorageMode};

/// Point-in-time view of all bindings
#[derive(Debug, Clone, Default)]
pub struct BindingSnapshot {
    by_path: HashMap<String, Binding>,
    by_remote_id: HashMap<String, String>,
}

impl BindingSnapshot {
    pub fn from_bindings(bindings: impl IntoIterator<Item = Binding>) -> Self {
        let mut snapshot = Self::default();
        for binding in bindings {
            snapshot.insert(binding);
        }
        snapshot
    }

    pub fn get(&self, path: &str) -> Option<&Binding> {
        self.by_path.get(path)
    }

    pub fn get_by_remote_id(&self, remote_page_id: &str) -> Option<&Binding> {
        self.by_remote_id
            .get(remote_page_id)
            .and_then(|path| self.by_path.get(path))
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// All bindings ordered by path
    pub fn all(&self) -> Vec<Binding> {
        let mut all: Vec<Binding> = self.by_path.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    fn insert(&mut self, binding: Binding) {
        // Drop whatever this path pointed at before
        if let Some(previous) = self.by_path.get(&binding.path) {
            if previous.remote_page_id != binding.remote_page_id {
                self.by_remote_id.remove(&previous.remote_page_id);
            }
        }
        // Transfer the remote id away from any other owner
        if let Some(owner) = self.by_remote_id.get(&binding.remote_page_id).cloned() {
            if owner != binding.path {
                self.by_path.remove(&owner);
            }
        }
        self.by_remote_id
            .insert(binding.remote_page_id.clone(), binding.path.clone());
        self.by_path.insert(binding.path.clone(), binding);
    }
}

/// Durable `path -> Binding` mapping
pub struct IdentityStore {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
    index: Arc<RwLock<BindingSnapshot>>,
}

impl IdentityStore {
    /// Open or create the state database and load all bindings
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;
        run_migrations(&conn)?;

        let bindings = list_bindings(&conn)?;
        tracing::debug!(
            db_path = %config.db_path,
            bindings = bindings.len(),
            "Identity store opened"
        );

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
            index: Arc::new(RwLock::new(BindingSnapshot::from_bindings(bindings))),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
        })
    }

    fn create_connection(config: &StorageConfig) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(&config.db_path, flags)?
        };

        Self::configure_pragmas(&conn, config.storage_mode)?;
        Ok(conn)
    }

    /// Local mode: WAL for crash recovery. Cloud-safe mode: DELETE journal so
    /// the database stays a single file.
    fn configure_pragmas(conn: &Connection, mode: StorageMode) -> Result<()> {
        match mode {
            StorageMode::Local => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
            StorageMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<Binding> {
        self.index.read().get(path).cloned()
    }

    pub fn get_by_remote_id(&self, remote_page_id: &str) -> Option<Binding> {
        self.index.read().get_by_remote_id(remote_page_id).cloned()
    }

    /// All bindings ordered by path
    pub fn all(&self) -> Vec<Binding> {
        self.index.read().all()
    }

    /// Copy of the current index, taken once at run start
    pub fn snapshot(&self) -> BindingSnapshot {
        self.index.read().clone()
    }

    /// Atomically create or replace the binding for `binding.path`
    pub fn upsert(&self, binding: &Binding) -> Result<()> {
        let displaced = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let displaced = upsert_binding(&tx, binding)?;
            tx.commit()?;
            displaced
        };

        if let Some(ref other) = displaced {
            tracing::warn!(
                path = %binding.path,
                previous_path = %other,
                remote_page_id = %binding.remote_page_id,
                "Remote page rebound to a new path"
            );
        }

        self.index.write().insert(binding.clone());
        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Check if the database lives in a cloud-synced folder
    pub fn is_in_cloud_folder(&self) -> bool {
        let path = self.config.db_path.to_lowercase();
        path.contains("dropbox")
            || path.contains("onedrive")
            || path.contains("icloud")
            || path.contains("google drive")
    }

    /// Get warning if storage mode doesn't match folder type
    pub fn storage_mode_warning(&self) -> Option<String> {
        if self.is_in_cloud_folder() && self.config.storage_mode == StorageMode::Local {
            Some(format!(
                "State database '{}' appears to be in a cloud-synced folder. \
                WAL mode may cause corruption; set VAULTSYNC_STORAGE_MODE=cloud-safe \
                or move the database to a local folder.",
                self.config.db_path
            ))
        } else {
            None
        }
    }
}

impl Clone for IdentityStore {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
            index: self.index.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn binding(path: &str, id: &str, version: i64, hash: &str) -> Binding {
        Binding {
            path: path.to_string(),
            remote_page_id: id.to_string(),
            remote_version: version,
            content_hash: hash.to_string(),
            last_synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_in_memory() {
        let store = IdentityStore::open_in_memory().unwrap();
        assert_eq!(store.db_path(), ":memory:");
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_upsert_updates_index() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.upsert(&binding("notes/a.md", "42", 1, "H1")).unwrap();
        store.upsert(&binding("notes/a.md", "42", 2, "H2")).unwrap();

        let found = store.get("notes/a.md").unwrap();
        assert_eq!(found.remote_version, 2);
        assert_eq!(found.content_hash, "H2");
        assert_eq!(store.get_by_remote_id("42").unwrap().path, "notes/a.md");
    }

    #[test]
    fn test_rebind_keeps_one_live_binding_per_remote_id() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.upsert(&binding("old.md", "7", 1, "A")).unwrap();
        store.upsert(&binding("new.md", "7", 2, "B")).unwrap();

        assert!(store.get("old.md").is_none());
        assert_eq!(store.get_by_remote_id("7").unwrap().path, "new.md");
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn test_bindings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state").join("vaultsync.db");
        let config = StorageConfig {
            db_path: db_path.to_string_lossy().to_string(),
            storage_mode: StorageMode::Local,
        };

        {
            let store = IdentityStore::open(config.clone()).unwrap();
            store.upsert(&binding("a.md", "1", 3, "H")).unwrap();
        }

        let reopened = IdentityStore::open(config).unwrap();
        let found = reopened.get("a.md").unwrap();
        assert_eq!(found.remote_page_id, "1");
        assert_eq!(found.remote_version, 3);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.upsert(&binding("a.md", "1", 1, "H")).unwrap();
        let snapshot = store.snapshot();
        store.upsert(&binding("a.md", "1", 2, "H2")).unwrap();

        assert_eq!(snapshot.get("a.md").unwrap().remote_version, 1);
        assert_eq!(store.get("a.md").unwrap().remote_version, 2);
    }

    #[test]
    fn test_cloud_folder_warning() {
        let store = IdentityStore::open_in_memory().unwrap();
        assert!(store.storage_mode_warning().is_none());

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir
            .path()
            .join("Dropbox")
            .join("vaultsync.db")
            .to_string_lossy()
            .to_string();

        let local = IdentityStore::open(StorageConfig {
            db_path: db_path.clone(),
            storage_mode: StorageMode::Local,
        })
        .unwrap();
        assert!(local.is_in_cloud_folder());
        let warning = local.storage_mode_warning().unwrap();
        assert!(warning.contains("cloud-safe"));
        assert!(warning.contains(&db_path));
        drop(local);

        let cloud_safe = IdentityStore::open(StorageConfig {
            db_path,
            storage_mode: StorageMode::CloudSafe,
        })
        .unwrap();
        assert!(cloud_safe.storage_mode_warning().is_none());
    }
}
