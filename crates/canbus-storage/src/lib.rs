//! Canbus Storage -- persistent node properties.
//!
//! Stands in for the boot PROM's property store: string names mapped to
//! string values that survive a restart (console owner, boot device,
//! input/output device, ...). WAL mode + busy_timeout so a CLI tool can read
//! while the node runs.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA_VERSION: u32 = 1;

/// Property names used by the node.
pub mod names {
    pub const CANCON_HOST: &str = "cancon-host";
    pub const AUTO_BOOT: &str = "auto-boot?";
    pub const BOOT_DEVICE: &str = "boot-device";
    pub const BOOT_FILE: &str = "boot-file";
    pub const INPUT_DEVICE: &str = "input-device";
    pub const OUTPUT_DEVICE: &str = "output-device";
}

pub trait PropertyStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<(String, String)>>;

    /// Write each default whose name has no value yet.
    fn seed_defaults(&self, defaults: &[(&str, &str)]) -> Result<()> {
        for (name, value) in defaults {
            if self.get(name)?.is_none() {
                self.set(name, value)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// SQLite
// ============================================================================

pub struct SqliteProperties {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteProperties {
    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: PathBuf::from(":memory:"),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(include_str!("schema_v1.sql"))?;

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        Ok(())
    }
}

impl PropertyStore for SqliteProperties {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let conn = self.db()?;
        let value = conn
            .query_row(
                "SELECT value FROM properties WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let conn = self.db()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO properties (name, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, value, now],
        )?;
        tracing::debug!(name, value, "property set");
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, String)>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare("SELECT name, value FROM properties ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Volatile store for tests and diskless nodes.
#[derive(Default)]
pub struct MemoryProperties {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryProperties {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryProperties {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let map = self.map.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(map.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().map_err(|_| StorageError::LockPoisoned)?;
        map.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, String)>> {
        let map = self.map.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, SqliteProperties) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteProperties::open(&dir.path().join("props.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_get_set_overwrite() {
        let (_dir, store) = test_db();
        assert!(store.get(names::BOOT_DEVICE).unwrap().is_none());

        store.set(names::BOOT_DEVICE, "disk").unwrap();
        assert_eq!(store.get(names::BOOT_DEVICE).unwrap().as_deref(), Some("disk"));

        store.set(names::BOOT_DEVICE, "net").unwrap();
        assert_eq!(store.get(names::BOOT_DEVICE).unwrap().as_deref(), Some("net"));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("props.db");
        {
            let store = SqliteProperties::open(&path).unwrap();
            store.set(names::CANCON_HOST, "4227858495").unwrap();
        }
        let store = SqliteProperties::open(&path).unwrap();
        assert_eq!(
            store.get(names::CANCON_HOST).unwrap().as_deref(),
            Some("4227858495")
        );
    }

    #[test]
    fn test_seed_defaults_keeps_existing() {
        let store = SqliteProperties::open_in_memory().unwrap();
        store.set(names::INPUT_DEVICE, "ttya").unwrap();
        store
            .seed_defaults(&[(names::INPUT_DEVICE, "keyboard"), (names::OUTPUT_DEVICE, "screen")])
            .unwrap();
        assert_eq!(store.get(names::INPUT_DEVICE).unwrap().as_deref(), Some("ttya"));
        assert_eq!(store.get(names::OUTPUT_DEVICE).unwrap().as_deref(), Some("screen"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryProperties::new();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();
        assert_eq!(
            store.list().unwrap(),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
    }
}
