//! Persistence for facts, settings, reminders and learned aliases
//!
//! The assistant core only needs namespaced key/value pairs and append-only
//! lists, so that is all [`PersistenceStore`] exposes.

mod schema;

use std::path::Path;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension;

use crate::{Error, Result};

pub use schema::SCHEMA_VERSION;

/// Namespace for user facts ("my X is Y")
pub const FACTS: &str = "facts";

/// Namespace for assistant settings such as the timezone
pub const META: &str = "meta";

/// List of stored reminders (JSON items)
pub const REMINDERS: &str = "reminders";

/// List of learned hotword aliases
pub const HOTWORD_ALIASES: &str = "hotword_aliases";

/// Narrow persistence interface used by turn handling and the hotword matcher
pub trait PersistenceStore: Send + Sync {
    /// Read one value
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    /// Insert or replace one value
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    /// All pairs in a namespace, sorted by key
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>>;

    /// Append an item to a list
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    fn append(&self, list: &str, item: &str) -> Result<()>;

    /// Items of a list in insertion order
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    fn list(&self, list: &str) -> Result<Vec<String>>;

    /// Cheap reachability check
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unusable
    fn ping(&self) -> Result<()> {
        self.get(META, "ping").map(|_| ())
    }
}

/// Store that remembers nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl PersistenceStore for NullStore {
    fn get(&self, _namespace: &str, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn put(&self, _namespace: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn entries(&self, _namespace: &str) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    fn append(&self, _list: &str, _item: &str) -> Result<()> {
        Ok(())
    }

    fn list(&self, _list: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// `SQLite`-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| Error::Store(e.to_string()))?;
        Self::with_pool(pool)
    }

    /// Open an in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be initialized
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Store(e.to_string()))?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: DbPool) -> Result<Self> {
        let conn = pool.get().map_err(|e| Error::Store(e.to_string()))?;
        schema::init(&conn)?;
        tracing::info!(version = SCHEMA_VERSION, "store initialized");
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Store(e.to_string()))
    }
}

impl PersistenceStore for SqliteStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                [namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key)
             DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            [namespace, key, value],
        )?;
        Ok(())
    }

    fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY key")?;
        let rows = stmt
            .query_map([namespace], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn append(&self, list: &str, item: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO list_items (list, item) VALUES (?1, ?2)",
            [list, item],
        )?;
        Ok(())
    }

    fn list(&self, list: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT item FROM list_items WHERE list = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([list], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_overwrites() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(FACTS, "favorite_color", "blue").unwrap();
        store.put(FACTS, "favorite_color", "green").unwrap();
        assert_eq!(
            store.get(FACTS, "favorite_color").unwrap().as_deref(),
            Some("green")
        );
        assert_eq!(store.get(META, "favorite_color").unwrap(), None);
    }

    #[test]
    fn test_entries_sorted_by_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(FACTS, "pet", "cat").unwrap();
        store.put(FACTS, "car", "red").unwrap();
        let entries = store.entries(FACTS).unwrap();
        assert_eq!(
            entries,
            vec![
                ("car".to_string(), "red".to_string()),
                ("pet".to_string(), "cat".to_string())
            ]
        );
    }

    #[test]
    fn test_lists_keep_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(HOTWORD_ALIASES, "jarvi").unwrap();
        store.append(REMINDERS, "{}").unwrap();
        store.append(HOTWORD_ALIASES, "jervis").unwrap();
        assert_eq!(store.list(HOTWORD_ALIASES).unwrap(), vec!["jarvi", "jervis"]);
        assert_eq!(store.list(REMINDERS).unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.db");
        SqliteStore::open(&path)
            .unwrap()
            .put(META, "timezone", "UTC")
            .unwrap();

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get(META, "timezone").unwrap().as_deref(), Some("UTC"));
        reopened.ping().unwrap();
    }

    #[test]
    fn test_null_store_forgets() {
        let store = NullStore;
        store.put(FACTS, "a", "b").unwrap();
        assert_eq!(store.get(FACTS, "a").unwrap(), None);
        assert!(store.list(REMINDERS).unwrap().is_empty());
    }
}
