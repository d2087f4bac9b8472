//! Data stores.
//!
//! A node holds an item either because it published it, or because a STORE
//! RPC assigned it the item as one of the k closest nodes to the key. Each
//! item carries publisher metadata driving the republish/replicate/expire
//! lifecycle. Timestamps are Unix seconds: ages travel on the wire as
//! relative values to tolerate clock skew between nodes.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use weft_types::Key;

use crate::{DhtError, Result};

/// Physical storage for a node's share of the DHT.
///
/// Implementations guarantee atomic per-key upsert/read/delete; nothing
/// more is required, since the node mutates its store from a single task.
pub trait DataStore: Send {
    /// Insert or overwrite an item.
    fn set(
        &mut self,
        key: Key,
        value: Vec<u8>,
        last_published: u64,
        originally_published: u64,
        original_publisher: Key,
    ) -> Result<()>;

    /// The value stored under `key`, if any.
    fn get(&self, key: &Key) -> Option<Vec<u8>>;

    /// Whether `key` is present.
    fn contains(&self, key: &Key) -> bool;

    /// Remove `key`. Returns whether anything was removed.
    fn delete(&mut self, key: &Key) -> bool;

    /// All stored keys, for republish scans.
    fn keys(&self) -> Vec<Key>;

    /// The node id of the item's original publisher.
    fn original_publisher(&self, key: &Key) -> Option<Key>;

    /// Unix time the item was originally published.
    fn original_publish_time(&self, key: &Key) -> Option<u64>;

    /// Unix time the item was last pushed to this node.
    fn last_published(&self, key: &Key) -> Option<u64>;
}

#[derive(Clone, Debug)]
struct StoredItem {
    value: Vec<u8>,
    original_publisher: Key,
    originally_published: u64,
    last_published: u64,
}

/// Dictionary-backed store, the default.
#[derive(Default)]
pub struct MemoryStore {
    items: HashMap<Key, StoredItem>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl DataStore for MemoryStore {
    fn set(
        &mut self,
        key: Key,
        value: Vec<u8>,
        last_published: u64,
        originally_published: u64,
        original_publisher: Key,
    ) -> Result<()> {
        self.items.insert(
            key,
            StoredItem {
                value,
                original_publisher,
                originally_published,
                last_published,
            },
        );
        Ok(())
    }

    fn get(&self, key: &Key) -> Option<Vec<u8>> {
        self.items.get(key).map(|item| item.value.clone())
    }

    fn contains(&self, key: &Key) -> bool {
        self.items.contains_key(key)
    }

    fn delete(&mut self, key: &Key) -> bool {
        self.items.remove(key).is_some()
    }

    fn keys(&self) -> Vec<Key> {
        self.items.keys().copied().collect()
    }

    fn original_publisher(&self, key: &Key) -> Option<Key> {
        self.items.get(key).map(|item| item.original_publisher)
    }

    fn original_publish_time(&self, key: &Key) -> Option<u64> {
        self.items.get(key).map(|item| item.originally_published)
    }

    fn last_published(&self, key: &Key) -> Option<u64> {
        self.items.get(key).map(|item| item.last_published)
    }
}

/// SQLite-backed store for nodes that must survive restarts.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::init(conn)
    }

    /// Open an in-memory store (mainly for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS items (
                 key BLOB PRIMARY KEY,
                 value BLOB NOT NULL,
                 original_publisher BLOB NOT NULL,
                 originally_published INTEGER NOT NULL,
                 last_published INTEGER NOT NULL
             );",
        )
        .map_err(sql_err)?;
        Ok(Self { conn })
    }

    fn column_u64(&self, key: &Key, column: &str) -> Option<u64> {
        let sql = format!("SELECT {column} FROM items WHERE key = ?1");
        match self
            .conn
            .query_row(&sql, params![key.as_bytes().as_slice()], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
        {
            Ok(v) => v.map(|n| n as u64),
            Err(e) => {
                warn!(error = %e, "sqlite read failed");
                None
            }
        }
    }
}

impl DataStore for SqliteStore {
    fn set(
        &mut self,
        key: Key,
        value: Vec<u8>,
        last_published: u64,
        originally_published: u64,
        original_publisher: Key,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO items
                 (key, value, original_publisher, originally_published, last_published)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key.as_bytes().as_slice(),
                    value,
                    original_publisher.as_bytes().as_slice(),
                    originally_published as i64,
                    last_published as i64,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn get(&self, key: &Key) -> Option<Vec<u8>> {
        match self
            .conn
            .query_row(
                "SELECT value FROM items WHERE key = ?1",
                params![key.as_bytes().as_slice()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "sqlite read failed");
                None
            }
        }
    }

    fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    fn delete(&mut self, key: &Key) -> bool {
        match self.conn.execute(
            "DELETE FROM items WHERE key = ?1",
            params![key.as_bytes().as_slice()],
        ) {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(error = %e, "sqlite delete failed");
                false
            }
        }
    }

    fn keys(&self) -> Vec<Key> {
        let mut stmt = match self.conn.prepare("SELECT key FROM items") {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(error = %e, "sqlite scan failed");
                return Vec::new();
            }
        };
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0));
        match rows {
            Ok(rows) => rows
                .filter_map(|r| r.ok())
                .filter_map(|bytes| Key::from_bytes(&bytes))
                .collect(),
            Err(e) => {
                warn!(error = %e, "sqlite scan failed");
                Vec::new()
            }
        }
    }

    fn original_publisher(&self, key: &Key) -> Option<Key> {
        match self
            .conn
            .query_row(
                "SELECT original_publisher FROM items WHERE key = ?1",
                params![key.as_bytes().as_slice()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        {
            Ok(v) => v.and_then(|bytes| Key::from_bytes(&bytes)),
            Err(e) => {
                warn!(error = %e, "sqlite read failed");
                None
            }
        }
    }

    fn original_publish_time(&self, key: &Key) -> Option<u64> {
        self.column_u64(key, "originally_published")
    }

    fn last_published(&self, key: &Key) -> Option<u64> {
        self.column_u64(key, "last_published")
    }
}

fn sql_err(e: rusqlite::Error) -> DhtError {
    DhtError::Storage(e.to_string())
}
