//! Persistent SQLite storage for the watch list.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where the watch list lives between restarts.
pub trait AddressStore: Send + Sync {
    /// Addresses in the order they were added.
    fn load_addresses(&self) -> Result<Vec<String>, StoreError>;
    /// Replace the stored list with `addresses`.
    fn save_addresses(&self, addresses: &[String]) -> Result<(), StoreError>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// In-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let db = Self::init(Connection::open(path)?)?;
        info!("Opened database {:?} ({} watched addresses)", path, db.count()?);
        Ok(db)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS watched_addresses (
                address TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                saved_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_watched_position ON watched_addresses(position);
        "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM watched_addresses", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl AddressStore for Database {
    fn load_addresses(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT address FROM watched_addresses ORDER BY position")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let addresses = rows.collect::<Result<Vec<_>, _>>()?;
        debug!("Loaded {} watched addresses", addresses.len());
        Ok(addresses)
    }

    fn save_addresses(&self, addresses: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM watched_addresses", [])?;
        let saved_at = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO watched_addresses (address, position, saved_at) VALUES (?1, ?2, ?3)",
            )?;
            for (position, address) in addresses.iter().enumerate() {
                stmt.execute(params![address, position as i64, saved_at])?;
            }
        }
        tx.commit()?;
        debug!("Saved {} watched addresses", addresses.len());
        Ok(())
    }
}
