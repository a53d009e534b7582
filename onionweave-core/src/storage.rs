// Storage connector shared by the frontier, the analyzer and the metric store

use crate::error::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// One lazily opened SQLite connection per process.
///
/// Every stage that needs durable state owns exactly one `Storage` and hands
/// it to whatever needs the database. Nothing is shared through globals.
pub struct Storage {
    path: PathBuf,
    busy_timeout: Duration,
    conn: Option<Connection>,
}

pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl Storage {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            conn: None,
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns the connection, opening it on first use.
    pub fn connection(&mut self) -> Result<&mut Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.open()?,
        };
        Ok(self.conn.insert(conn))
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        debug!("Opening database at {}", self.path.display());
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;

        // Several worker processes write concurrently
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Journal mode: {}", mode);
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(conn)
    }

    /// Runs `f` inside an immediate transaction.
    ///
    /// The transaction commits when `f` returns `Ok`. Any error, from `f` or
    /// from the commit itself, rolls back: an uncommitted `Transaction` rolls
    /// back when dropped.
    pub fn with_cursor<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Applies `schema` unless `table` already exists. Returns true when the
    /// schema was applied by this call.
    pub fn ensure_schema(&mut self, table: &str, schema: &str) -> Result<bool> {
        self.with_cursor(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![table],
                |row| row.get(0),
            )?;

            if exists {
                return Ok(false);
            }

            tx.execute_batch(schema)?;
            info!("Applied schema for table {}", table);
            Ok(true)
        })
    }

    pub fn drop(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        for suffix in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            let side = PathBuf::from(side);
            if side.exists() {
                fs::remove_file(side)?;
            }
        }
        Ok(())
    }
}
