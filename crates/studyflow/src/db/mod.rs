//! Local snapshot of the last known job statuses.
//!
//! The cache writes through to one `entity_status` row per entity and reads
//! the table back once when a tracker starts, so the agent shows the right
//! state before the first push arrives. Rows are accessed through
//! [`status_repo`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;

pub mod error;
pub mod migrations;
pub mod status_repo;

pub use error::DatabaseError;

/// How long a write waits on a lock held by another agent process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the status snapshot. Clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<Arc<Path>>,
}

impl Database {
    /// Opens the snapshot file at `path`, creating it and its parent
    /// directory on first use.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            std::fs::create_dir_all(parent).map_err(|source| DatabaseError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self::prepare(conn, Some(path))?;

        log::info!("Status snapshot at {}", path.display());
        Ok(db)
    }

    /// Snapshot that lives as long as the handle. Used by tests.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?, None)
    }

    fn prepare(conn: Connection, path: Option<&Path>) -> Result<Self, DatabaseError> {
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.map(Arc::from),
        })
    }

    /// Location of the snapshot file; `None` when held in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Where the snapshot lives unless configured otherwise:
    /// `~/.studyflow/data/studyflow.db`.
    pub fn default_path() -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(home.join(".studyflow").join("data").join("studyflow.db"))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    /// Runs `f` with the connection held.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        f(&*self.lock()?)
    }
}
