use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};

/// How often the background maintenance task checkpoints the write-ahead log.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);

/// Maximum attempts for a transaction that keeps hitting lock contention.
const TX_RETRIES: u32 = 3;

/// A handle to an embedded database.
///
/// The handle is cheap to clone; all clones share one connection. Writes are
/// configured for throughput (`synchronous=OFF`): durability between
/// checkpoints is relaxed, and the write-ahead log provides automatic
/// recovery on the next open after a crash.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database `<dir>/<name>.db`.
    pub fn open(dir: &Path, name: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{name}.db"));
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // An ample lock budget: writers queue here instead of failing fast.
        conn.busy_timeout(Duration::from_secs(5))?;
        tracing::debug!("opened store at {}", path.display());
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The on-disk location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`. A
    /// busy/locked engine error is retried transparently up to three
    /// attempts, then surfaced. Inner operations compose by taking
    /// `&Transaction`, so one `with_tx` scope never nests another.
    pub fn with_tx<T>(
        &self,
        mut f: impl FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut deadlocks = 0;
        loop {
            let result = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StoreError::from)
                .and_then(|tx| {
                    let value = f(&tx)?;
                    tx.commit()?;
                    Ok(value)
                });
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() => {
                    deadlocks += 1;
                    if deadlocks < TX_RETRIES {
                        tracing::info!("store contention detected, retrying transaction");
                        continue;
                    }
                    tracing::error!("store contention persisted across {deadlocks} attempts");
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Checkpoint the write-ahead log, truncating it afterwards.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Spawn the periodic maintenance task.
    ///
    /// The task checkpoints every `interval` and logs failures without
    /// dying. It exits on its own once every other handle to the store has
    /// been dropped.
    pub fn spawn_checkpointer(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let conn = Arc::downgrade(&self.conn);
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(conn) = conn.upgrade() else {
                    break;
                };
                tracing::info!("checkpointing {}", path.display());
                let result = {
                    let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                };
                if let Err(err) = result {
                    tracing::error!("checkpoint of {} failed: {err}", path.display());
                }
            }
        })
    }

    /// Flush the write-ahead log before shutdown.
    pub fn close(&self) {
        if let Err(err) = self.checkpoint() {
            tracing::error!("final checkpoint of {} failed: {err}", self.path.display());
        }
    }
}

/// Errors surfaced by the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create store directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record for {0:?} carries unrecognized status {1:?}")]
    UnknownStatus(String, String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether the engine reported lock contention (the deadlock analogue).
    fn is_busy(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
        )
    }
}
