use std::{fmt, path::Path};

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreError, CHECKPOINT_INTERVAL};

/// Lifecycle state of a cache record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// A download is in progress; the content file may not exist yet.
    Unready,
    /// The content file exists and is complete.
    Ready,
    /// Every source was exhausted without producing the file.
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unready => "unready",
            Status::Ready => "ready",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metadata record per logical file name.
///
/// The content identifier is not stored: it is always derived as the SHA1 of
/// the logical file name, so every node agrees on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub lfn: String,
    pub status: Status,
}

/// The unique-key map of cache records, persisted at `<home>/var/cache/`.
#[derive(Clone)]
pub struct CacheDb {
    store: Store,
}

impl CacheDb {
    pub fn open(home: &Path) -> Result<Self, StoreError> {
        let store = Store::open(&home.join("var").join("cache"), "cache")?;
        store.with_tx(|tx| {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS cache (
                    lfn TEXT PRIMARY KEY,
                    status TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        })?;
        Ok(Self { store })
    }

    /// Start the periodic checkpoint task for this database.
    pub fn spawn_checkpointer(&self) -> tokio::task::JoinHandle<()> {
        self.store.spawn_checkpointer(CHECKPOINT_INTERVAL)
    }

    pub fn close(&self) {
        self.store.close();
    }

    pub fn get(&self, lfn: &str) -> Result<Option<Record>, StoreError> {
        self.store.with_tx(|tx| {
            let status: Option<String> = tx
                .query_row("SELECT status FROM cache WHERE lfn = ?1", [lfn], |row| {
                    row.get(0)
                })
                .optional()?;
            status
                .map(|status| {
                    Ok(Record {
                        lfn: lfn.to_owned(),
                        status: parse_status(lfn, &status)?,
                    })
                })
                .transpose()
        })
    }

    /// Create the record for `lfn` in the `unready` state.
    pub fn insert_unready(&self, lfn: &str) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO cache (lfn, status) VALUES (?1, 'unready')",
                [lfn],
            )?;
            Ok(())
        })
    }

    pub fn update(&self, lfn: &str, status: Status) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO cache (lfn, status) VALUES (?1, ?2)",
                (lfn, status.as_str()),
            )?;
            Ok(())
        })
    }

    pub fn remove(&self, lfn: &str) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.execute("DELETE FROM cache WHERE lfn = ?1", [lfn])?;
            Ok(())
        })
    }

    pub fn list(&self) -> Result<Vec<Record>, StoreError> {
        self.store.with_tx(|tx| {
            let mut stmt = tx.prepare("SELECT lfn, status FROM cache ORDER BY lfn")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut records = Vec::new();
            for row in rows {
                let (lfn, status) = row?;
                let status = parse_status(&lfn, &status)?;
                records.push(Record { lfn, status });
            }
            Ok(records)
        })
    }

    /// All logical file names with a record, regardless of status.
    pub fn lfns(&self) -> Result<Vec<String>, StoreError> {
        self.store.with_tx(|tx| {
            let mut stmt = tx.prepare("SELECT lfn FROM cache ORDER BY lfn")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.execute("DELETE FROM cache", [])?;
            Ok(())
        })
    }
}

fn parse_status(lfn: &str, status: &str) -> Result<Status, StoreError> {
    match status {
        "unready" => Ok(Status::Unready),
        "ready" => Ok(Status::Ready),
        "failed" => Ok(Status::Failed),
        other => Err(StoreError::UnknownStatus(
            lfn.to_owned(),
            other.to_owned(),
        )),
    }
}
