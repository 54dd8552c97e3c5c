use std::{collections::BTreeMap, path::Path};

use rusqlite::{OptionalExtension, Transaction};

use crate::store::{Store, StoreError, CHECKPOINT_INTERVAL};

/// The duplicate-permitting map of replica locations, persisted at
/// `<home>/var/rls/`.
///
/// Many physical file names may map to one logical file name, but a single
/// `(lfn, pfn)` pair is unique. Idempotence is enforced by reading the exact
/// pair and conditionally inserting, all inside one transaction.
#[derive(Clone)]
pub struct RlsDb {
    store: Store,
}

impl RlsDb {
    pub fn open(home: &Path) -> Result<Self, StoreError> {
        let store = Store::open(&home.join("var").join("rls"), "rls")?;
        store.with_tx(|tx| {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS map (
                    lfn TEXT NOT NULL,
                    pfn TEXT NOT NULL,
                    PRIMARY KEY (lfn, pfn)
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

    /// Add the `(lfn, pfn)` mapping. Adding an existing pair is a no-op.
    pub fn add(&self, lfn: &str, pfn: &str) -> Result<(), StoreError> {
        self.store.with_tx(|tx| add_in(tx, lfn, pfn))
    }

    /// Add a batch of mappings in a single transaction.
    pub fn multiadd(&self, pairs: &[(String, String)]) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            for (lfn, pfn) in pairs {
                add_in(tx, lfn, pfn)?;
            }
            Ok(())
        })
    }

    /// Delete the exact pair, or every pair for `lfn` when `pfn` is `None`.
    ///
    /// Deleting an absent pair is a no-op.
    pub fn delete(&self, lfn: &str, pfn: Option<&str>) -> Result<(), StoreError> {
        self.store.with_tx(|tx| delete_in(tx, lfn, pfn))
    }

    /// Delete a batch of mappings in a single transaction.
    pub fn multidelete(&self, pairs: &[(String, Option<String>)]) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            for (lfn, pfn) in pairs {
                delete_in(tx, lfn, pfn.as_deref())?;
            }
            Ok(())
        })
    }

    /// All physical file names mapped to `lfn`. Unknown names yield an empty
    /// list, not an error.
    pub fn lookup(&self, lfn: &str) -> Result<Vec<String>, StoreError> {
        self.store.with_tx(|tx| lookup_in(tx, lfn))
    }

    /// Look up a batch of logical file names in one transaction.
    pub fn multilookup(&self, lfns: &[String]) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        self.store.with_tx(|tx| {
            let mut results = BTreeMap::new();
            for lfn in lfns {
                results.insert(lfn.clone(), lookup_in(tx, lfn)?);
            }
            Ok(results)
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.with_tx(|tx| {
            tx.execute("DELETE FROM map", [])?;
            Ok(())
        })
    }
}

fn add_in(tx: &Transaction<'_>, lfn: &str, pfn: &str) -> Result<(), StoreError> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM map WHERE lfn = ?1 AND pfn = ?2",
            (lfn, pfn),
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        tx.execute("INSERT INTO map (lfn, pfn) VALUES (?1, ?2)", (lfn, pfn))?;
    }
    Ok(())
}

fn delete_in(tx: &Transaction<'_>, lfn: &str, pfn: Option<&str>) -> Result<(), StoreError> {
    match pfn {
        None => tx.execute("DELETE FROM map WHERE lfn = ?1", [lfn])?,
        Some(pfn) => tx.execute("DELETE FROM map WHERE lfn = ?1 AND pfn = ?2", (lfn, pfn))?,
    };
    Ok(())
}

fn lookup_in(tx: &Transaction<'_>, lfn: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = tx.prepare("SELECT pfn FROM map WHERE lfn = ?1 ORDER BY pfn")?;
    let rows = stmt.query_map([lfn], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
