//! Embedded transactional metadata store for the mule services.
//!
//! Both the cache and the RLS persist their state through [`Store`], a thin
//! layer over an embedded SQLite database configured for write-ahead logging
//! with relaxed sync. Every mutation runs inside a transaction through
//! [`Store::with_tx`], which retries transparently when the engine reports
//! lock contention. A background task started with
//! [`Store::spawn_checkpointer`] checkpoints the write-ahead log
//! periodically; the checkpoint is the recovery boundary.
//!
//! The two schemas live here as well: [`CacheDb`], the unique-key map of
//! cache records, and [`RlsDb`], the duplicate-permitting map of replica
//! locations.

pub use blocking::{run_blocking_task, Cancelled};
pub use cache_db::{CacheDb, Record, Status};
pub use rls_db::RlsDb;
pub use store::{Store, StoreError, CHECKPOINT_INTERVAL};

mod blocking;
mod cache_db;
mod rls_db;
mod store;
