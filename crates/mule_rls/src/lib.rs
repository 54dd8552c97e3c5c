//! The Replica Location Service (RLS).
//!
//! A cluster-wide, duplicate-permitting map from logical file names to the
//! physical file names (URLs) of their replicas. Each per-node cache
//! registers its own copies here and resolves other nodes' copies from here.
//! All mutations are transactional; lock contention in the store is retried
//! transparently.

pub use client::RlsClient;
pub use service::{Rls, RlsError};

mod client;
mod service;
