use std::path::PathBuf;

use mule_rpc::RpcError;
use mule_store::{Cancelled, Status, StoreError};

use crate::download::DownloadError;

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// Validation: the destination of a `get` is already present. Nothing
    /// was mutated.
    #[error("destination {0} already exists")]
    DestinationExists(PathBuf),

    /// Validation: the source of a `put` is missing. Nothing was mutated.
    #[error("source {0} does not exist")]
    SourceMissing(PathBuf),

    /// The record for this name is in the `failed` state; remove it with
    /// force before retrying.
    #[error("unable to get {0}: failed")]
    Failed(String),

    /// The record claims `ready` but the content file is gone. Remove the
    /// record with force and fetch again.
    #[error("{0} is ready but its cached file is missing")]
    MissingContent(String),

    /// A coalesced waiter found the record deleted out from under it.
    #[error("record disappeared for {0}")]
    RecordDisappeared(String),

    /// Refusing to remove a record that is not `ready` without force.
    #[error("cannot remove {lfn}: record is {status}")]
    NotRemovable { lfn: String, status: Status },

    /// A Bloom filter was requested with a zero dimension.
    #[error("bloom filter parameters must be positive")]
    InvalidFilterParams,

    /// The download queue is gone; the service is shutting down.
    #[error("the download queue is shut down")]
    Shutdown,

    /// A blocking store task was cancelled by runtime shutdown.
    #[error("the operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("RLS request failed")]
    Rls(#[source] RpcError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<Cancelled> for CacheError {
    fn from(_: Cancelled) -> Self {
        CacheError::Cancelled
    }
}
