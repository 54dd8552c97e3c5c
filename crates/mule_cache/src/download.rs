//! The download worker pool.
//!
//! Requests are queued by the coalescing engine and consumed by a fixed
//! number of worker tasks. Each request carries a oneshot slot through which
//! the worker reports success or the error that exhausted every source.

use std::{path::PathBuf, sync::Arc};

use dashmap::DashMap;
use mule_store::{run_blocking_task, CacheDb, Status};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::{content_path, error::CacheError, fetch, uuid_for};

/// Bound of the download queue; senders back off when the pool falls behind.
pub(crate) const QUEUE_DEPTH: usize = 1024;

/// Why a download produced no usable replica.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The RLS knows no replicas and the name itself is not a URL.
    #[error("{0} not found in RLS")]
    NoReplicas(String),

    /// Every source was tried; none produced the file.
    #[error("unable to get {0}: all sources failed")]
    AllSourcesFailed(String),

    /// The content store itself could not be written.
    #[error("cannot stage {lfn}")]
    Stage {
        lfn: String,
        #[source]
        source: std::io::Error,
    },
}

/// One unit of work for the pool.
pub(crate) struct DownloadRequest {
    pub lfn: String,
    pub pfns: Vec<String>,
    pub done: oneshot::Sender<Result<(), DownloadError>>,
}

/// The state a worker needs, detached from the service handle so running
/// workers do not keep a closed service alive.
#[derive(Clone)]
pub(crate) struct Downloader {
    pub db: CacheDb,
    pub client: reqwest::Client,
    pub cache_dir: PathBuf,
    pub inflight: Arc<DashMap<String, Arc<Notify>>>,
}

impl Downloader {
    /// Start `workers` tasks consuming the shared queue. Workers exit when
    /// every sender is gone.
    pub fn spawn_workers(self, workers: usize, rx: mpsc::Receiver<DownloadRequest>) {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for n in 0..workers.max(1) {
            let worker = self.clone();
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                tracing::debug!("download worker {n} started");
                loop {
                    // Hold the receiver lock only across the dequeue, so
                    // downloads run concurrently.
                    let request = rx.lock().await.recv().await;
                    let Some(request) = request else { break };
                    worker.run(request).await;
                }
                tracing::debug!("download worker {n} stopped");
            });
        }
    }

    async fn run(&self, request: DownloadRequest) {
        let DownloadRequest { lfn, pfns, done } = request;
        let result = self.fetch_one_of(&lfn, pfns).await;
        let status = match &result {
            Ok(()) => Status::Ready,
            Err(err) => {
                tracing::warn!("download of {lfn} failed: {err}");
                Status::Failed
            }
        };

        let db = self.db.clone();
        let record = lfn.clone();
        let updated: Result<(), CacheError> =
            run_blocking_task(move || Ok(db.update(&record, status)?)).await;
        if let Err(err) = updated {
            tracing::error!("failed to mark {lfn} {status}: {err}");
        }

        // Wake coalesced waiters only after the record reflects the outcome.
        if let Some((_, notify)) = self.inflight.remove(&lfn) {
            notify.notify_waiters();
        }
        let _ = done.send(result);
    }

    /// Try each source in order, stopping at the first success.
    ///
    /// A name that is itself a URL is appended as the last-resort source, so
    /// files first published elsewhere stay reachable with an empty RLS.
    async fn fetch_one_of(&self, lfn: &str, mut pfns: Vec<String>) -> Result<(), DownloadError> {
        if ["http:", "https:", "file:", "ftp:"]
            .iter()
            .any(|scheme| lfn.starts_with(scheme))
        {
            pfns.push(lfn.to_owned());
        }
        if pfns.is_empty() {
            return Err(DownloadError::NoReplicas(lfn.to_owned()));
        }

        let uuid = uuid_for(lfn);
        let cfn = content_path(&self.cache_dir, &uuid);
        if cfn.exists() {
            tracing::warn!("duplicate uuid detected: {uuid}");
        }
        if let Some(parent) = cfn.parent() {
            fetch::ensure_dir(parent)
                .await
                .map_err(|source| DownloadError::Stage {
                    lfn: lfn.to_owned(),
                    source,
                })?;
        }

        for pfn in &pfns {
            tracing::debug!("downloading {lfn} from {pfn}");
            match fetch::download(&self.client, pfn, &cfn).await {
                Ok(()) => return Ok(()),
                Err(err) => tracing::warn!("download of {pfn} failed: {err}"),
            }
        }
        Err(DownloadError::AllSourcesFailed(lfn.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use dashmap::DashMap;
    use mule_store::CacheDb;
    use tempfile::tempdir;

    use super::{DownloadError, Downloader};

    fn downloader(home: &std::path::Path, cache_dir: &std::path::Path) -> Downloader {
        Downloader {
            db: CacheDb::open(home).unwrap(),
            client: reqwest::Client::new(),
            cache_dir: cache_dir.to_path_buf(),
            inflight: Arc::new(DashMap::new()),
        }
    }

    #[tokio::test]
    async fn no_sources_and_plain_name_is_a_resolution_error() {
        let home = tempdir().unwrap();
        let store = tempdir().unwrap();
        let dl = downloader(home.path(), store.path());
        let err = dl.fetch_one_of("data/x", Vec::new()).await.unwrap_err();
        assert_matches!(err, DownloadError::NoReplicas(_));
    }

    #[tokio::test]
    async fn url_shaped_name_is_its_own_last_resort() {
        let home = tempdir().unwrap();
        let store = tempdir().unwrap();
        let scratch = tempdir().unwrap();

        let source = scratch.path().join("origin.dat");
        tokio::fs::write(&source, b"origin bytes").await.unwrap();
        let lfn = url::Url::from_file_path(&source).unwrap().to_string();

        let dl = downloader(home.path(), store.path());
        dl.fetch_one_of(&lfn, Vec::new()).await.unwrap();

        let cfn = crate::content_path(store.path(), &crate::uuid_for(&lfn));
        assert_eq!(tokio::fs::read(&cfn).await.unwrap(), b"origin bytes");
    }

    #[tokio::test]
    async fn unreachable_sources_exhaust() {
        let home = tempdir().unwrap();
        let store = tempdir().unwrap();
        let dl = downloader(home.path(), store.path());
        let err = dl
            .fetch_one_of(
                "data/x",
                vec![
                    "http://127.0.0.1:1/x".to_owned(),
                    "http://127.0.0.1:1/y".to_owned(),
                ],
            )
            .await
            .unwrap_err();
        assert_matches!(err, DownloadError::AllSourcesFailed(_));
    }
}
