use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use fs_err::tokio as tokio_fs;
use mule_bits::BloomFilter;
use mule_rls::RlsClient;
use mule_store::{run_blocking_task, CacheDb, Record, Status};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use crate::{
    config::CacheConfig,
    content_path,
    download::{DownloadRequest, Downloader, QUEUE_DEPTH},
    error::CacheError,
    fetch,
    stats::{Statistics, StatsSnapshot},
    uuid_for,
};

/// How long a coalesced waiter sleeps before re-checking the record when no
/// completion wakeup arrives. A crash on a previous run can leave a record
/// `unready` with no download in flight; the re-check keeps such records
/// from hanging a caller silently.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The per-node cache service.
///
/// Cheap to clone; all clones share one metadata store, one download worker
/// pool, and one set of statistics. Must be created inside a tokio runtime
/// (the worker pool is spawned on construction).
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: CacheConfig,
    db: CacheDb,
    stats: Statistics,
    /// Serializes the read-record-and-insert-if-absent window of `multiget`:
    /// the decision of which caller performs a download is made under this
    /// lock.
    admit: Mutex<()>,
    queue: mpsc::Sender<DownloadRequest>,
    inflight: Arc<DashMap<String, Arc<Notify>>>,
}

impl Cache {
    /// Open the cache: content directory, metadata store, worker pool.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        fs_err::create_dir_all(&config.cache_dir)?;
        let db = CacheDb::open(&config.home)?;
        let inflight = Arc::new(DashMap::new());
        let (queue, rx) = mpsc::channel(QUEUE_DEPTH);
        Downloader {
            db: db.clone(),
            client: reqwest::Client::new(),
            cache_dir: config.cache_dir.clone(),
            inflight: Arc::clone(&inflight),
        }
        .spawn_workers(config.workers, rx);
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                db,
                stats: Statistics::new(),
                admit: Mutex::new(()),
                queue,
                inflight,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Start the periodic store checkpoint task.
    pub fn spawn_checkpointer(&self) -> tokio::task::JoinHandle<()> {
        self.inner.db.spawn_checkpointer()
    }

    /// Flush the metadata store before shutdown.
    pub fn close(&self) {
        tracing::info!("stopping cache");
        self.inner.db.close();
    }

    /// The content file for `lfn` in this node's store.
    pub(crate) fn content_file(&self, lfn: &str) -> PathBuf {
        content_path(&self.inner.config.cache_dir, &uuid_for(lfn))
    }

    pub(crate) fn content_file_for_uuid(&self, uuid: &str) -> PathBuf {
        content_path(&self.inner.config.cache_dir, uuid)
    }

    pub(crate) fn block_size(&self) -> usize {
        self.inner.config.block_size
    }

    /// The PFN under which this node advertises `lfn`.
    pub fn self_pfn(&self, lfn: &str) -> String {
        format!(
            "http://{}:{}/{}",
            self.inner.config.hostname,
            self.inner.config.port,
            uuid_for(lfn)
        )
    }

    fn rls_client(&self) -> RlsClient {
        RlsClient::connect(self.inner.config.rls.clone())
    }

    /// Ensure `lfn` is cached locally and materialize it at `path`.
    pub async fn get(&self, lfn: String, path: PathBuf, symlink: bool) -> Result<Status, CacheError> {
        tracing::debug!("get {lfn} {}", path.display());
        self.multiget(vec![(lfn, path)], symlink).await?;
        Ok(Status::Ready)
    }

    /// For each `(lfn, path)` pair, ensure `lfn` is cached and materialize
    /// it at `path`. Completes when every pair is served; the first failure
    /// fails the whole call.
    ///
    /// At most one download per name runs on this node, no matter how many
    /// callers ask concurrently: the first caller to claim an absent record
    /// enqueues the download, everyone else waits on the record flipping to
    /// `ready`.
    pub async fn multiget(
        &self,
        pairs: Vec<(String, PathBuf)>,
        symlink: bool,
    ) -> Result<(), CacheError> {
        // Validation up front, before any state changes.
        for (_, path) in &pairs {
            if path.exists() {
                return Err(CacheError::DestinationExists(path.clone()));
            }
        }

        let mut created: Vec<(String, PathBuf)> = Vec::new();
        let mut ready: Vec<(String, PathBuf)> = Vec::new();
        let mut unready: Vec<(String, PathBuf)> = Vec::new();

        for (lfn, path) in pairs {
            self.inner.stats.gets.increment();
            let existing = match self.record(&lfn).await? {
                Some(record) => record,
                None => {
                    let _admit = self.inner.admit.lock().await;
                    match self.record(&lfn).await? {
                        Some(record) => record,
                        None => {
                            // Claim the download by inserting the record
                            // while still holding the lock.
                            self.insert_unready(&lfn).await?;
                            self.inner.stats.misses.increment();
                            created.push((lfn, path));
                            continue;
                        }
                    }
                }
            };
            match existing.status {
                Status::Ready => {
                    self.inner.stats.hits.increment();
                    ready.push((lfn, path));
                }
                Status::Unready => {
                    self.inner.stats.near_misses.increment();
                    unready.push((lfn, path));
                }
                Status::Failed => {
                    self.inner.stats.failures.increment();
                    return Err(CacheError::Failed(lfn));
                }
            }
        }

        let rls = self.rls_client();

        // Resolve every claimed name with one bulk lookup, then hand the
        // downloads to the pool.
        let mut waiting = Vec::new();
        if !created.is_empty() {
            let lfns: Vec<String> = created.iter().map(|(lfn, _)| lfn.clone()).collect();
            let mut mappings = rls.multilookup(lfns).await.map_err(CacheError::Rls)?;
            for (lfn, _) in &created {
                let pfns = mappings.remove(lfn).unwrap_or_default();
                let (done, wait) = oneshot::channel();
                self.inner
                    .queue
                    .send(DownloadRequest {
                        lfn: lfn.clone(),
                        pfns,
                        done,
                    })
                    .await
                    .map_err(|_| CacheError::Shutdown)?;
                waiting.push((lfn.clone(), wait));
            }
        }

        // Hits are served while the pool works.
        for (lfn, path) in &ready {
            self.get_cached(lfn, path, symlink).await?;
        }

        if !waiting.is_empty() {
            let mut registrations = Vec::new();
            let mut first_error: Option<CacheError> = None;
            for (lfn, wait) in waiting {
                match wait.await {
                    Ok(Ok(())) => registrations.push((lfn.clone(), self.self_pfn(&lfn))),
                    Ok(Err(err)) => {
                        self.inner.stats.failures.increment();
                        if first_error.is_none() {
                            first_error = Some(err.into());
                        }
                    }
                    Err(_) => {
                        if first_error.is_none() {
                            first_error = Some(CacheError::Shutdown);
                        }
                    }
                }
            }
            // One registration batch per call, after every download settled.
            if !registrations.is_empty() {
                rls.multiadd(registrations).await.map_err(CacheError::Rls)?;
            }
            if let Some(err) = first_error {
                return Err(err);
            }
            unready.extend(created);
        }

        self.await_unready(unready, symlink).await
    }

    /// Wait for records other callers are downloading, serving each as it
    /// becomes ready. Fails fast on the first `failed` record.
    async fn await_unready(
        &self,
        mut unready: Vec<(String, PathBuf)>,
        symlink: bool,
    ) -> Result<(), CacheError> {
        while !unready.is_empty() {
            let mut still = Vec::new();
            for (lfn, path) in unready {
                match self.record(&lfn).await? {
                    None => return Err(CacheError::RecordDisappeared(lfn)),
                    Some(record) => match record.status {
                        Status::Ready => self.get_cached(&lfn, &path, symlink).await?,
                        Status::Failed => {
                            self.inner.stats.failures.increment();
                            return Err(CacheError::Failed(lfn));
                        }
                        Status::Unready => still.push((lfn, path)),
                    },
                }
            }
            if let Some((lfn, _)) = still.first() {
                let notify = self
                    .inner
                    .inflight
                    .entry(lfn.clone())
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .clone();
                let _ = tokio::time::timeout(POLL_INTERVAL, notify.notified()).await;
            }
            unready = still;
        }
        Ok(())
    }

    /// Materialize an already-cached `lfn` at `path`.
    async fn get_cached(&self, lfn: &str, path: &Path, symlink: bool) -> Result<(), CacheError> {
        let cfn = self.content_file(lfn);
        if !cfn.exists() {
            return Err(CacheError::MissingContent(lfn.to_owned()));
        }
        // Destinations may live in nested working directories.
        if let Some(parent) = path.parent() {
            fetch::ensure_dir(parent).await?;
        }
        if symlink {
            #[cfg(unix)]
            tokio_fs::symlink(&cfn, path).await?;
            #[cfg(not(unix))]
            fetch::copy_file(&cfn, path, self.inner.config.block_size).await?;
        } else {
            fetch::copy_file(&cfn, path, self.inner.config.block_size).await?;
        }
        Ok(())
    }

    /// Publish a local file as `lfn`.
    pub async fn put(&self, path: PathBuf, lfn: String, rename: bool) -> Result<(), CacheError> {
        tracing::debug!("put {} {lfn}", path.display());
        self.multiput(vec![(path, lfn)], rename).await
    }

    /// Publish a batch of local files, registering all new mappings with the
    /// RLS in one call.
    pub async fn multiput(
        &self,
        pairs: Vec<(PathBuf, String)>,
        rename: bool,
    ) -> Result<(), CacheError> {
        for (path, _) in &pairs {
            if !path.exists() {
                return Err(CacheError::SourceMissing(path.clone()));
            }
        }

        let mut registrations = Vec::new();
        for (path, lfn) in pairs {
            self.inner.stats.puts.increment();

            if self.record(&lfn).await?.is_some() {
                tracing::warn!("{lfn} already cached");
                self.inner.stats.duplicates.increment();
                continue;
            }

            let cfn = self.content_file(&lfn);
            if cfn.exists() {
                tracing::warn!("possible duplicate uuid detected for {lfn}");
            }
            if let Some(parent) = cfn.parent() {
                fetch::ensure_dir(parent).await?;
            }

            self.insert_unready(&lfn).await?;
            if rename {
                tokio_fs::rename(&path, &cfn).await?;
            } else {
                fetch::copy_file(&path, &cfn, self.inner.config.block_size).await?;
            }
            self.update(&lfn, Status::Ready).await?;
            self.notify_waiters(&lfn);

            let pfn = self.self_pfn(&lfn);
            registrations.push((lfn, pfn));
        }

        if !registrations.is_empty() {
            self.rls_client()
                .multiadd(registrations)
                .await
                .map_err(CacheError::Rls)?;
        }
        Ok(())
    }

    /// Remove `lfn` from this node: record, content file, and the RLS
    /// mapping this node advertised. Refuses a non-`ready` record unless
    /// `force`.
    pub async fn remove(&self, lfn: &str, force: bool) -> Result<(), CacheError> {
        tracing::debug!("remove {lfn}");
        let Some(record) = self.record(lfn).await? else {
            return Ok(());
        };
        if !force && record.status != Status::Ready {
            return Err(CacheError::NotRemovable {
                lfn: lfn.to_owned(),
                status: record.status,
            });
        }

        self.db_remove(lfn).await?;

        if record.status == Status::Ready {
            self.rls_client()
                .delete(lfn, Some(&self.self_pfn(lfn)))
                .await
                .map_err(CacheError::Rls)?;
            let cfn = self.content_file(lfn);
            if cfn.is_file() {
                tokio_fs::remove_file(&cfn).await?;
            }
        }
        Ok(())
    }

    /// All records with their status.
    pub async fn list(&self) -> Result<Vec<Record>, CacheError> {
        tracing::debug!("list");
        let db = self.inner.db.clone();
        run_blocking_task(move || Ok(db.list()?)).await
    }

    /// A Bloom filter over every logical file name currently cached, as
    /// ordered base64 chunks.
    pub async fn get_bloom_filter(&self, m: usize, k: usize) -> Result<Vec<String>, CacheError> {
        if m == 0 || k == 0 {
            return Err(CacheError::InvalidFilterParams);
        }
        let db = self.inner.db.clone();
        let lfns: Vec<String> = run_blocking_task(move || Ok::<Vec<String>, CacheError>(db.lfns()?)).await?;
        let mut filter = BloomFilter::new(m, k);
        for lfn in &lfns {
            filter.insert(lfn);
        }
        Ok(filter.to_base64_chunks())
    }

    /// A snapshot of the request counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Drop every record, delete the content files, reset the counters.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let db = self.inner.db.clone();
        run_blocking_task(move || Ok::<(), CacheError>(db.clear()?)).await?;
        let dir = self.inner.config.cache_dir.clone();
        run_blocking_task(move || Ok::<(), CacheError>(remove_contents(&dir)?)).await?;
        self.inner.stats.reset();
        Ok(())
    }

    pub async fn rls_add(&self, lfn: &str, pfn: &str) -> Result<(), CacheError> {
        tracing::debug!("rls add {lfn} {pfn}");
        self.rls_client()
            .add(lfn, pfn)
            .await
            .map_err(CacheError::Rls)
    }

    pub async fn rls_delete(&self, lfn: &str, pfn: Option<&str>) -> Result<(), CacheError> {
        tracing::debug!("rls delete {lfn} {pfn:?}");
        self.rls_client()
            .delete(lfn, pfn)
            .await
            .map_err(CacheError::Rls)
    }

    pub async fn rls_lookup(&self, lfn: &str) -> Result<Vec<String>, CacheError> {
        tracing::debug!("rls lookup {lfn}");
        self.rls_client()
            .lookup(lfn)
            .await
            .map_err(CacheError::Rls)
    }

    pub async fn rls_clear(&self) -> Result<(), CacheError> {
        tracing::debug!("rls clear");
        self.rls_client().clear().await.map_err(CacheError::Rls)
    }

    fn notify_waiters(&self, lfn: &str) {
        if let Some((_, notify)) = self.inner.inflight.remove(lfn) {
            notify.notify_waiters();
        }
    }

    async fn record(&self, lfn: &str) -> Result<Option<Record>, CacheError> {
        let db = self.inner.db.clone();
        let lfn = lfn.to_owned();
        run_blocking_task(move || Ok(db.get(&lfn)?)).await
    }

    async fn insert_unready(&self, lfn: &str) -> Result<(), CacheError> {
        let db = self.inner.db.clone();
        let lfn = lfn.to_owned();
        run_blocking_task(move || Ok(db.insert_unready(&lfn)?)).await
    }

    async fn update(&self, lfn: &str, status: Status) -> Result<(), CacheError> {
        let db = self.inner.db.clone();
        let lfn = lfn.to_owned();
        run_blocking_task(move || Ok(db.update(&lfn, status)?)).await
    }

    async fn db_remove(&self, lfn: &str) -> Result<(), CacheError> {
        let db = self.inner.db.clone();
        let lfn = lfn.to_owned();
        run_blocking_task(move || Ok(db.remove(&lfn)?)).await
    }
}

/// Delete the files below `dir`, keeping the directory skeleton.
fn remove_contents(dir: &Path) -> std::io::Result<()> {
    for entry in fs_err::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            remove_contents(&path)?;
        } else {
            fs_err::remove_file(&path)?;
        }
    }
    Ok(())
}
