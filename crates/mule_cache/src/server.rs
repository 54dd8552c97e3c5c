//! The cache's HTTP surface: the RPC method table and the file-serving
//! endpoint peers download replicas from.

use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use mule_rpc::{params, to_result, MethodTable, RpcError};
use tokio_util::io::ReaderStream;

use crate::service::Cache;

impl Cache {
    /// The full router for this service: the RPC endpoint on `POST /` and
    /// the replica endpoint on `GET /{uuid}`.
    pub fn router(&self) -> Router {
        let mut table = MethodTable::new(self.clone());

        table.register("get", |cache: Cache, raw| async move {
            let (lfn, path, symlink): (String, String, bool) = params(raw)?;
            let status = cache
                .get(lfn, PathBuf::from(path), symlink)
                .await
                .map_err(RpcError::handler)?;
            to_result(status)
        });
        table.register("multiget", |cache: Cache, raw| async move {
            let (pairs, symlink): (Vec<(String, String)>, bool) = params(raw)?;
            let pairs = pairs
                .into_iter()
                .map(|(lfn, path)| (lfn, PathBuf::from(path)))
                .collect();
            to_result(cache.multiget(pairs, symlink).await.map_err(RpcError::handler)?)
        });
        table.register("put", |cache: Cache, raw| async move {
            let (path, lfn, rename): (String, String, bool) = params(raw)?;
            to_result(
                cache
                    .put(PathBuf::from(path), lfn, rename)
                    .await
                    .map_err(RpcError::handler)?,
            )
        });
        table.register("multiput", |cache: Cache, raw| async move {
            let (pairs, rename): (Vec<(String, String)>, bool) = params(raw)?;
            let pairs = pairs
                .into_iter()
                .map(|(path, lfn)| (PathBuf::from(path), lfn))
                .collect();
            to_result(cache.multiput(pairs, rename).await.map_err(RpcError::handler)?)
        });
        table.register("remove", |cache: Cache, raw| async move {
            let (lfn, force): (String, bool) = params(raw)?;
            to_result(cache.remove(&lfn, force).await.map_err(RpcError::handler)?)
        });
        table.register("list", |cache: Cache, _raw| async move {
            to_result(cache.list().await.map_err(RpcError::handler)?)
        });
        table.register("rls_add", |cache: Cache, raw| async move {
            let (lfn, pfn): (String, String) = params(raw)?;
            to_result(cache.rls_add(&lfn, &pfn).await.map_err(RpcError::handler)?)
        });
        table.register("rls_delete", |cache: Cache, raw| async move {
            let (lfn, pfn): (String, Option<String>) = params(raw)?;
            to_result(
                cache
                    .rls_delete(&lfn, pfn.as_deref())
                    .await
                    .map_err(RpcError::handler)?,
            )
        });
        table.register("rls_lookup", |cache: Cache, raw| async move {
            let (lfn,): (String,) = params(raw)?;
            to_result(cache.rls_lookup(&lfn).await.map_err(RpcError::handler)?)
        });
        table.register("get_bloom_filter", |cache: Cache, raw| async move {
            let (m, k): (usize, usize) = params(raw)?;
            to_result(cache.get_bloom_filter(m, k).await.map_err(RpcError::handler)?)
        });
        table.register("stats", |cache: Cache, _raw| async move {
            to_result(cache.stats())
        });
        table.register("clear", |cache: Cache, _raw| async move {
            to_result(cache.clear().await.map_err(RpcError::handler)?)
        });
        table.register("rls_clear", |cache: Cache, _raw| async move {
            to_result(cache.rls_clear().await.map_err(RpcError::handler)?)
        });

        mule_rpc::router(table).merge(
            Router::new()
                .route("/{uuid}", get(serve_content))
                .with_state(self.clone()),
        )
    }
}

/// `GET /{uuid}`: stream the content file, or 404.
async fn serve_content(State(cache): State<Cache>, UrlPath(uuid): UrlPath<String>) -> Response {
    if uuid.len() < 4 || !uuid.bytes().all(|b| b.is_ascii_hexdigit()) {
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    }
    let path = cache.content_file_for_uuid(&uuid);
    let metadata = match fs_err::tokio::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return (StatusCode::NOT_FOUND, "File not found").into_response(),
    };
    let file = match fs_err::tokio::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "File not found").into_response(),
    };

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, metadata.len());
    if let Ok(modified) = metadata.modified() {
        let when: chrono::DateTime<chrono::Utc> = modified.into();
        response = response.header(
            header::LAST_MODIFIED,
            when.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
    }
    let stream = ReaderStream::with_capacity(file, cache.block_size());
    match response.body(Body::from_stream(stream)) {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod test {
    use std::{
        future::IntoFuture,
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use axum::{routing::get, Router};
    use mule_rls::{Rls, RlsClient};
    use mule_rpc::RpcClient;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use url::Url;

    use crate::{uuid_for, Cache, CacheConfig, CacheError};

    struct TestRls {
        client: RlsClient,
        url: Url,
        _home: TempDir,
    }

    async fn start_rls() -> TestRls {
        let home = tempdir().unwrap();
        let rls = Rls::open(home.path()).unwrap();
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, rls.router()).into_future());
        let url: Url = format!("http://{addr}/").parse().unwrap();
        TestRls {
            client: RlsClient::connect(url.clone()),
            url,
            _home: home,
        }
    }

    struct TestCache {
        cache: Cache,
        url: Url,
        _home: TempDir,
        _store: TempDir,
    }

    async fn start_cache(rls: &TestRls) -> TestCache {
        let home = tempdir().unwrap();
        let store = tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = CacheConfig::new(rls.url.clone());
        config.home = home.path().to_path_buf();
        config.cache_dir = store.path().to_path_buf();
        config.hostname = "127.0.0.1".to_owned();
        config.port = addr.port();
        config.workers = 2;

        let cache = Cache::open(config).unwrap();
        tokio::spawn(axum::serve(listener, cache.router()).into_future());
        TestCache {
            cache,
            url: format!("http://{addr}/").parse().unwrap(),
            _home: home,
            _store: store,
        }
    }

    /// An origin server that counts requests and can delay its responses.
    async fn start_origin(payload: &'static [u8], delay: Duration) -> (Url, Arc<AtomicUsize>) {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        let router = Router::new().route(
            "/{*path}",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    payload
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        (format!("http://{addr}/").parse().unwrap(), requests)
    }

    async fn write_source(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let source = write_source(&scratch, "a.dat", b"payload bytes").await;
        node.cache
            .put(source, "data/x".to_owned(), false)
            .await
            .unwrap();

        // The self-PFN is registered as part of the put.
        let pfns = rls.client.lookup("data/x").await.unwrap();
        assert_eq!(pfns, vec![node.cache.self_pfn("data/x")]);

        let dest = scratch.path().join("work/x.dat");
        node.cache
            .get("data/x".to_owned(), dest.clone(), false)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload bytes");

        let stats = node.cache.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn get_by_symlink_points_into_the_store() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let source = write_source(&scratch, "a.dat", b"linked").await;
        node.cache
            .put(source, "data/link".to_owned(), false)
            .await
            .unwrap();

        let dest = scratch.path().join("x");
        node.cache
            .get("data/link".to_owned(), dest.clone(), true)
            .await
            .unwrap();
        let meta = tokio::fs::symlink_metadata(&dest).await.unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"linked");
    }

    #[tokio::test]
    async fn existing_destination_is_rejected_without_state_change() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let dest = write_source(&scratch, "occupied", b"old").await;
        let err = node
            .cache
            .get("data/x".to_owned(), dest.clone(), false)
            .await
            .unwrap_err();
        assert_matches!(err, CacheError::DestinationExists(_));

        // No record was created and nothing was counted.
        assert!(node.cache.list().await.unwrap().is_empty());
        assert_eq!(node.cache.stats().gets, 0);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn concurrent_gets_coalesce_onto_one_download() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();
        let (origin, requests) = start_origin(b"shared input", Duration::from_millis(300)).await;

        rls.client
            .add("data/shared", origin.join("shared").unwrap().as_str())
            .await
            .unwrap();

        let first = node.cache.get(
            "data/shared".to_owned(),
            scratch.path().join("x1"),
            false,
        );
        let second = node.cache.get(
            "data/shared".to_owned(),
            scratch.path().join("x2"),
            false,
        );
        let (first, second) = tokio::join!(first, second);
        first.unwrap();
        second.unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 1, "expected one download");
        assert_eq!(
            tokio::fs::read(scratch.path().join("x1")).await.unwrap(),
            b"shared input"
        );
        assert_eq!(
            tokio::fs::read(scratch.path().join("x2")).await.unwrap(),
            b"shared input"
        );

        let stats = node.cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.near_misses, 1);
    }

    #[tokio::test]
    async fn cold_get_fetches_from_the_peer_that_published() {
        let rls = start_rls().await;
        let node_a = start_cache(&rls).await;
        let node_b = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let source = write_source(&scratch, "a.dat", b"peer payload").await;
        node_a
            .cache
            .put(source, "data/x".to_owned(), false)
            .await
            .unwrap();

        let dest = scratch.path().join("w/x");
        node_b
            .cache
            .get("data/x".to_owned(), dest.clone(), false)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"peer payload");

        // Both replicas are now advertised, sharing one path suffix.
        let pfns = rls.client.lookup("data/x").await.unwrap();
        assert_eq!(pfns.len(), 2);
        assert!(pfns.contains(&node_a.cache.self_pfn("data/x")));
        assert!(pfns.contains(&node_b.cache.self_pfn("data/x")));
    }

    #[tokio::test]
    async fn url_shaped_lfn_falls_back_to_its_origin() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();
        let (origin, requests) = start_origin(b"origin foo", Duration::ZERO).await;

        let lfn = origin.join("foo").unwrap().to_string();
        let dest = scratch.path().join("foo");
        node.cache
            .get(lfn.clone(), dest.clone(), false)
            .await
            .unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"origin foo");
        // The downloaded copy is advertised like any other.
        assert_eq!(
            rls.client.lookup(&lfn).await.unwrap(),
            vec![node.cache.self_pfn(&lfn)]
        );
    }

    #[tokio::test]
    async fn exhausted_sources_fail_until_forcibly_removed() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        rls.client
            .add("data/bad", "http://127.0.0.1:1/unreachable")
            .await
            .unwrap();

        let err = node
            .cache
            .get("data/bad".to_owned(), scratch.path().join("a"), false)
            .await
            .unwrap_err();
        assert_matches!(err, CacheError::Download(_));

        // The record is failed now; further gets are refused outright.
        let err = node
            .cache
            .get("data/bad".to_owned(), scratch.path().join("b"), false)
            .await
            .unwrap_err();
        assert_matches!(err, CacheError::Failed(_));

        // Not removable without force.
        let err = node.cache.remove("data/bad", false).await.unwrap_err();
        assert_matches!(err, CacheError::NotRemovable { .. });
        node.cache.remove("data/bad", true).await.unwrap();

        // Publish locally and the name works again.
        let source = write_source(&scratch, "fixed.dat", b"recovered").await;
        node.cache
            .put(source, "data/bad".to_owned(), false)
            .await
            .unwrap();
        let dest = scratch.path().join("c");
        node.cache
            .get("data/bad".to_owned(), dest.clone(), false)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"recovered");
    }

    #[tokio::test]
    async fn multiget_partitions_ready_inflight_and_new() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();
        let (origin, _) = start_origin(b"bulk bytes", Duration::from_millis(300)).await;

        // L1 is already ready.
        let source = write_source(&scratch, "l1.dat", b"bulk bytes").await;
        node.cache.put(source, "l1".to_owned(), false).await.unwrap();

        // L2 is in flight, claimed by another caller.
        rls.client
            .add("l2", origin.join("l2").unwrap().as_str())
            .await
            .unwrap();
        let in_flight = tokio::spawn({
            let cache = node.cache.clone();
            let dest = scratch.path().join("other/l2");
            async move { cache.get("l2".to_owned(), dest, false).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // L3 is new.
        rls.client
            .add("l3", origin.join("l3").unwrap().as_str())
            .await
            .unwrap();

        node.cache
            .multiget(
                vec![
                    ("l1".to_owned(), scratch.path().join("w/l1")),
                    ("l2".to_owned(), scratch.path().join("w/l2")),
                    ("l3".to_owned(), scratch.path().join("w/l3")),
                ],
                false,
            )
            .await
            .unwrap();
        in_flight.await.unwrap().unwrap();

        for name in ["w/l1", "w/l2", "w/l3"] {
            assert_eq!(
                tokio::fs::read(scratch.path().join(name)).await.unwrap(),
                b"bulk bytes"
            );
        }

        // The batch registered the name it downloaded itself.
        let pfns = rls.client.lookup("l3").await.unwrap();
        assert!(pfns.contains(&node.cache.self_pfn("l3")));

        let stats = node.cache.stats();
        assert!(stats.hits >= 1);
        assert!(stats.near_misses >= 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn replica_endpoint_streams_content_and_404s() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let source = write_source(&scratch, "a.dat", b"served to peers").await;
        node.cache
            .put(source, "data/x".to_owned(), false)
            .await
            .unwrap();

        let response = reqwest::get(node.url.join(&uuid_for("data/x")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok()),
            Some("application/octet-stream")
        );
        assert_eq!(response.content_length(), Some(15));
        assert!(response.headers().contains_key("last-modified"));
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"served to peers");

        let missing = reqwest::get(node.url.join(&uuid_for("data/absent")).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let junk = reqwest::get(node.url.join("zz").unwrap()).await.unwrap();
        assert_eq!(junk.status(), 404);
    }

    #[tokio::test]
    async fn bloom_filter_covers_every_cached_name() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let lfns = ["data/a", "data/b", "http://origin/c"];
        for lfn in lfns {
            let source = write_source(&scratch, &lfn.replace('/', "_"), b"x").await;
            node.cache.put(source, lfn.to_owned(), false).await.unwrap();
        }

        let chunks = node.cache.get_bloom_filter(131_072, 3).await.unwrap();
        for chunk in &chunks {
            assert!(chunk.len() <= 8000);
        }
        let filter =
            mule_bits::BloomFilter::from_base64_chunks(131_072, 3, &chunks).unwrap();
        for lfn in lfns {
            assert!(filter.contains(lfn), "false negative for {lfn}");
        }
    }

    #[tokio::test]
    async fn removed_records_are_truly_gone() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();
        let (origin, requests) = start_origin(b"again", Duration::ZERO).await;

        let source = write_source(&scratch, "a.dat", b"again").await;
        node.cache.put(source, "data/x".to_owned(), false).await.unwrap();
        node.cache.remove("data/x", false).await.unwrap();

        assert!(node.cache.list().await.unwrap().is_empty());
        assert!(rls.client.lookup("data/x").await.unwrap().is_empty());

        // With no replicas left anywhere, a get has nothing to fetch from.
        let err = node
            .cache
            .get("data/x".to_owned(), scratch.path().join("gone"), false)
            .await
            .unwrap_err();
        assert_matches!(err, CacheError::Download(_));
        node.cache.remove("data/x", true).await.unwrap();

        // A fresh source triggers a genuine re-download.
        rls.client
            .add("data/x", origin.join("x").unwrap().as_str())
            .await
            .unwrap();
        let dest = scratch.path().join("back");
        node.cache
            .get("data/x".to_owned(), dest.clone(), false)
            .await
            .unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn duplicate_put_is_skipped_and_counted() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let first = write_source(&scratch, "one.dat", b"one").await;
        let second = write_source(&scratch, "two.dat", b"two").await;
        node.cache.put(first, "data/x".to_owned(), false).await.unwrap();
        node.cache.put(second, "data/x".to_owned(), false).await.unwrap();

        assert_eq!(node.cache.stats().duplicates, 1);
        assert_eq!(rls.client.lookup("data/x").await.unwrap().len(), 1);

        // The original content is untouched.
        let dest = scratch.path().join("check");
        node.cache
            .get("data/x".to_owned(), dest.clone(), false)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn clear_drops_records_files_and_counters() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let source = write_source(&scratch, "a.dat", b"temporary").await;
        node.cache.put(source, "data/x".to_owned(), false).await.unwrap();
        let cfn = crate::content_path(node._store.path(), &uuid_for("data/x"));
        assert!(cfn.is_file());

        node.cache.clear().await.unwrap();
        assert!(node.cache.list().await.unwrap().is_empty());
        assert!(!cfn.exists());
        assert_eq!(node.cache.stats().puts, 0);
    }

    #[tokio::test]
    async fn rpc_surface_round_trips() {
        let rls = start_rls().await;
        let node = start_cache(&rls).await;
        let scratch = tempdir().unwrap();

        let source = write_source(&scratch, "a.dat", b"over rpc").await;
        let client = RpcClient::connect(node.url.clone());

        client
            .call("put", json!([source, "data/rpc", false]))
            .await
            .unwrap();
        let dest = scratch.path().join("rpc-dest");
        let status = client
            .call("get", json!(["data/rpc", dest, false]))
            .await
            .unwrap();
        assert_eq!(status, json!("ready"));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"over rpc");

        let records = client.call("list", json!([])).await.unwrap();
        assert_eq!(records, json!([{"lfn": "data/rpc", "status": "ready"}]));

        let stats = client.call("stats", json!([])).await.unwrap();
        assert_eq!(stats["puts"], json!(1));

        let err = client.call("no_such_method", json!([])).await.unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }
}
