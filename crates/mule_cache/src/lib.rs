//! The per-node file-staging cache.
//!
//! Workers on a compute node request logical files by name. The cache
//! downloads each file at most once per node, serves it locally by symlink
//! or copy, and advertises its copy to the cluster-wide replica location
//! service so peer nodes can fetch from it over HTTP instead of hammering
//! the original source.
//!
//! The heart of the crate is the coalescing engine in [`Cache::multiget`]:
//! concurrent requests for the same logical file name are merged onto a
//! single download executed by a fixed pool of worker tasks.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

pub use config::{default_block_size, default_cache_dir, default_home, fqdn, CacheConfig};
pub use download::DownloadError;
pub use error::CacheError;
pub use service::Cache;
pub use stats::StatsSnapshot;

mod config;
mod download;
mod error;
mod fetch;
mod server;
mod service;
mod stats;

/// The content identifier for a logical file name.
///
/// Derived, never stored: every node computes the same identifier for the
/// same name, so the PFNs advertised by different replicas share one path
/// suffix and a peer can reach any of them with a single URL template.
pub fn uuid_for(lfn: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(lfn.as_bytes());
    hex::encode(hasher.finalize())
}

/// Where the content file for `uuid` lives below `cache_dir`.
///
/// Two levels of fan-out keep individual directories small.
pub fn content_path(cache_dir: &Path, uuid: &str) -> PathBuf {
    cache_dir.join(&uuid[0..2]).join(&uuid[2..4]).join(uuid)
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::{content_path, uuid_for};

    #[test]
    fn uuid_is_stable_sha1_hex() {
        // Two nodes caching the same name must agree on the identifier.
        assert_eq!(uuid_for("data/x"), uuid_for("data/x"));
        assert_eq!(uuid_for("data/x").len(), 40);
        assert_ne!(uuid_for("data/x"), uuid_for("data/y"));
    }

    #[test]
    fn content_path_fans_out() {
        let uuid = uuid_for("data/x");
        let path = content_path(Path::new("/tmp/mule"), &uuid);
        let mut parts = path.strip_prefix("/tmp/mule").unwrap().components();
        assert_eq!(
            parts.next().unwrap().as_os_str().to_str().unwrap(),
            &uuid[0..2]
        );
        assert_eq!(
            parts.next().unwrap().as_os_str().to_str().unwrap(),
            &uuid[2..4]
        );
        assert_eq!(parts.next().unwrap().as_os_str().to_str().unwrap(), uuid);
    }
}
