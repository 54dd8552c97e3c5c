use std::path::PathBuf;

use url::Url;

/// Stream buffer size for file copies and the file-serving endpoint.
const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// The stream buffer size, honoring `MULE_BLOCK_SIZE`.
pub fn default_block_size() -> usize {
    std::env::var("MULE_BLOCK_SIZE")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_BLOCK_SIZE)
}

/// The content store directory, honoring `MULE_CACHE_DIR`.
pub fn default_cache_dir() -> PathBuf {
    std::env::var("MULE_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/mule"))
}

/// The service home (metadata stores live under `<home>/var/`), honoring
/// `MULE_HOME`.
pub fn default_home() -> PathBuf {
    std::env::var("MULE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".mule")
        })
}

/// The hostname advertised to peers in self-produced PFNs.
pub fn fqdn() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Configuration of one cache service instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Endpoint of the replica location service.
    pub rls: Url,
    /// Root of the on-disk content store.
    pub cache_dir: PathBuf,
    /// Home directory; the metadata store lives under `<home>/var/cache/`.
    pub home: PathBuf,
    /// Hostname used in PFNs this node advertises.
    pub hostname: String,
    /// Port used in PFNs this node advertises (and served on).
    pub port: u16,
    /// Size of the download worker pool.
    pub workers: usize,
    /// Stream buffer size for copies and the file endpoint.
    pub block_size: usize,
}

impl CacheConfig {
    /// A configuration with the environment-driven defaults and the given
    /// RLS endpoint.
    pub fn new(rls: Url) -> Self {
        Self {
            rls,
            cache_dir: default_cache_dir(),
            home: default_home(),
            hostname: fqdn(),
            port: mule_rpc::CACHE_PORT,
            workers: std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1),
            block_size: default_block_size(),
        }
    }
}
