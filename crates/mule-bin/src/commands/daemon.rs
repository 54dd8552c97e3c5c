use std::{net::SocketAddr, path::PathBuf};

use anyhow::{bail, Context};
use mule_cache::{Cache, CacheConfig};
use mule_rls::{Rls, RlsClient};

/// Options for the cache daemon.
#[derive(Debug, clap::Parser)]
pub struct CacheOpt {
    /// RLS host, or host:port
    #[clap(short, long, env = "MULE_RLS", value_name = "HOST")]
    rls: String,

    /// Cache directory
    #[clap(
        short = 'd',
        long = "dir",
        env = "MULE_CACHE_DIR",
        default_value = "/tmp/mule",
        value_name = "DIR"
    )]
    cache_dir: PathBuf,

    /// Number of download workers
    #[clap(short = 't', long, value_name = "N")]
    workers: Option<usize>,

    /// Port to listen on
    #[clap(short, long, default_value_t = mule_rpc::CACHE_PORT)]
    port: u16,

    /// Hostname advertised to peers in PFNs
    #[clap(long, value_name = "HOST")]
    hostname: Option<String>,
}

/// Run the per-node cache daemon.
pub async fn cache(opt: CacheOpt) -> anyhow::Result<()> {
    if opt.cache_dir.is_file() {
        bail!("cache directory {} names a file", opt.cache_dir.display());
    }

    let rls = RlsClient::for_host(&opt.rls).context("invalid RLS host")?;
    match rls.ready().await {
        Ok(true) => {}
        _ => tracing::warn!("RLS is not ready"),
    }

    let mut config = CacheConfig::new(rls.url().clone());
    config.cache_dir = opt.cache_dir;
    config.port = opt.port;
    if let Some(workers) = opt.workers {
        config.workers = workers;
    }
    if let Some(hostname) = opt.hostname {
        config.hostname = hostname;
    }

    tracing::info!("starting cache");
    let cache = Cache::open(config)?;
    let checkpointer = cache.spawn_checkpointer();

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], opt.port)))
        .await
        .with_context(|| format!("cannot listen on port {}", opt.port))?;
    tracing::info!("cache listening on {}", listener.local_addr()?);

    axum::serve(listener, cache.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    checkpointer.abort();
    cache.close();
    Ok(())
}

/// Options for the RLS daemon.
#[derive(Debug, clap::Parser)]
pub struct RlsOpt {
    /// Port to listen on
    #[clap(short, long, default_value_t = mule_rpc::RLS_PORT)]
    port: u16,
}

/// Run the replica location service daemon.
pub async fn rls(opt: RlsOpt) -> anyhow::Result<()> {
    tracing::info!("starting RLS");
    let rls = Rls::open(&mule_cache::default_home())?;
    let checkpointer = rls.spawn_checkpointer();

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], opt.port)))
        .await
        .with_context(|| format!("cannot listen on port {}", opt.port))?;
    tracing::info!("RLS listening on {}", listener.local_addr()?);

    axum::serve(listener, rls.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    checkpointer.abort();
    rls.close();
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives; both mean an orderly shutdown.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::error!("cannot install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
