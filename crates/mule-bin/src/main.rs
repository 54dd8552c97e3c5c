use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

mod commands;

/// Command line options available through the `mule` cli.
#[derive(Debug, Parser)]
#[clap(name = "mule", author, version, about, long_about = None)]
struct Opt {
    /// The subcommand to execute
    #[clap(subcommand)]
    command: Command,

    /// Log verbose
    #[clap(short, long, global = true)]
    verbose: bool,
}

/// Different commands supported by `mule`.
#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the per-node cache daemon
    Cache(commands::daemon::CacheOpt),
    /// Run the replica location service daemon
    Rls(commands::daemon::RlsOpt),
    /// Download LFN and store it at PATH
    Get(commands::client::GetOpt),
    /// Fetch multiple LFNs
    Multiget(commands::client::MultigetOpt),
    /// Upload PATH to LFN
    Put(commands::client::PutOpt),
    /// Upload multiple paths
    Multiput(commands::client::MultiputOpt),
    /// Remove LFN from the cache
    Remove(commands::client::RemoveOpt),
    /// List cache contents
    List(commands::client::HostOpt),
    /// Add a mapping to the RLS
    #[clap(name = "rls_add")]
    RlsAdd(commands::client::RlsAddOpt),
    /// Remove mappings for LFN from the RLS
    #[clap(name = "rls_delete")]
    RlsDelete(commands::client::RlsDeleteOpt),
    /// List RLS mappings for LFN
    #[clap(name = "rls_lookup")]
    RlsLookup(commands::client::RlsLookupOpt),
    /// Retrieve the base64-encoded bloom filter over the cache
    Bloom(commands::client::BloomOpt),
    /// Display cache statistics
    Stats(commands::client::HostOpt),
    /// Clear all entries from the cache
    Clear(commands::client::HostOpt),
    /// Clear all entries from the RLS
    #[clap(name = "rls_clear")]
    RlsClear(commands::client::HostOpt),
    /// Add a mapping to the RLS without going through the cache
    #[clap(name = "rls_direct_add")]
    RlsDirectAdd(commands::client::RlsDirectAddOpt),
    /// Remove mappings without going through the cache
    #[clap(name = "rls_direct_delete")]
    RlsDirectDelete(commands::client::RlsDirectDeleteOpt),
    /// List mappings without going through the cache
    #[clap(name = "rls_direct_lookup")]
    RlsDirectLookup(commands::client::RlsDirectLookupOpt),
    /// Clear the RLS without going through the cache
    #[clap(name = "rls_direct_clear")]
    RlsDirectClear(commands::client::RlsDirectClearOpt),
}

/// Entry point of the `mule` cli.
fn main() -> anyhow::Result<()> {
    let num_cores = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(2)
        .max(2);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cores / 2)
        .max_blocking_threads(num_cores)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    // Logging level comes from the verbose flag unless RUST_LOG overrides.
    let default_filter = if opt.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish()
        .try_init()?;

    match opt.command {
        Command::Cache(opts) => commands::daemon::cache(opts).await,
        Command::Rls(opts) => commands::daemon::rls(opts).await,
        Command::Get(opts) => commands::client::get(opts).await,
        Command::Multiget(opts) => commands::client::multiget(opts).await,
        Command::Put(opts) => commands::client::put(opts).await,
        Command::Multiput(opts) => commands::client::multiput(opts).await,
        Command::Remove(opts) => commands::client::remove(opts).await,
        Command::List(opts) => commands::client::list(opts).await,
        Command::RlsAdd(opts) => commands::client::rls_add(opts).await,
        Command::RlsDelete(opts) => commands::client::rls_delete(opts).await,
        Command::RlsLookup(opts) => commands::client::rls_lookup(opts).await,
        Command::Bloom(opts) => commands::client::bloom(opts).await,
        Command::Stats(opts) => commands::client::stats(opts).await,
        Command::Clear(opts) => commands::client::clear(opts).await,
        Command::RlsClear(opts) => commands::client::rls_clear(opts).await,
        Command::RlsDirectAdd(opts) => commands::client::rls_direct_add(opts).await,
        Command::RlsDirectDelete(opts) => commands::client::rls_direct_delete(opts).await,
        Command::RlsDirectLookup(opts) => commands::client::rls_direct_lookup(opts).await,
        Command::RlsDirectClear(opts) => commands::client::rls_direct_clear(opts).await,
    }
}
