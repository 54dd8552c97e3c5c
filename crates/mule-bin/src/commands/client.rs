use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use mule_rls::RlsClient;
use mule_rpc::{RpcClient, CACHE_PORT};
use serde_json::json;
use url::Url;

/// Connect to the cache service on `host`, or `host:port`.
fn cache_client(host: &str) -> anyhow::Result<RpcClient> {
    let authority = if host.contains(':') {
        host.to_owned()
    } else {
        format!("{host}:{CACHE_PORT}")
    };
    let url = Url::parse(&format!("http://{authority}/")).context("invalid cache host")?;
    Ok(RpcClient::connect(url))
}

fn absolutize(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Parse `LFN PATH` (or `PATH LFN`) pairs from a multiget/multiput stream.
/// Blank lines and `#` comments are skipped.
fn parse_pairs(input: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(first), Some(second)) => pairs.push((first.to_owned(), second.to_owned())),
            _ => bail!("malformed pair line: {line:?}"),
        }
    }
    Ok(pairs)
}

async fn read_input(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => {
            use tokio::io::AsyncReadExt;
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            Ok(input)
        }
    }
}

/// Options for commands that only need a cache host.
#[derive(Debug, clap::Parser)]
pub struct HostOpt {
    /// Host to connect to
    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

#[derive(Debug, clap::Parser)]
pub struct GetOpt {
    lfn: String,
    path: PathBuf,

    /// Symlink PATH to the cached file instead of copying
    #[clap(short, long, env = "MULE_SYMLINK")]
    symlink: bool,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn get(opt: GetOpt) -> anyhow::Result<()> {
    let path = absolutize(&opt.path)?;
    let client = cache_client(&opt.host)?;
    client
        .call("get", json!([opt.lfn, path, opt.symlink]))
        .await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct MultigetOpt {
    /// Read `LFN PATH` pairs from FILE instead of stdin
    #[clap(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Symlink paths to the cached files instead of copying
    #[clap(short, long, env = "MULE_SYMLINK")]
    symlink: bool,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn multiget(opt: MultigetOpt) -> anyhow::Result<()> {
    let input = read_input(opt.file.as_deref()).await?;
    let mut pairs = Vec::new();
    for (lfn, path) in parse_pairs(&input)? {
        let path = absolutize(Path::new(&path))?;
        pairs.push((lfn, path));
    }
    let client = cache_client(&opt.host)?;
    client
        .call("multiget", json!([pairs, opt.symlink]))
        .await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct PutOpt {
    path: PathBuf,
    lfn: String,

    /// Rename PATH into the cache instead of copying
    #[clap(short, long, env = "MULE_RENAME")]
    rename: bool,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn put(opt: PutOpt) -> anyhow::Result<()> {
    if !opt.path.exists() {
        bail!("path {} does not exist", opt.path.display());
    }
    let path = absolutize(&opt.path)?;
    let client = cache_client(&opt.host)?;
    client
        .call("put", json!([path, opt.lfn, opt.rename]))
        .await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct MultiputOpt {
    /// Read `PATH LFN` pairs from FILE instead of stdin
    #[clap(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Rename paths into the cache instead of copying
    #[clap(short, long, env = "MULE_RENAME")]
    rename: bool,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn multiput(opt: MultiputOpt) -> anyhow::Result<()> {
    let input = read_input(opt.file.as_deref()).await?;
    let mut pairs = Vec::new();
    for (path, lfn) in parse_pairs(&input)? {
        let path = Path::new(&path);
        if !path.exists() {
            tracing::warn!("path {} does not exist, skipping", path.display());
            continue;
        }
        pairs.push((absolutize(path)?, lfn));
    }
    let client = cache_client(&opt.host)?;
    client
        .call("multiput", json!([pairs, opt.rename]))
        .await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RemoveOpt {
    lfn: String,

    /// Remove the record even if it is not ready
    #[clap(short, long)]
    force: bool,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn remove(opt: RemoveOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    client.call("remove", json!([opt.lfn, opt.force])).await?;
    Ok(())
}

pub async fn list(opt: HostOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    let records = client.call("list", json!([])).await?;
    for record in records.as_array().into_iter().flatten() {
        println!(
            "{} {}",
            record["lfn"].as_str().unwrap_or_default(),
            record["status"].as_str().unwrap_or_default()
        );
    }
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RlsAddOpt {
    lfn: String,
    pfn: String,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn rls_add(opt: RlsAddOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    client.call("rls_add", json!([opt.lfn, opt.pfn])).await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RlsDeleteOpt {
    lfn: String,
    pfn: Option<String>,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn rls_delete(opt: RlsDeleteOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    client
        .call("rls_delete", json!([opt.lfn, opt.pfn]))
        .await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RlsLookupOpt {
    lfn: String,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn rls_lookup(opt: RlsLookupOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    let pfns = client.call("rls_lookup", json!([opt.lfn])).await?;
    for pfn in pfns.as_array().into_iter().flatten() {
        println!("{}", pfn.as_str().unwrap_or_default());
    }
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct BloomOpt {
    /// Number of filter bits
    #[clap(short, default_value_t = 131_072)]
    m: usize,

    /// Number of hash indices per value
    #[clap(short, default_value_t = 3)]
    k: usize,

    #[clap(short = 'H', long, default_value = "localhost")]
    host: String,
}

pub async fn bloom(opt: BloomOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    let chunks = client
        .call("get_bloom_filter", json!([opt.m, opt.k]))
        .await?;
    for (n, chunk) in chunks.as_array().into_iter().flatten().enumerate() {
        println!("BloomFilter{n} = \"{}\"", chunk.as_str().unwrap_or_default());
    }
    Ok(())
}

pub async fn stats(opt: HostOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    let stats = client.call("stats", json!([])).await?;
    for (key, value) in stats.as_object().into_iter().flatten() {
        if let Some(text) = value.as_str() {
            println!("{key} = \"{text}\"");
        } else {
            println!("{key} = {value}");
        }
    }
    Ok(())
}

pub async fn clear(opt: HostOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    client.call("clear", json!([])).await?;
    Ok(())
}

pub async fn rls_clear(opt: HostOpt) -> anyhow::Result<()> {
    let client = cache_client(&opt.host)?;
    client.call("rls_clear", json!([])).await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RlsDirectAddOpt {
    rls_host: String,
    lfn: String,
    pfn: String,
}

pub async fn rls_direct_add(opt: RlsDirectAddOpt) -> anyhow::Result<()> {
    let client = RlsClient::for_host(&opt.rls_host)?;
    client.add(&opt.lfn, &opt.pfn).await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RlsDirectDeleteOpt {
    rls_host: String,
    lfn: String,
    pfn: Option<String>,
}

pub async fn rls_direct_delete(opt: RlsDirectDeleteOpt) -> anyhow::Result<()> {
    let client = RlsClient::for_host(&opt.rls_host)?;
    client.delete(&opt.lfn, opt.pfn.as_deref()).await?;
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RlsDirectLookupOpt {
    rls_host: String,
    lfn: String,
}

pub async fn rls_direct_lookup(opt: RlsDirectLookupOpt) -> anyhow::Result<()> {
    let client = RlsClient::for_host(&opt.rls_host)?;
    for pfn in client.lookup(&opt.lfn).await? {
        println!("{pfn}");
    }
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct RlsDirectClearOpt {
    rls_host: String,
}

pub async fn rls_direct_clear(opt: RlsDirectClearOpt) -> anyhow::Result<()> {
    let client = RlsClient::for_host(&opt.rls_host)?;
    client.clear().await?;
    Ok(())
}
