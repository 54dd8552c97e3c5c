//! Byte-moving primitives: streamed downloads and block-sized file copies.

use std::path::Path;

use fs_err::tokio as tokio_fs;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

/// Errors from moving bytes out of a single source.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid source URL {0:?}")]
    InvalidUrl(String, #[source] url::ParseError),

    #[error("{0:?} does not name a local path")]
    InvalidFileUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Download `pfn` and store it at `path`.
///
/// `http:`/`https:` sources are streamed chunk by chunk; `file:` sources are
/// copied. Anything else is handed to the HTTP client and fails with its
/// unsupported-scheme error.
pub(crate) async fn download(
    client: &reqwest::Client,
    pfn: &str,
    path: &Path,
) -> Result<(), FetchError> {
    let url = Url::parse(pfn).map_err(|err| FetchError::InvalidUrl(pfn.to_owned(), err))?;

    if url.scheme() == "file" {
        let source = url
            .to_file_path()
            .map_err(|()| FetchError::InvalidFileUrl(pfn.to_owned()))?;
        tokio_fs::copy(&source, path).await?;
        return Ok(());
    }

    let response = client.get(url).send().await?.error_for_status()?;
    let mut file = tokio_fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Copy `src` to `dest` through a buffer of `block_size` bytes.
pub(crate) async fn copy_file(
    src: &Path,
    dest: &Path,
    block_size: usize,
) -> Result<(), std::io::Error> {
    let mut reader = tokio_fs::File::open(src).await?;
    let mut writer = tokio_fs::File::create(dest).await?;
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Create `path` and its missing ancestors.
pub(crate) async fn ensure_dir(path: &Path) -> Result<(), std::io::Error> {
    tokio_fs::create_dir_all(path).await
}
