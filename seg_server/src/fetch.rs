//! Fetching model artifacts with progress reporting.
//!
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{Client, Url};
use tokio::io::AsyncReadExt;

use crate::SegError;

const READ_CHUNK: usize = 256 * 1024;

/// Download a file from a URL, reporting the received fraction.
///
/// Without a `Content-Length` header only the final `1.0` is reported.
pub async fn download<P>(client: &Client, url: &str, mut progress: P) -> Result<Bytes, SegError>
where
    P: FnMut(f32) + Send,
{
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| SegError::fetch(url, e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SegError::fetch(url, status));
    }

    let total = resp.content_length().filter(|len| *len > 0);
    let mut buf = BytesMut::with_capacity(total.unwrap_or(0) as usize);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| SegError::fetch(url, e))?;
        buf.extend_from_slice(&chunk);
        if let Some(total) = total {
            progress(fraction(buf.len() as u64, total));
        }
    }

    progress(1.0);
    log::debug!("Downloaded {} bytes from {}", buf.len(), url);

    Ok(buf.freeze())
}

/// Read a local file in chunks, reporting the read fraction.
pub async fn read_file<P>(path: &Path, mut progress: P) -> Result<Bytes, SegError>
where
    P: FnMut(f32) + Send,
{
    let display = path.display().to_string();
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SegError::fetch(&display, e))?;
    let total = file
        .metadata()
        .await
        .map_err(|e| SegError::fetch(&display, e))?
        .len();

    let mut buf = BytesMut::with_capacity(total as usize);
    let mut chunk = vec![0_u8; READ_CHUNK];
    loop {
        let read = file
            .read(&mut chunk)
            .await
            .map_err(|e| SegError::fetch(&display, e))?;
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
        progress(fraction(buf.len() as u64, total));
    }

    progress(1.0);

    Ok(buf.freeze())
}

/// Location of a cached download: `{cache_dir}/{host}/{url path}`.
pub fn cache_path(cache_dir: &Path, url: &str) -> Result<PathBuf, SegError> {
    let parsed = Url::parse(url).map_err(|e| SegError::fetch(url, e))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SegError::fetch(url, "URL has no host"))?;
    let host = match parsed.port() {
        Some(port) => format!("{host}_{port}"),
        None => host.to_owned(),
    };

    let mut path = cache_dir.join(sanitize(&host));
    for segment in parsed
        .path_segments()
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
    {
        path.push(sanitize(segment));
    }
    Ok(path)
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Remove a cached download, e.g. after it turned out not to be a model.
pub async fn evict_cached(cache_dir: &Path, url: &str) {
    let Ok(path) = cache_path(cache_dir, url) else {
        return;
    };
    match tokio::fs::remove_file(&path).await {
        Ok(()) => log::warn!("Evicted cached model {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not evict cached model {}: {}", path.display(), e),
    }
}

/// Download through the cache directory. A cache hit reports `1.0` at once.
pub async fn download_cached<P>(
    client: &Client,
    url: &str,
    cache_dir: &Path,
    mut progress: P,
) -> Result<Bytes, SegError>
where
    P: FnMut(f32) + Send,
{
    let path = cache_path(cache_dir, url)?;
    if let Ok(data) = tokio::fs::read(&path).await {
        log::info!("Using cached model {}", path.display());
        progress(1.0);
        return Ok(Bytes::from(data));
    }

    let data = download(client, url, progress).await?;
    if let Err(e) = store(&path, &data).await {
        log::warn!("Could not cache model at {}: {}", path.display(), e);
    }

    Ok(data)
}

async fn store(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Write next to the target first so a partial file is never picked up
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

fn fraction(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).min(1.0) as f32
}
