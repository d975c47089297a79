use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use rand::Rng;
use reqwest::{Body, Client};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected_sha256}, got {actual_sha256}")]
    IntegrityMismatch {
        expected_sha256: String,
        actual_sha256: String,
    },
}

/// Simultaneous transfers allowed per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub downloads: usize,
    pub uploads: usize,
}

impl TransferLimits {
    /// `YDSYNC_DOWNLOAD_CONCURRENCY` (default 4) and `YDSYNC_UPLOAD_CONCURRENCY` (default 2).
    pub fn from_env() -> Self {
        Self {
            downloads: env_limit("YDSYNC_DOWNLOAD_CONCURRENCY", 4),
            uploads: env_limit("YDSYNC_UPLOAD_CONCURRENCY", 2),
        }
    }
}

/// Streams file bodies to and from the pre-signed hrefs handed out by the API.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    downloads: Arc<Semaphore>,
    uploads: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_limits(TransferLimits::from_env())
    }

    pub fn with_limits(limits: TransferLimits) -> Self {
        Self {
            http: Client::new(),
            downloads: Arc::new(Semaphore::new(limits.downloads.max(1))),
            uploads: Arc::new(Semaphore::new(limits.uploads.max(1))),
        }
    }

    /// Writes the body under `staging`, then renames it onto `target`.
    /// `target` is only ever replaced by a complete, verified file that
    /// already has `mode` applied.
    pub async fn download_to_path(
        &self,
        href: &str,
        target: &Path,
        staging: &Path,
        expected_sha256: Option<&str>,
        mode: Option<u32>,
    ) -> Result<(), TransferError> {
        let _permit = permit(&self.downloads).await?;
        tokio::fs::create_dir_all(staging).await?;
        let partial = staging_path(staging, target);

        let written = match self.fetch_into(href, &partial).await {
            Ok(digest) => verify(digest, expected_sha256),
            Err(err) => Err(err),
        };
        let placed = match written {
            Ok(()) => place(&partial, target, mode).await,
            Err(err) => Err(err),
        };
        if placed.is_err() {
            if let Err(err) = tokio::fs::remove_file(&partial).await {
                tracing::trace!(path = %partial.display(), error = %err, "no partial file to remove");
            }
        }
        placed
    }

    /// Returns the SHA-256 of everything written.
    async fn fetch_into(&self, href: &str, partial: &Path) -> Result<String, TransferError> {
        let response = self
            .http
            .get(Url::parse(href)?)
            .send()
            .await?
            .error_for_status()?;
        let mut body = response.bytes_stream();
        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub async fn upload_from_path(&self, href: &str, source: &Path) -> Result<(), TransferError> {
        let _permit = permit(&self.uploads).await?;
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        self.http
            .put(url)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn permit(limit: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit, TransferError> {
    Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(|_| TransferError::ConcurrencyClosed)
}

fn verify(actual: String, expected: Option<&str>) -> Result<(), TransferError> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
            Err(TransferError::IntegrityMismatch {
                expected_sha256: expected.to_ascii_lowercase(),
                actual_sha256: actual,
            })
        }
        _ => Ok(()),
    }
}

async fn place(partial: &Path, target: &Path, mode: Option<u32>) -> Result<(), TransferError> {
    if let Some(mode) = mode {
        tokio::fs::set_permissions(partial, Permissions::from_mode(mode)).await?;
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(partial, target).await?;
    Ok(())
}

/// `<staging>/<name>.<random>.partial`, unique per concurrent download.
fn staging_path(staging: &Path, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let tag: u32 = rand::thread_rng().r#gen();
    staging.join(format!("{name}.{tag:08x}.partial"))
}

fn env_limit(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
