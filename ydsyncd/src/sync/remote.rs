use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use ydsync_core::{Completion, OperationStatus, Resource, ResourceType, YadiskClient, YadiskError};

use super::digest::parse_modified;
use super::paths::normalize_remote;
use super::transfer::{TransferClient, TransferError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(750);

/// Consecutive rate-limit or server errors tolerated while polling an operation.
const POLL_RETRIES: u32 = 5;

/// Key under `custom_properties` holding a file's permission bits.
const MODE_PROPERTY: &str = "mode";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("api error: {0}")]
    Api(#[from] YadiskError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("remote operation failed: {0}")]
    OperationFailed(String),
    #[error("remote path not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        match self {
            RemoteError::Api(err) => err.is_not_found(),
            RemoteError::NotFound(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One remote object, with the path normalized to `/a/b` and mtime in UTC epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: i64,
    pub sha256: Option<String>,
    /// Permission bits stored by the upload that produced this file.
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
    pub trash: u64,
}

/// Storage operations the engine depends on.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn info(&self) -> Result<Quota, RemoteError>;
    async fn last_uploaded(&self, limit: u32) -> Result<Vec<String>, RemoteError>;
    /// One page of the flat file listing sorted by path. A short page is the last one.
    async fn list(&self, page_size: u32, offset: u32) -> Result<Vec<RemoteEntry>, RemoteError>;
    async fn resource(&self, path: &str) -> Result<Option<RemoteEntry>, RemoteError>;
    /// Succeeds when the directory already exists.
    async fn mkdir(&self, path: &str) -> Result<(), RemoteError>;
    async fn delete(&self, path: &str, permanent: bool) -> Result<(), RemoteError>;
    async fn move_to(&self, from: &str, to: &str) -> Result<(), RemoteError>;
    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError>;
    async fn upload(&self, local: &Path, path: &str) -> Result<(), RemoteError>;
    /// Stores permission bits next to the file so a later download can restore them.
    async fn set_mode(&self, path: &str, mode: u32) -> Result<(), RemoteError>;
    /// Replaces `local` atomically, already carrying `mode` when given; a
    /// failure leaves no partial file behind.
    async fn download(
        &self,
        path: &str,
        local: &Path,
        expected_sha256: Option<&str>,
        mode: Option<u32>,
    ) -> Result<(), RemoteError>;
    async fn trash(&self) -> Result<(), RemoteError>;
}

/// [`RemoteClient`] over the Yandex Disk REST API.
pub struct YadiskRemote {
    client: YadiskClient,
    transfer: TransferClient,
    temp_dir: PathBuf,
    poll_interval: Duration,
}

impl YadiskRemote {
    pub fn new(client: YadiskClient, temp_dir: PathBuf) -> Self {
        Self {
            client,
            transfer: TransferClient::new(),
            temp_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Polls a long-running operation until it reaches a terminal status.
    async fn wait(&self, completion: Completion, what: &str) -> Result<(), RemoteError> {
        let link = match completion {
            Completion::Done => return Ok(()),
            Completion::Pending(link) => link,
        };
        let mut failures = 0u32;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.client.get_operation_status(link.href.as_str()).await {
                Ok(OperationStatus::Success) => return Ok(()),
                Ok(OperationStatus::Failure) => {
                    return Err(RemoteError::OperationFailed(what.to_string()));
                }
                Ok(OperationStatus::InProgress) => {
                    failures = 0;
                    tracing::trace!(operation = %link.href, "operation still in progress");
                }
                Err(err) if err.is_retryable() && failures < POLL_RETRIES => {
                    failures += 1;
                    tracing::debug!(operation = %link.href, error = %err, failures, "operation status unavailable");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn to_entry(resource: Resource) -> Result<RemoteEntry, RemoteError> {
    Ok(RemoteEntry {
        path: normalize_remote(&resource.path),
        kind: match resource.resource_type {
            ResourceType::File => EntryKind::File,
            ResourceType::Dir => EntryKind::Dir,
        },
        size: resource.size.unwrap_or(0),
        modified: parse_modified(resource.modified.as_deref())?.unwrap_or(0),
        sha256: resource.sha256,
        mode: resource
            .custom_properties
            .as_ref()
            .and_then(|properties| properties.get(MODE_PROPERTY))
            .and_then(|mode| mode.as_u64())
            .and_then(|mode| u32::try_from(mode).ok())
            .map(|mode| mode & 0o7777),
    })
}

#[async_trait]
impl RemoteClient for YadiskRemote {
    async fn info(&self) -> Result<Quota, RemoteError> {
        let info = self.client.get_disk_info().await?;
        Ok(Quota {
            total: info.total_space,
            used: info.used_space,
            trash: info.trash_size,
        })
    }

    async fn last_uploaded(&self, limit: u32) -> Result<Vec<String>, RemoteError> {
        let page = self.client.last_uploaded(limit).await?;
        Ok(page
            .items
            .into_iter()
            .map(|item| normalize_remote(&item.path))
            .collect())
    }

    async fn list(&self, page_size: u32, offset: u32) -> Result<Vec<RemoteEntry>, RemoteError> {
        let page = self.client.list_files(page_size, offset).await?;
        page.items.into_iter().map(to_entry).collect()
    }

    async fn resource(&self, path: &str) -> Result<Option<RemoteEntry>, RemoteError> {
        match self.client.get_resource(path).await {
            Ok(resource) => Ok(Some(to_entry(resource)?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        match self.client.create_folder(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_exists() => {
                tracing::debug!(path, "remote directory already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, path: &str, permanent: bool) -> Result<(), RemoteError> {
        let completion = self.client.delete_resource(path, permanent).await?;
        self.wait(completion, path).await
    }

    async fn move_to(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let completion = self.client.move_resource(from, to, true).await?;
        self.wait(completion, from).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let completion = self.client.copy_resource(from, to, false).await?;
        self.wait(completion, from).await
    }

    async fn upload(&self, local: &Path, path: &str) -> Result<(), RemoteError> {
        let link = self.client.get_upload_link(path, true).await?;
        self.transfer
            .upload_from_path(link.href.as_str(), local)
            .await?;
        Ok(())
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<(), RemoteError> {
        let mut properties = serde_json::Map::new();
        properties.insert(MODE_PROPERTY.to_string(), mode.into());
        self.client.set_custom_properties(path, properties).await?;
        Ok(())
    }

    async fn download(
        &self,
        path: &str,
        local: &Path,
        expected_sha256: Option<&str>,
        mode: Option<u32>,
    ) -> Result<(), RemoteError> {
        let link = self.client.get_download_link(path).await?;
        self.transfer
            .download_to_path(
                link.href.as_str(),
                local,
                &self.temp_dir,
                expected_sha256,
                mode,
            )
            .await?;
        Ok(())
    }

    async fn trash(&self) -> Result<(), RemoteError> {
        let completion = self.client.empty_trash().await?;
        self.wait(completion, "trash").await
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
