use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::digest::mtime_secs;
use super::executor::{ExecutorError, TaskRunner, TaskSubmitter};
use super::history::{HistoryMarker, HistoryStore};
use super::paths::{ExclusionSet, PathError, ancestors, local_path_for, remote_path_for};
use super::reconciler::Reconciler;
use super::remote::{RemoteClient, RemoteError};
use super::task::SyncTask;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("path: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot queue follow-up task: {0}")]
    Executor(#[from] ExecutorError),
}

/// Executes [`SyncTask`]s against the remote and keeps history in step.
pub struct Operations {
    root: PathBuf,
    exclusions: ExclusionSet,
    remote: Arc<dyn RemoteClient>,
    history: Arc<HistoryStore>,
    reconciler: Reconciler,
    submitter: TaskSubmitter,
}

impl Operations {
    pub fn new(
        root: PathBuf,
        exclusions: ExclusionSet,
        remote: Arc<dyn RemoteClient>,
        history: Arc<HistoryStore>,
        reconciler: Reconciler,
        submitter: TaskSubmitter,
    ) -> Self {
        Self {
            root,
            exclusions,
            remote,
            history,
            reconciler,
            submitter,
        }
    }

    async fn upload(&self, path: &str) -> Result<(), TaskError> {
        let local = local_path_for(&self.root, path)?;
        let meta = match tokio::fs::metadata(&local).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path, "file vanished before upload");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if !meta.is_file() {
            return Ok(());
        }
        self.ensure_remote_parents(path).await?;
        self.remote.upload(&local, path).await?;
        self.history.record_file(path, mtime_secs(&meta));
        tracing::info!(path, size = meta.len(), "uploaded");
        let mode = meta.permissions().mode() & 0o7777;
        if let Err(err) = self.remote.set_mode(path, mode).await {
            tracing::warn!(path, error = %err, "failed to store file mode");
        }
        Ok(())
    }

    async fn download(
        &self,
        path: &str,
        sha256: Option<&str>,
        mode: Option<u32>,
    ) -> Result<(), TaskError> {
        let local = local_path_for(&self.root, path)?;
        self.remote.download(path, &local, sha256, mode).await?;
        let meta = tokio::fs::metadata(&local).await?;
        self.history.record_file(path, mtime_secs(&meta));
        for dir in ancestors(path) {
            self.history.record_dir(&dir);
        }
        tracing::info!(path, size = meta.len(), "downloaded");
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), TaskError> {
        self.ensure_remote_parents(path).await?;
        self.remote.mkdir(path).await?;
        self.history.record_dir(path);
        tracing::debug!(path, "remote directory created");
        Ok(())
    }

    /// A directory moved in from outside the root: its whole subtree is new.
    async fn create_tree(&self, path: &str) -> Result<(), TaskError> {
        self.mkdir(path).await?;
        let mut stack = vec![local_path_for(&self.root, path)?];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let local = entry.path();
                if self.exclusions.contains(&local) {
                    continue;
                }
                let remote = remote_path_for(&self.root, &local)?;
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    self.remote.mkdir(&remote).await?;
                    self.history.record_dir(&remote);
                    stack.push(local);
                } else if file_type.is_file() {
                    self.submitter.submit(SyncTask::Upload { path: remote })?;
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), TaskError> {
        match self.remote.delete(path, false).await {
            Ok(()) => tracing::info!(path, "remote copy deleted"),
            Err(err) if err.is_not_found() => tracing::debug!(path, "already absent remotely"),
            Err(err) => return Err(err.into()),
        }
        self.history.remove_subtree(path);
        Ok(())
    }

    async fn move_to(&self, from: &str, to: &str) -> Result<(), TaskError> {
        self.ensure_remote_parents(to).await?;
        match self.remote.move_to(from, to).await {
            Ok(()) => {
                self.history.rename_subtree(from, to);
                tracing::info!(from, to, "moved");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                // Never reached the remote side; send the new location as fresh content.
                tracing::debug!(from, to, "move source missing remotely");
                let local = local_path_for(&self.root, to)?;
                if tokio::fs::metadata(&local).await?.is_dir() {
                    self.create_tree(to).await
                } else {
                    self.upload(to).await
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), TaskError> {
        self.remote.copy(from, to).await?;
        tracing::info!(from, to, "copied remotely");
        // The copy only exists remotely; let reconciliation bring it down.
        self.submitter.submit(SyncTask::FullSync)?;
        Ok(())
    }

    /// Creates remote parents that history does not know as directories yet.
    async fn ensure_remote_parents(&self, path: &str) -> Result<(), TaskError> {
        for dir in ancestors(path) {
            if self.history.get(&dir) != Some(HistoryMarker::Dir) {
                self.remote.mkdir(&dir).await?;
                self.history.record_dir(&dir);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for Operations {
    async fn run(&self, task: &SyncTask) -> Result<(), TaskError> {
        match task {
            SyncTask::Upload { path } => self.upload(path).await,
            SyncTask::Download { path, sha256, mode } => {
                self.download(path, sha256.as_deref(), *mode).await
            }
            SyncTask::MkDir { path } => self.mkdir(path).await,
            SyncTask::CreateTree { path } => self.create_tree(path).await,
            SyncTask::Delete { path } => self.delete(path).await,
            SyncTask::Move { from, to } => self.move_to(from, to).await,
            SyncTask::Copy { from, to } => self.copy(from, to).await,
            SyncTask::Trash => {
                self.remote.trash().await?;
                tracing::info!("remote trash emptied");
                Ok(())
            }
            SyncTask::FullSync => self.reconciler.run(&self.submitter).await.map(|_| ()),
        }
    }
}
