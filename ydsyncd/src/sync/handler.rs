use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::context::SyncContext;
use super::digest::mtime_secs;
use super::executor::TaskSubmitter;
use super::history::HistoryStore;
use super::pairing::LocalEvent;
use super::paths::remote_path_for;
use super::task::SyncTask;
use super::watcher::{PathWatcher, WatchEvent};

const POLL: Duration = Duration::from_secs(1);

/// Turns local changes into remote tasks. Never waits on the network.
pub struct EventHandler {
    root: PathBuf,
    ctx: Arc<SyncContext>,
    history: Arc<HistoryStore>,
    submitter: TaskSubmitter,
}

impl EventHandler {
    pub fn new(
        root: PathBuf,
        ctx: Arc<SyncContext>,
        history: Arc<HistoryStore>,
        submitter: TaskSubmitter,
    ) -> Self {
        Self {
            root,
            ctx,
            history,
            submitter,
        }
    }

    /// Drains `watcher` until it closes or `token` is cancelled.
    pub async fn run(self, mut watcher: PathWatcher, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = watcher.next(POLL) => event,
            };
            match event {
                WatchEvent::Event(event) => self.handle(&event).await,
                WatchEvent::Timeout => {}
                WatchEvent::Closed => break,
            }
        }
        watcher.stop();
        tracing::debug!("event handler stopped");
    }

    pub async fn handle(&self, event: &LocalEvent) {
        let Some(task) = self.task_for(event).await else {
            return;
        };
        if let Err(err) = self.submitter.submit(task) {
            tracing::debug!(error = %err, "dropping local change");
        }
    }

    /// The remote task for one local change, if it needs any.
    pub async fn task_for(&self, event: &LocalEvent) -> Option<SyncTask> {
        match event {
            LocalEvent::Create {
                path,
                is_dir: true,
                moved_in,
            } => {
                let path = self.remote(path)?;
                Some(if *moved_in {
                    SyncTask::CreateTree { path }
                } else {
                    SyncTask::MkDir { path }
                })
            }
            LocalEvent::Create {
                path,
                is_dir: false,
                moved_in,
            } => self.upload(path, *moved_in).await,
            LocalEvent::Update { path } => self.upload(path, false).await,
            LocalEvent::Delete { path, .. } => Some(SyncTask::Delete {
                path: self.remote(path)?,
            }),
            LocalEvent::Move { from, to, .. } => Some(SyncTask::Move {
                from: self.remote(from)?,
                to: self.remote(to)?,
            }),
        }
    }

    /// Skips our own downloads. A file renamed into place is also skipped when
    /// its mtime is the one recorded by the last sync.
    async fn upload(&self, local: &Path, moved_in: bool) -> Option<SyncTask> {
        let path = self.remote(local)?;
        if self.ctx.is_downloading(&path) {
            tracing::trace!(path = %path, "change caused by download in flight");
            return None;
        }
        let meta = tokio::fs::metadata(local).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        if moved_in && self.history.file_mtime(&path) == Some(mtime_secs(&meta)) {
            tracing::trace!(path = %path, "unchanged since last sync");
            return None;
        }
        Some(SyncTask::Upload { path })
    }

    fn remote(&self, local: &Path) -> Option<String> {
        match remote_path_for(&self.root, local) {
            Ok(path) if path != "/" => Some(path),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(path = %local.display(), error = %err, "ignoring event");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
