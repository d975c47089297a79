use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::conflict::{ConflictPolicy, FileDecision, conflict_path, decide_file};
use super::context::SyncContext;
use super::digest::{mtime_secs, sha256_file};
use super::executor::TaskSubmitter;
use super::history::HistoryStore;
use super::ops::TaskError;
use super::paths::{ExclusionSet, ancestors, is_under, local_path_for, remote_path_for};
use super::remote::{RemoteClient, RemoteEntry};
use super::status::StatusManager;
use super::task::SyncTask;

pub const DEFAULT_PAGE_SIZE: u32 = 30;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub listed: usize,
    pub in_sync: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub conflicts: usize,
    pub remote_deletes: usize,
    pub mkdirs: usize,
    pub purged: usize,
}

#[derive(Default)]
struct Pass {
    /// Remote paths already accounted for; the local walk skips them.
    visited: HashSet<String>,
    remote_seen: HashSet<String>,
    local_seen: HashSet<String>,
    doomed: BTreeSet<String>,
    /// Files known to history that are gone locally.
    gone: Vec<String>,
    /// New remote files this pass brings down.
    incoming: Vec<String>,
    report: ReconcileReport,
}

impl Pass {
    fn mark(&mut self, path: &str) {
        self.visited.extend(ancestors(path));
        self.visited.insert(path.to_string());
    }

    fn doom(&mut self, path: String) {
        keep_outermost(&mut self.doomed, path);
    }

    fn receives(&self, dir: &str) -> bool {
        self.incoming.iter().any(|path| is_under(path, dir))
    }
}

/// Adds `path` unless an ancestor is already present, dropping its descendants.
fn keep_outermost(set: &mut BTreeSet<String>, path: String) {
    if set.iter().any(|kept| is_under(&path, kept)) {
        return;
    }
    set.retain(|kept| !is_under(kept, &path));
    set.insert(path);
}

/// Full-tree comparison between the remote listing, the local tree and history.
pub struct Reconciler {
    root: PathBuf,
    exclusions: ExclusionSet,
    remote: Arc<dyn RemoteClient>,
    history: Arc<HistoryStore>,
    ctx: Arc<SyncContext>,
    status: Arc<StatusManager>,
    page_size: u32,
    policy: ConflictPolicy,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        exclusions: ExclusionSet,
        remote: Arc<dyn RemoteClient>,
        history: Arc<HistoryStore>,
        ctx: Arc<SyncContext>,
        status: Arc<StatusManager>,
        page_size: u32,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            root,
            exclusions,
            remote,
            history,
            ctx,
            status,
            page_size: page_size.max(1),
            policy,
        }
    }

    /// Runs a pass unless one is already in flight, in which case the request
    /// is folded into a single follow-up pass. Returns `None` when coalesced.
    pub async fn run(
        &self,
        submitter: &TaskSubmitter,
    ) -> Result<Option<ReconcileReport>, TaskError> {
        if !self.ctx.try_begin_full_sync() {
            tracing::debug!("reconciliation already running, follow-up scheduled");
            return Ok(None);
        }
        loop {
            let result = self.pass(submitter).await;
            let again = self.ctx.end_full_sync();
            let report = result?;
            tracing::info!(
                listed = report.listed,
                in_sync = report.in_sync,
                uploads = report.uploads,
                downloads = report.downloads,
                conflicts = report.conflicts,
                remote_deletes = report.remote_deletes,
                mkdirs = report.mkdirs,
                purged = report.purged,
                "reconciliation pass finished"
            );
            if !(again && self.ctx.try_begin_full_sync()) {
                return Ok(Some(report));
            }
            tracing::debug!("running coalesced reconciliation pass");
        }
    }

    async fn pass(&self, submitter: &TaskSubmitter) -> Result<ReconcileReport, TaskError> {
        let mut pass = Pass::default();

        let mut offset = 0u32;
        loop {
            let page = self.remote.list(self.page_size, offset).await?;
            let count = page.len() as u32;
            for entry in &page {
                pass.report.listed += 1;
                if let Err(err) = self.visit_remote(entry, &mut pass, submitter).await {
                    tracing::warn!(path = %entry.path, error = %err, "failed to reconcile remote entry");
                    self.ctx.set_error();
                }
            }
            if count < self.page_size {
                break;
            }
            offset += count;
        }

        for path in self.deletions(&mut pass) {
            tracing::info!(path = %path, "deleted locally, removing remote copy");
            submitter.submit(SyncTask::Delete { path })?;
            pass.report.remote_deletes += 1;
        }

        self.walk_local(&mut pass, submitter).await?;
        pass.report.purged = self.purge(&pass);
        Ok(pass.report)
    }

    async fn visit_remote(
        &self,
        entry: &RemoteEntry,
        pass: &mut Pass,
        submitter: &TaskSubmitter,
    ) -> Result<(), TaskError> {
        let local = local_path_for(&self.root, &entry.path)?;
        if self.exclusions.contains(&local) {
            return Ok(());
        }
        pass.remote_seen.extend(ancestors(&entry.path));
        pass.remote_seen.insert(entry.path.clone());

        let meta = match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return self.remote_only(entry, &local, pass, submitter).await;
            }
            Err(err) => return Err(err.into()),
        };
        pass.mark(&entry.path);
        if !meta.is_file() {
            tracing::debug!(path = %entry.path, "local counterpart is not a regular file");
            return Ok(());
        }

        let local_hash = sha256_file(&local).await?;
        let local_mtime = mtime_secs(&meta);
        if entry
            .sha256
            .as_deref()
            .is_some_and(|remote_hash| remote_hash.eq_ignore_ascii_case(&local_hash))
        {
            self.history.record_file(&entry.path, local_mtime);
            for dir in ancestors(&entry.path) {
                self.history.record_dir(&dir);
            }
            pass.report.in_sync += 1;
            return Ok(());
        }

        let history = self.history.file_mtime(&entry.path);
        match decide_file(local_mtime, entry.modified, history) {
            FileDecision::Upload => {
                submitter.submit(SyncTask::Upload {
                    path: entry.path.clone(),
                })?;
                pass.report.uploads += 1;
            }
            FileDecision::Download => {
                self.download(entry, submitter)?;
                pass.report.downloads += 1;
            }
            FileDecision::Conflict => {
                self.conflict(entry, &local, local_mtime, pass, submitter)
                    .await?;
            }
        }
        Ok(())
    }

    /// Remote file without a local counterpart: deleted here since the last
    /// sync if history knows it, otherwise new on the remote side.
    async fn remote_only(
        &self,
        entry: &RemoteEntry,
        local: &Path,
        pass: &mut Pass,
        submitter: &TaskSubmitter,
    ) -> Result<(), TaskError> {
        if self.history.contains(&entry.path) {
            let target = self.shortest_missing(&entry.path).await?;
            pass.gone.push(entry.path.clone());
            pass.doom(target);
            return Ok(());
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        pass.incoming.push(entry.path.clone());
        pass.mark(&entry.path);
        self.download(entry, submitter)?;
        pass.report.downloads += 1;
        Ok(())
    }

    /// Outermost known path on the way to `path` that is gone locally.
    async fn shortest_missing(&self, path: &str) -> Result<String, TaskError> {
        for candidate in ancestors(path) {
            if !self.history.contains(&candidate) {
                continue;
            }
            let local = local_path_for(&self.root, &candidate)?;
            if !tokio::fs::try_exists(&local).await? {
                return Ok(candidate);
            }
        }
        Ok(path.to_string())
    }

    /// Remote deletions for the pass. A doomed directory that also receives
    /// new remote files is narrowed to the gone entries beneath it, so the
    /// directory and the history of its survivors stay in place.
    fn deletions(&self, pass: &mut Pass) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for target in std::mem::take(&mut pass.doomed) {
            if !pass.receives(&target) {
                keep_outermost(&mut out, target);
                continue;
            }
            tracing::debug!(path = %target, "deleted locally but receiving new files, narrowing");
            for path in pass.gone.iter().filter(|path| is_under(path, &target)) {
                let narrowed = ancestors(path)
                    .into_iter()
                    .filter(|dir| dir.len() > target.len() && is_under(dir, &target))
                    .find(|dir| self.history.contains(dir) && !pass.receives(dir))
                    .unwrap_or_else(|| path.clone());
                keep_outermost(&mut out, narrowed);
            }
        }
        out
    }

    async fn conflict(
        &self,
        entry: &RemoteEntry,
        local: &Path,
        local_mtime: i64,
        pass: &mut Pass,
        submitter: &TaskSubmitter,
    ) -> Result<(), TaskError> {
        pass.report.conflicts += 1;
        self.status.conflict(&entry.path);
        match self.policy {
            ConflictPolicy::Report => {
                tracing::warn!(path = %entry.path, "both sides changed, leaving the file as is");
            }
            ConflictPolicy::KeepBoth => {
                let renamed = conflict_path(&entry.path, local_mtime);
                let renamed_local = local_path_for(&self.root, &renamed)?;
                tracing::warn!(path = %entry.path, kept_as = %renamed, "both sides changed, keeping both");
                tokio::fs::copy(local, &renamed_local).await?;
                pass.mark(&renamed);
                submitter.submit(SyncTask::Upload { path: renamed })?;
                self.download(entry, submitter)?;
            }
        }
        Ok(())
    }

    fn download(&self, entry: &RemoteEntry, submitter: &TaskSubmitter) -> Result<(), TaskError> {
        self.ctx.begin_download(&entry.path);
        let submitted = submitter.submit(SyncTask::Download {
            path: entry.path.clone(),
            sha256: entry.sha256.clone(),
            mode: entry.mode,
        });
        if let Err(err) = submitted {
            self.ctx.finish_download(&entry.path);
            return Err(err.into());
        }
        Ok(())
    }

    /// Creates unvisited local directories remotely and uploads unvisited files.
    async fn walk_local(&self, pass: &mut Pass, submitter: &TaskSubmitter) -> Result<(), TaskError> {
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if dir != self.root => {
                    tracing::warn!(dir = %dir.display(), error = %err, "cannot read local directory");
                    self.ctx.set_error();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if self.exclusions.contains(&path) {
                    continue;
                }
                let remote = remote_path_for(&self.root, &path)?;
                let file_type = entry.file_type().await?;
                pass.local_seen.insert(remote.clone());

                if file_type.is_dir() {
                    if !pass.visited.contains(&remote) {
                        self.remote.mkdir(&remote).await?;
                        self.history.record_dir(&remote);
                        pass.report.mkdirs += 1;
                    }
                    stack.push(path);
                } else if file_type.is_file() && !pass.visited.contains(&remote) {
                    submitter.submit(SyncTask::Upload { path: remote })?;
                    pass.report.uploads += 1;
                }
            }
        }
        Ok(())
    }

    /// Drops history entries that exist on neither side.
    fn purge(&self, pass: &Pass) -> usize {
        self.history
            .paths()
            .into_iter()
            .filter(|path| !pass.remote_seen.contains(path) && !pass.local_seen.contains(path))
            .filter(|path| self.history.remove(path))
            .count()
    }
}
