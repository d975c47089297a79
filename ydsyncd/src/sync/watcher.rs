use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::pairing::{ChangeKind, LocalEvent, MovePairer, PendingEvent};
use super::paths::ExclusionSet;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("watcher is already running")]
    AlreadyStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Event(LocalEvent),
    Timeout,
    /// The watcher was stopped and every buffered event has been delivered.
    Closed,
}

/// Recursive watcher over the sync root producing paired [`LocalEvent`]s.
pub struct PathWatcher {
    root: PathBuf,
    pairer: MovePairer,
    watcher: Option<RecommendedWatcher>,
    raw: Option<mpsc::UnboundedReceiver<PendingEvent>>,
    ready: VecDeque<LocalEvent>,
}

impl PathWatcher {
    pub fn new(root: PathBuf, move_window: Duration) -> Self {
        Self {
            root,
            pairer: MovePairer::new(move_window),
            watcher: None,
            raw: None,
            ready: VecDeque::new(),
        }
    }

    pub fn start(&mut self, exclusions: ExclusionSet) -> Result<(), WatchError> {
        if self.watcher.is_some() {
            return Err(WatchError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let root = self.root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for pending in translate(&root, &exclusions, event) {
                    let _ = tx.send(pending);
                }
            }
            Err(err) => tracing::warn!(error = %err, "file watcher error"),
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        tracing::info!(root = %self.root.display(), "watching local changes");
        self.watcher = Some(watcher);
        self.raw = Some(rx);
        Ok(())
    }

    /// Stops watching. Events already received are still delivered by [`PathWatcher::next`].
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            tracing::info!(root = %self.root.display(), "stopped watching");
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    pub async fn next(&mut self, timeout: Duration) -> WatchEvent {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.ready.pop_front() {
                return WatchEvent::Event(event);
            }
            let now = Instant::now();
            self.ready.extend(self.pairer.expire(now));
            if !self.ready.is_empty() {
                continue;
            }
            let Some(raw) = self.raw.as_mut() else {
                return WatchEvent::Closed;
            };
            if now >= deadline {
                return WatchEvent::Timeout;
            }
            let wake = self
                .pairer
                .next_deadline()
                .map_or(deadline, |parked| parked.min(deadline));
            match tokio::time::timeout_at(wake, raw.recv()).await {
                Ok(Some(pending)) => {
                    let events = self.pairer.feed(pending, Instant::now());
                    self.ready.extend(events);
                }
                Ok(None) => {
                    self.raw = None;
                    self.ready.extend(self.pairer.flush());
                }
                Err(_) => {}
            }
        }
    }
}

/// Maps one notify event to raw changes, dropping excluded paths and the root itself.
fn translate(root: &Path, exclusions: &ExclusionSet, event: Event) -> Vec<PendingEvent> {
    let kind = match event.kind {
        EventKind::Create(kind) => Some((ChangeKind::Create, created_dir(kind))),
        EventKind::Remove(kind) => Some((ChangeKind::Delete, Some(kind == RemoveKind::Folder))),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some((ChangeKind::Modify, None)),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some((ChangeKind::Attrib, None)),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some((ChangeKind::MoveOut, None)),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some((ChangeKind::MoveIn, None)),
        // Rename halves arrive separately as From/To; content changes are
        // picked up on close-after-write.
        _ => None,
    };
    let Some((kind, is_dir)) = kind else {
        return Vec::new();
    };
    let cookie = match kind {
        ChangeKind::MoveOut | ChangeKind::MoveIn => event.attrs.tracker(),
        _ => None,
    };

    event
        .paths
        .into_iter()
        .filter(|path| path != root && path.starts_with(root) && !exclusions.contains(path))
        .map(|path| PendingEvent {
            is_dir: is_dir.unwrap_or_else(|| kind != ChangeKind::MoveOut && path.is_dir()),
            path,
            kind,
            cookie,
        })
        .collect()
}

fn created_dir(kind: CreateKind) -> Option<bool> {
    match kind {
        CreateKind::Folder => Some(true),
        CreateKind::File => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;
