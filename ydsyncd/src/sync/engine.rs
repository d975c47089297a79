use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;

use super::backoff::Backoff;
use super::context::SyncContext;
use super::executor::{ExecutorError, ShutdownMode, TaskExecutor, TaskHandle};
use super::handler::EventHandler;
use super::history::{HistoryError, HistoryStore};
use super::ops::Operations;
use super::paths::{ExclusionSet, normalize_remote};
use super::reconciler::Reconciler;
use super::remote::RemoteClient;
use super::status::{StatusConsumer, StatusEvent, StatusManager, SyncState};
use super::task::SyncTask;
use super::watcher::{PathWatcher, WatchError};

const HEAL_BASE: Duration = Duration::from_secs(1);
const HEAL_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("history error: {0}")]
    History(#[from] HistoryError),
    #[error("watcher error: {0}")]
    Watch(#[from] WatchError),
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine is shut down")]
    ShutDown,
}

struct WatchTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything started by one `connect`, torn down by `disconnect`.
struct Session {
    token: CancellationToken,
    watch: Option<WatchTask>,
    reconnect: Option<JoinHandle<()>>,
}

/// One synchronized root: wires history, watcher, executor, reconciler and
/// status reporting around a [`RemoteClient`].
pub struct SyncEngine {
    config: EngineConfig,
    remote: Arc<dyn RemoteClient>,
    history: Arc<HistoryStore>,
    ctx: Arc<SyncContext>,
    status: Arc<StatusManager>,
    executor: TaskExecutor,
    exclusions: ExclusionSet,
    session: tokio::sync::Mutex<Option<Session>>,
    stopping: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Opens `<work_dir>/history.db` and builds the engine.
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteClient>,
    ) -> Result<Arc<Self>, EngineError> {
        tokio::fs::create_dir_all(&config.work_dir).await?;
        let history = HistoryStore::open(&config.history_db()).await?;
        tracing::info!(
            root = %config.root.display(),
            entries = history.len(),
            "sync history opened"
        );
        Self::new(config, remote, Arc::new(history))
    }

    /// Starts the executor and status tasks; must run inside a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        remote: Arc<dyn RemoteClient>,
        history: Arc<HistoryStore>,
    ) -> Result<Arc<Self>, EngineError> {
        let ctx = Arc::new(SyncContext::new());
        let (status, feed) = StatusManager::new(Arc::clone(&ctx));
        let exclusions = ExclusionSet::new(config.effective_exclusions());
        let executor = TaskExecutor::new(config.workers, Arc::clone(&ctx), Arc::clone(&status));

        let reconciler = Reconciler::new(
            config.root.clone(),
            exclusions.clone(),
            Arc::clone(&remote),
            Arc::clone(&history),
            Arc::clone(&ctx),
            Arc::clone(&status),
            config.page_size,
            config.conflict_policy,
        );
        let ops = Operations::new(
            config.root.clone(),
            exclusions.clone(),
            Arc::clone(&remote),
            Arc::clone(&history),
            reconciler,
            executor.submitter(),
        );
        executor.start(Arc::new(ops))?;

        let (heal_tx, heal_rx) = mpsc::unbounded_channel();
        let consumer = StatusConsumer::new(
            feed,
            &status,
            Arc::clone(&remote),
            Arc::clone(&history),
            heal_tx,
        );
        let state_rx = status.watch();

        let engine = Arc::new(Self {
            config,
            remote,
            history,
            ctx,
            status,
            executor,
            exclusions,
            session: tokio::sync::Mutex::new(None),
            stopping: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        });

        let heal = tokio::spawn(heal_loop(
            Arc::downgrade(&engine),
            heal_rx,
            state_rx,
            engine.stopping.clone(),
        ));
        let mut background = lock(&engine.background);
        background.push(tokio::spawn(consumer.run()));
        background.push(heal);
        drop(background);

        tracing::debug!(workers = engine.executor.size(), "sync engine ready");
        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn state(&self) -> SyncState {
        self.status.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.status.watch()
    }

    pub fn outstanding(&self) -> usize {
        self.executor.outstanding()
    }

    /// Probes the remote and starts watching, or goes to `no_net` and keeps
    /// probing in the background. An unreadable root is a terminal `fault`.
    pub async fn connect(self: &Arc<Self>) -> Result<SyncState, EngineError> {
        let mut session = self.session.lock().await;
        match self.state() {
            SyncState::Exit => return Err(EngineError::ShutDown),
            SyncState::Fault => return Ok(SyncState::Fault),
            _ if session.is_some() => return Ok(self.state()),
            _ => {}
        }

        if let Err(err) = readable_dir(&self.config.root).await {
            tracing::error!(root = %self.config.root.display(), error = %err, "sync root is not accessible");
            self.status.request(SyncState::Fault);
            return Ok(SyncState::Fault);
        }

        let mut current = Session {
            token: CancellationToken::new(),
            watch: None,
            reconnect: None,
        };
        match self.remote.info().await {
            Ok(quota) => {
                tracing::info!(
                    root = %self.config.root.display(),
                    used = quota.used,
                    total = quota.total,
                    "connected"
                );
                self.go_online(&mut current)?;
            }
            Err(err) => {
                tracing::warn!(error = %err, "remote is unreachable, retrying in background");
                self.go_offline(&mut current).await;
            }
        }
        *session = Some(current);
        Ok(self.state())
    }

    /// Stops watching and reconnecting; the engine can be connected again.
    pub async fn disconnect(&self) {
        if !self.stop_session().await {
            return;
        }
        self.status.request(SyncState::None);
        if let Err(err) = self.history.flush().await {
            tracing::error!(error = %err, "failed to persist sync history");
        }
        tracing::info!(root = %self.config.root.display(), "disconnected");
    }

    pub fn full_sync(&self) -> Result<TaskHandle, EngineError> {
        Ok(self.executor.submit(SyncTask::FullSync)?)
    }

    /// Empties the remote trash.
    pub fn trash(&self) -> Result<TaskHandle, EngineError> {
        Ok(self.executor.submit(SyncTask::Trash)?)
    }

    /// Copies remotely; the copy reaches the local tree through the follow-up reconciliation.
    pub fn copy(&self, from: &str, to: &str) -> Result<TaskHandle, EngineError> {
        Ok(self.executor.submit(SyncTask::Copy {
            from: normalize_remote(from),
            to: normalize_remote(to),
        })?)
    }

    /// Excludes `path` (relative paths are taken under the root) from
    /// watching and reconciliation from now on.
    pub fn add_exclusion(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.root.join(path)
        };
        tracing::info!(path = %path.display(), "exclusion added");
        self.exclusions.add(path);
    }

    pub fn exclusions(&self) -> Vec<PathBuf> {
        self.exclusions.to_vec()
    }

    pub fn status_line(&self) -> String {
        let state = self.state();
        let connection = match state {
            SyncState::None => "disconnected",
            SyncState::NoNet => "offline",
            SyncState::Fault => "unavailable",
            SyncState::Exit => "stopped",
            SyncState::Idle | SyncState::Busy | SyncState::Error => "connected",
        };
        let mut line = format!("{}: {state} ({connection})", self.config.root.display());
        let outstanding = self.executor.outstanding();
        if outstanding > 0 {
            line.push_str(&format!(", {outstanding} pending"));
        }
        line
    }

    /// Waits until the engine is not busy and returns the state it settled in.
    pub async fn wait_settled(&self) -> SyncState {
        let mut rx = self.status.watch();
        match rx.wait_for(|state| *state != SyncState::Busy).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Stops watching, drains or cancels queued work, publishes `exit` and
    /// persists history.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        self.stopping.cancel();
        self.stop_session().await;
        self.executor.shutdown(mode).await;
        self.status.request(SyncState::Exit);

        let background: Vec<JoinHandle<()>> = lock(&self.background).drain(..).collect();
        for task in background {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "engine task aborted");
            }
        }
        if let Err(err) = self.history.flush().await {
            tracing::error!(error = %err, "failed to persist sync history");
        }
        self.history.close().await;
        tracing::info!(root = %self.config.root.display(), "sync engine stopped");
    }

    fn go_online(&self, session: &mut Session) -> Result<(), EngineError> {
        let mut watcher = PathWatcher::new(self.config.root.clone(), self.config.move_window);
        watcher.start(self.exclusions.clone())?;
        let handler = EventHandler::new(
            self.config.root.clone(),
            Arc::clone(&self.ctx),
            Arc::clone(&self.history),
            self.executor.submitter(),
        );
        let token = session.token.child_token();
        session.watch = Some(WatchTask {
            handle: tokio::spawn(handler.run(watcher, token.clone())),
            token,
        });
        self.executor.submit(SyncTask::FullSync)?;
        Ok(())
    }

    async fn go_offline(self: &Arc<Self>, session: &mut Session) {
        if let Some(watch) = session.watch.take() {
            watch.token.cancel();
            if let Err(err) = watch.handle.await {
                tracing::error!(error = %err, "event handler aborted");
            }
        }
        self.status.request(SyncState::NoNet);
        if session
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        session.reconnect = Some(tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            session.token.child_token(),
        )));
    }

    /// Called by the reconnect loop after a successful probe.
    async fn reconnected(&self, token: &CancellationToken) {
        let mut session = self.session.lock().await;
        if token.is_cancelled() {
            return;
        }
        let Some(current) = session.as_mut() else {
            return;
        };
        current.reconnect = None;
        tracing::info!(root = %self.config.root.display(), "remote reachable again");
        if let Err(err) = self.go_online(current) {
            tracing::error!(error = %err, "failed to resume synchronization");
        }
    }

    /// One reconciliation pass after an error-tainted run, or back to
    /// `no_net` if the remote stopped answering.
    async fn heal(self: &Arc<Self>) {
        let mut session = self.session.lock().await;
        let Some(current) = session.as_mut() else {
            return;
        };
        if current.watch.is_none() {
            return;
        }
        match self.remote.info().await {
            Ok(_) => {
                tracing::info!("running healing reconciliation pass");
                if let Err(err) = self.executor.submit(SyncTask::FullSync) {
                    tracing::debug!(error = %err, "healing pass not queued");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "remote is unreachable, going offline");
                self.go_offline(current).await;
            }
        }
    }

    /// Returns whether a session was running.
    async fn stop_session(&self) -> bool {
        // Released before joining: the reconnect loop takes this lock.
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return false;
        };
        session.token.cancel();
        if let Some(watch) = session.watch {
            if let Err(err) = watch.handle.await {
                tracing::error!(error = %err, "event handler aborted");
            }
        }
        if let Some(reconnect) = session.reconnect {
            if let Err(err) = reconnect.await {
                tracing::error!(error = %err, "reconnect task aborted");
            }
        }
        true
    }
}

async fn readable_dir(root: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::metadata(root).await?;
    if !meta.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            "sync root is not a directory",
        ));
    }
    tokio::fs::read_dir(root).await.map(|_| ())
}

async fn reconnect_loop(engine: Weak<SyncEngine>, token: CancellationToken) {
    let backoff = Backoff::reconnect();
    let mut attempt = 0u32;
    loop {
        let delay = backoff.delay(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "next connection probe");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let Some(engine) = engine.upgrade() else {
            return;
        };
        match engine.remote.info().await {
            Ok(_) => {
                engine.reconnected(&token).await;
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "connection probe failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Serves healing requests from the status consumer. Back-to-back requests
/// without an idle run in between are spaced out exponentially.
async fn heal_loop(
    engine: Weak<SyncEngine>,
    mut requests: mpsc::UnboundedReceiver<()>,
    mut state: watch::Receiver<SyncState>,
    stopping: CancellationToken,
) {
    let backoff = Backoff::new(HEAL_BASE, HEAL_MAX, true);
    let mut streak = 0u32;
    loop {
        tokio::select! {
            _ = stopping.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                if *state.borrow_and_update() == SyncState::Idle {
                    streak = 0;
                }
            }
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
                if streak > 0 {
                    let delay = backoff.delay(streak - 1);
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "delaying healing pass");
                    tokio::select! {
                        _ = stopping.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                streak = streak.saturating_add(1);
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.heal().await;
            }
        }
    }
    tracing::trace!("heal loop stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
