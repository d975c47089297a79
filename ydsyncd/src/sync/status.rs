use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use super::context::SyncContext;
use super::history::HistoryStore;
use super::remote::{Quota, RemoteClient};

/// Number of entries requested for the "last" notification.
pub const LAST_UPLOADED_LIMIT: u32 = 10;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    None,
    NoNet,
    Fault,
    Idle,
    Busy,
    Error,
    Exit,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::None => "none",
            SyncState::NoNet => "no_net",
            SyncState::Fault => "fault",
            SyncState::Idle => "idle",
            SyncState::Busy => "busy",
            SyncState::Error => "error",
            SyncState::Exit => "exit",
        }
    }

    /// Idle or error: the executor has drained.
    pub fn is_settled(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Error)
    }

    pub fn is_online(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Busy | SyncState::Error)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn transition_allowed(from: SyncState, to: SyncState) -> bool {
    use SyncState::*;
    match (from, to) {
        _ if from == to => false,
        (Exit, _) => false,
        (_, Exit) => true,
        (Fault, _) => false,
        (_, Fault) => true,
        (None, Busy | NoNet) => true,
        (NoNet, Busy | None) => true,
        (Busy, Idle | Error | None | NoNet) => true,
        (Idle | Error, Busy | None | NoNet) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aspect {
    Status,
    Progress,
    Last,
    Quota,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Status { state: SyncState, previous: SyncState },
    Progress { outstanding: usize },
    Last(Vec<String>),
    Quota(Quota),
    Conflict { path: String },
}

impl StatusEvent {
    pub fn aspect(&self) -> Aspect {
        match self {
            StatusEvent::Status { .. } => Aspect::Status,
            StatusEvent::Progress { .. } => Aspect::Progress,
            StatusEvent::Last(_) => Aspect::Last,
            StatusEvent::Quota(_) => Aspect::Quota,
            StatusEvent::Conflict { .. } => Aspect::Conflict,
        }
    }
}

#[derive(Debug)]
enum Notice {
    Transition {
        from: SyncState,
        to: SyncState,
        heal: bool,
    },
    Progress(usize),
    Conflict(String),
}

/// Receiving end of the notice queue, handed to [`StatusConsumer::new`].
pub struct StatusFeed {
    notices: mpsc::UnboundedReceiver<Notice>,
}

/// Owns the sync state. Every change goes through here and is queued for the
/// consumer task in the order it happened.
pub struct StatusManager {
    state: watch::Sender<SyncState>,
    ctx: Arc<SyncContext>,
    notices: mpsc::UnboundedSender<Notice>,
    events: broadcast::Sender<StatusEvent>,
}

impl StatusManager {
    pub fn new(ctx: Arc<SyncContext>) -> (Arc<Self>, StatusFeed) {
        let (notices, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SyncState::None);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let manager = Arc::new(Self {
            state,
            ctx,
            notices,
            events,
        });
        (manager, StatusFeed { notices: rx })
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Sender<StatusEvent> {
        self.events.clone()
    }

    /// Applies `to` if the state machine allows it. Returns whether the state changed.
    pub fn request(&self, to: SyncState) -> bool {
        self.state.send_if_modified(|state| {
            if !transition_allowed(*state, to) {
                return false;
            }
            let from = std::mem::replace(state, to);
            self.enqueue(Notice::Transition {
                from,
                to,
                heal: false,
            });
            true
        })
    }

    /// Moves a busy state to idle, or to error when the run was error-tainted.
    /// An error settle clears the flag and asks for one healing pass.
    pub fn settle(&self) -> Option<SyncState> {
        let mut settled = None;
        self.state.send_if_modified(|state| {
            if *state != SyncState::Busy {
                return false;
            }
            let heal = self.ctx.take_error();
            let to = if heal { SyncState::Error } else { SyncState::Idle };
            let from = std::mem::replace(state, to);
            self.enqueue(Notice::Transition { from, to, heal });
            settled = Some(to);
            true
        });
        settled
    }

    pub fn progress(&self, outstanding: usize) {
        self.enqueue(Notice::Progress(outstanding));
    }

    pub fn conflict(&self, path: &str) {
        self.enqueue(Notice::Conflict(path.to_string()));
    }

    fn enqueue(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            tracing::trace!("status consumer is gone");
        }
    }
}

/// Single task that delivers notifications, refreshes quota/last-uploaded
/// and flushes history whenever the engine settles.
pub struct StatusConsumer {
    feed: StatusFeed,
    events: broadcast::Sender<StatusEvent>,
    remote: Arc<dyn RemoteClient>,
    history: Arc<HistoryStore>,
    heal: mpsc::UnboundedSender<()>,
    quota: Option<Quota>,
    last: Option<Vec<String>>,
}

impl StatusConsumer {
    pub fn new(
        feed: StatusFeed,
        status: &StatusManager,
        remote: Arc<dyn RemoteClient>,
        history: Arc<HistoryStore>,
        heal: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            feed,
            events: status.events(),
            remote,
            history,
            heal,
            quota: None,
            last: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(notice) = self.feed.notices.recv().await {
            match notice {
                Notice::Transition { from, to, heal } => {
                    tracing::info!(from = %from, to = %to, "sync state changed");
                    self.emit(StatusEvent::Status {
                        state: to,
                        previous: from,
                    });
                    if to.is_settled() || to == SyncState::Exit {
                        self.flush_history().await;
                    }
                    if heal && self.heal.send(()).is_err() {
                        tracing::debug!("healing pass requested after engine stopped");
                    }
                    if to == SyncState::Exit {
                        break;
                    }
                    if to.is_online() {
                        self.refresh().await;
                    }
                }
                Notice::Progress(outstanding) => {
                    self.emit(StatusEvent::Progress { outstanding });
                }
                Notice::Conflict(path) => {
                    tracing::warn!(path = %path, "sync conflict");
                    self.emit(StatusEvent::Conflict { path });
                }
            }
        }
        tracing::debug!("status consumer stopped");
    }

    async fn flush_history(&self) {
        if let Err(err) = self.history.flush().await {
            tracing::error!(error = %err, "failed to persist sync history");
        }
    }

    async fn refresh(&mut self) {
        match self.remote.info().await {
            Ok(quota) if self.quota != Some(quota) => {
                self.quota = Some(quota);
                self.emit(StatusEvent::Quota(quota));
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "quota refresh failed"),
        }
        match self.remote.last_uploaded(LAST_UPLOADED_LIMIT).await {
            Ok(last) if self.last.as_ref() != Some(&last) => {
                self.last = Some(last.clone());
                self.emit(StatusEvent::Last(last));
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "last-uploaded refresh failed"),
        }
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
