use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_MOVE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Delete,
    Modify,
    Attrib,
    MoveOut,
    MoveIn,
}

/// Raw change as reported by the file-system watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub path: PathBuf,
    pub is_dir: bool,
    pub kind: ChangeKind,
    /// Links the two halves of a rename.
    pub cookie: Option<usize>,
}

/// Logical change after rename pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Create {
        path: PathBuf,
        is_dir: bool,
        /// Arrived through a rename from outside the watched tree.
        moved_in: bool,
    },
    Delete {
        path: PathBuf,
        is_dir: bool,
    },
    Update {
        path: PathBuf,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
        is_dir: bool,
    },
}

struct Parked {
    event: PendingEvent,
    deadline: Instant,
}

/// Pairs move-out/move-in halves by cookie. An unmatched half expires after
/// the window and degrades to a delete (move-out) or a create (move-in).
pub struct MovePairer {
    window: Duration,
    parked: HashMap<usize, Parked>,
}

impl MovePairer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            parked: HashMap::new(),
        }
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.parked.values().map(|parked| parked.deadline).min()
    }

    /// Consumes one raw event. Anything that expired by `now` is emitted first.
    pub fn feed(&mut self, event: PendingEvent, now: Instant) -> Vec<LocalEvent> {
        let mut out = self.expire(now);
        match (event.kind, event.cookie) {
            (ChangeKind::MoveOut | ChangeKind::MoveIn, Some(cookie)) => {
                match self.parked.remove(&cookie) {
                    Some(partner) if partner.event.kind != event.kind => {
                        out.push(pair(partner.event, event));
                    }
                    stale => {
                        if let Some(stale) = stale {
                            out.push(unpaired(stale.event));
                        }
                        self.parked.insert(
                            cookie,
                            Parked {
                                event,
                                deadline: now + self.window,
                            },
                        );
                    }
                }
            }
            (ChangeKind::MoveOut | ChangeKind::MoveIn, None) => out.push(unpaired(event)),
            (ChangeKind::Create, _) => out.push(LocalEvent::Create {
                path: event.path,
                is_dir: event.is_dir,
                moved_in: false,
            }),
            (ChangeKind::Delete, _) => out.push(LocalEvent::Delete {
                path: event.path,
                is_dir: event.is_dir,
            }),
            (ChangeKind::Modify | ChangeKind::Attrib, _) if !event.is_dir => {
                out.push(LocalEvent::Update { path: event.path });
            }
            (ChangeKind::Modify | ChangeKind::Attrib, _) => {}
        }
        out
    }

    pub fn expire(&mut self, now: Instant) -> Vec<LocalEvent> {
        let mut due: Vec<(Instant, usize)> = self
            .parked
            .iter()
            .filter(|(_, parked)| parked.deadline <= now)
            .map(|(cookie, parked)| (parked.deadline, *cookie))
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|(_, cookie)| self.parked.remove(&cookie))
            .map(|parked| unpaired(parked.event))
            .collect()
    }

    /// Expires everything regardless of deadlines.
    pub fn flush(&mut self) -> Vec<LocalEvent> {
        let mut rest: Vec<Parked> = self.parked.drain().map(|(_, parked)| parked).collect();
        rest.sort_by_key(|parked| parked.deadline);
        rest.into_iter().map(|parked| unpaired(parked.event)).collect()
    }
}

fn pair(first: PendingEvent, second: PendingEvent) -> LocalEvent {
    let (out, into) = if first.kind == ChangeKind::MoveOut {
        (first, second)
    } else {
        (second, first)
    };
    LocalEvent::Move {
        from: out.path,
        is_dir: out.is_dir || into.is_dir,
        to: into.path,
    }
}

fn unpaired(event: PendingEvent) -> LocalEvent {
    match event.kind {
        ChangeKind::MoveIn => LocalEvent::Create {
            path: event.path,
            is_dir: event.is_dir,
            moved_in: true,
        },
        _ => LocalEvent::Delete {
            path: event.path,
            is_dir: event.is_dir,
        },
    }
}
