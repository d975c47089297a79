use std::fmt;

/// One unit of remote work. Paths are remote-style (`/a/b.txt`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTask {
    Upload { path: String },
    /// `mode` holds permission bits to restore on the placed file.
    Download {
        path: String,
        sha256: Option<String>,
        mode: Option<u32>,
    },
    MkDir { path: String },
    /// Remote mkdir followed by a recursive mkdir/upload of the local subtree.
    CreateTree { path: String },
    Delete { path: String },
    Move { from: String, to: String },
    Copy { from: String, to: String },
    Trash,
    FullSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Upload,
    Download,
    MkDir,
    CreateTree,
    Delete,
    Move,
    Copy,
    Trash,
    FullSync,
}

impl SyncTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            SyncTask::Upload { .. } => TaskKind::Upload,
            SyncTask::Download { .. } => TaskKind::Download,
            SyncTask::MkDir { .. } => TaskKind::MkDir,
            SyncTask::CreateTree { .. } => TaskKind::CreateTree,
            SyncTask::Delete { .. } => TaskKind::Delete,
            SyncTask::Move { .. } => TaskKind::Move,
            SyncTask::Copy { .. } => TaskKind::Copy,
            SyncTask::Trash => TaskKind::Trash,
            SyncTask::FullSync => TaskKind::FullSync,
        }
    }

    /// Primary path the task acts on, if any. Moves and copies report the target.
    pub fn path(&self) -> Option<&str> {
        match self {
            SyncTask::Upload { path }
            | SyncTask::Download { path, .. }
            | SyncTask::MkDir { path }
            | SyncTask::CreateTree { path }
            | SyncTask::Delete { path } => Some(path),
            SyncTask::Move { to, .. } | SyncTask::Copy { to, .. } => Some(to),
            SyncTask::Trash | SyncTask::FullSync => None,
        }
    }
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Upload => "upload",
            TaskKind::Download => "download",
            TaskKind::MkDir => "mkdir",
            TaskKind::CreateTree => "create_tree",
            TaskKind::Delete => "delete",
            TaskKind::Move => "move",
            TaskKind::Copy => "copy",
            TaskKind::Trash => "trash",
            TaskKind::FullSync => "full_sync",
        }
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTask::Move { from, to } | SyncTask::Copy { from, to } => {
                write!(f, "{} {from} -> {to}", self.kind().as_str())
            }
            _ => match self.path() {
                Some(path) => write!(f, "{} {path}", self.kind().as_str()),
                None => f.write_str(self.kind().as_str()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed(String),
    Cancelled,
}
