use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::sync::conflict::ConflictPolicy;
use crate::sync::executor::default_workers;
use crate::sync::pairing::DEFAULT_MOVE_WINDOW;
use crate::sync::reconciler::DEFAULT_PAGE_SIZE;
use crate::sync::remote::DEFAULT_POLL_INTERVAL;

const DEFAULT_SYNC_DIR_NAME: &str = "Yandex.Disk";
const WORK_DIR_NAME: &str = ".ydsync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory is unavailable")]
    NoHome,
    #[error("{0}")]
    Invalid(String),
}

/// Everything the engine needs besides the remote client.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub work_dir: PathBuf,
    pub exclusions: Vec<PathBuf>,
    pub workers: usize,
    pub page_size: u32,
    pub move_window: Duration,
    pub poll_interval: Duration,
    pub conflict_policy: ConflictPolicy,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            work_dir: root.join(WORK_DIR_NAME),
            root,
            exclusions: Vec::new(),
            workers: default_workers(),
            page_size: DEFAULT_PAGE_SIZE,
            move_window: DEFAULT_MOVE_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            conflict_policy: ConflictPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        let root = std::env::var("YDSYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let mut config = Self::new(root);

        if let Ok(value) = std::env::var("YDSYNC_WORK_DIR") {
            config.work_dir = expand_with_home(&value, &home);
        }
        if let Ok(value) = std::env::var("YDSYNC_EXCLUDE") {
            config.exclusions = parse_exclusions(&value, &config.root, &home);
        }
        config.workers = read_u64_env("YDSYNC_WORKERS", config.workers as u64).max(1) as usize;
        config.page_size =
            read_u64_env("YDSYNC_PAGE_SIZE", u64::from(config.page_size)).clamp(1, 10_000) as u32;
        config.move_window = Duration::from_millis(read_u64_env(
            "YDSYNC_MOVE_WINDOW_MS",
            DEFAULT_MOVE_WINDOW.as_millis() as u64,
        ));
        config.poll_interval = Duration::from_millis(read_u64_env(
            "YDSYNC_POLL_MS",
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        ));
        if let Ok(value) = std::env::var("YDSYNC_CONFLICT_POLICY") {
            config.conflict_policy = value.parse().map_err(ConfigError::Invalid)?;
        }
        Ok(config)
    }

    /// Configured exclusions plus the work directory, which is never synchronized.
    pub fn effective_exclusions(&self) -> Vec<PathBuf> {
        let mut out = self.exclusions.clone();
        if !out.contains(&self.work_dir) {
            out.push(self.work_dir.clone());
        }
        out
    }

    pub fn history_db(&self) -> PathBuf {
        self.work_dir.join("history.db")
    }
}

/// `:`-separated list; relative entries are taken under the sync root.
fn parse_exclusions(value: &str, root: &Path, home: &Path) -> Vec<PathBuf> {
    value
        .split(':')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let path = expand_with_home(entry, home);
            if path.is_absolute() {
                path
            } else {
                root.join(path)
            }
        })
        .collect()
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

pub(crate) fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
