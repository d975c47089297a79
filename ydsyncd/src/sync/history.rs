use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use super::paths::is_under;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid history kind: {0}")]
    InvalidKind(String),
}

/// Last synchronized state of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryMarker {
    /// Local mtime (epoch seconds) recorded after the last successful transfer.
    File { modified: i64 },
    Dir,
}

impl HistoryMarker {
    fn kind_str(&self) -> &'static str {
        match self {
            HistoryMarker::File { .. } => "file",
            HistoryMarker::Dir => "dir",
        }
    }

    fn modified(&self) -> Option<i64> {
        match self {
            HistoryMarker::File { modified } => Some(*modified),
            HistoryMarker::Dir => None,
        }
    }
}

/// In-memory history map, persisted to SQLite by [`HistoryStore::flush`].
pub struct HistoryStore {
    pool: SqlitePool,
    entries: Mutex<BTreeMap<String, HistoryMarker>>,
    dirty: AtomicBool,
}

impl HistoryStore {
    pub async fn open(db_path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, HistoryError> {
        MIGRATOR.run(&pool).await?;
        let rows = sqlx::query("SELECT path, kind, modified FROM history")
            .fetch_all(&pool)
            .await?;
        let mut entries = BTreeMap::new();
        for row in rows {
            let path: String = row.try_get("path")?;
            let kind: String = row.try_get("kind")?;
            let marker = match kind.as_str() {
                "file" => HistoryMarker::File {
                    modified: row.try_get::<Option<i64>, _>("modified")?.unwrap_or(0),
                },
                "dir" => HistoryMarker::Dir,
                other => return Err(HistoryError::InvalidKind(other.to_string())),
            };
            entries.insert(path, marker);
        }
        tracing::debug!(entries = entries.len(), "history loaded");
        Ok(Self {
            pool,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn get(&self, path: &str) -> Option<HistoryMarker> {
        self.lock().get(path).copied()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    pub fn file_mtime(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(|marker| marker.modified())
    }

    pub fn record_file(&self, path: &str, modified: i64) {
        self.insert(path, HistoryMarker::File { modified });
    }

    pub fn record_dir(&self, path: &str) {
        self.insert(path, HistoryMarker::Dir);
    }

    pub fn remove(&self, path: &str) -> bool {
        let removed = self.lock().remove(path).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Drops `prefix` and everything beneath it.
    pub fn remove_subtree(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .filter(|(path, _)| is_under(path, prefix))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &doomed {
            entries.remove(path);
        }
        drop(entries);
        if !doomed.is_empty() {
            self.mark_dirty();
        }
        doomed.len()
    }

    /// Re-keys `from` and its subtree under `to`.
    pub fn rename_subtree(&self, from: &str, to: &str) -> usize {
        let mut entries = self.lock();
        let moved: Vec<(String, HistoryMarker)> = entries
            .range(from.to_string()..)
            .take_while(|(path, _)| path.starts_with(from))
            .filter(|(path, _)| is_under(path, from))
            .map(|(path, marker)| (path.clone(), *marker))
            .collect();
        for (path, marker) in &moved {
            entries.remove(path);
            entries.insert(format!("{to}{}", &path[from.len()..]), *marker);
        }
        drop(entries);
        if !moved.is_empty() {
            self.mark_dirty();
        }
        moved.len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Writes the whole map in one transaction if it changed since the last flush.
    pub async fn flush(&self) -> Result<bool, HistoryError> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let snapshot: Vec<(String, HistoryMarker)> = self
            .lock()
            .iter()
            .map(|(path, marker)| (path.clone(), *marker))
            .collect();

        let result = self.write_snapshot(&snapshot).await;
        if result.is_err() {
            self.mark_dirty();
        }
        result?;
        tracing::debug!(entries = snapshot.len(), "history flushed");
        Ok(true)
    }

    async fn write_snapshot(&self, snapshot: &[(String, HistoryMarker)]) -> Result<(), HistoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM history").execute(&mut *tx).await?;
        for (path, marker) in snapshot {
            sqlx::query("INSERT INTO history (path, kind, modified) VALUES (?1, ?2, ?3)")
                .bind(path)
                .bind(marker.kind_str())
                .bind(marker.modified())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn insert(&self, path: &str, marker: HistoryMarker) {
        let previous = self.lock().insert(path.to_string(), marker);
        if previous != Some(marker) {
            self.mark_dirty();
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, HistoryMarker>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
