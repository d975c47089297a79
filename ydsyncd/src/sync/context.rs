use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// State shared between the event handler, executor callbacks and the
/// reconciler. Everything here is written from worker tasks.
#[derive(Debug, Default)]
pub struct SyncContext {
    error: AtomicBool,
    downloads: Mutex<HashSet<String>>,
    full_sync_running: AtomicBool,
    full_sync_again: AtomicBool,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Clears the sticky error flag, returning whether it was set.
    pub fn take_error(&self) -> bool {
        self.error.swap(false, Ordering::SeqCst)
    }

    pub fn begin_download(&self, path: &str) {
        self.lock_downloads().insert(path.to_string());
    }

    pub fn finish_download(&self, path: &str) {
        self.lock_downloads().remove(path);
    }

    pub fn is_downloading(&self, path: &str) -> bool {
        self.lock_downloads().contains(path)
    }

    /// Claims the single reconciliation slot. A claim that loses the race
    /// records a follow-up request instead.
    pub fn try_begin_full_sync(&self) -> bool {
        if self
            .full_sync_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            true
        } else {
            self.full_sync_again.store(true, Ordering::SeqCst);
            false
        }
    }

    /// Releases the slot; returns true if another pass was requested meanwhile.
    pub fn end_full_sync(&self) -> bool {
        self.full_sync_running.store(false, Ordering::SeqCst);
        self.full_sync_again.swap(false, Ordering::SeqCst)
    }

    pub fn full_sync_running(&self) -> bool {
        self.full_sync_running.load(Ordering::SeqCst)
    }

    fn lock_downloads(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A poisoned set is still a valid set of paths.
        self.downloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
