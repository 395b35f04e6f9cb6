/// Background cleanup of workspaces that could not be removed inline
///
/// A failed workspace release never blocks the result path. The path is handed
/// to the reaper thread, which retries with exponential backoff and raises a
/// `CleanupFailure` security event once it gives up.
use crate::observability::events;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Remove a directory tree; a tree that is already gone counts as removed
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
struct PendingRemoval {
    request_id: String,
    path: PathBuf,
}

/// Handle to the reaper thread. Clones share the same thread; it exits once
/// every handle is dropped and the queue is empty.
#[derive(Clone)]
pub struct CleanupReaper {
    tx: Sender<PendingRemoval>,
    pending: Arc<AtomicUsize>,
}

impl CleanupReaper {
    pub fn spawn(max_attempts: u32) -> Self {
        Self::spawn_with_backoff(max_attempts, DEFAULT_BACKOFF)
    }

    pub fn spawn_with_backoff(max_attempts: u32, backoff: Duration) -> Self {
        let (tx, rx) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);
        let max_attempts = max_attempts.max(1);

        let spawned = thread::Builder::new()
            .name("codebox-reaper".to_string())
            .spawn(move || reaper_loop(rx, counter, max_attempts, backoff));
        if let Err(e) = spawned {
            // Without a thread, submitted paths are logged and left for reclaim_orphans
            warn!("Failed to spawn cleanup reaper: {}", e);
        }

        Self { tx, pending }
    }

    /// Queue a path for retried removal
    pub fn submit(&self, request_id: &str, path: PathBuf) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let item = PendingRemoval {
            request_id: request_id.to_string(),
            path,
        };
        if let Err(e) = self.tx.send(item) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let item = e.into_inner();
            events::cleanup_failure(&item.path, 0, "cleanup reaper not running");
        }
    }

    /// Removals queued or in progress
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Block until the queue drains or `timeout` elapses
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.pending() > 0 {
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

fn reaper_loop(
    rx: Receiver<PendingRemoval>,
    pending: Arc<AtomicUsize>,
    max_attempts: u32,
    backoff: Duration,
) {
    for item in rx.iter() {
        let mut last_error = String::new();
        let mut removed = false;

        for attempt in 0..max_attempts {
            thread::sleep(backoff * 2u32.saturating_pow(attempt));
            match remove_tree(&item.path) {
                Ok(()) => {
                    removed = true;
                    break;
                }
                Err(e) => {
                    debug!(
                        "Retry {} for {} failed: {}",
                        attempt + 1,
                        item.path.display(),
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        if removed {
            info!(
                "Reaper removed workspace {} for request {}",
                item.path.display(),
                item.request_id
            );
        } else {
            events::cleanup_failure(&item.path, max_attempts, &last_error);
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}
