/// Background container removal
///
/// Containers that could not be confirmed gone within a kill budget, and
/// stopped containers whose handle was dropped, are removed here so the
/// result path never waits on the runtime. Failed removals are retried with
/// backoff; a container still present after the last attempt raises a
/// `CleanupFailure` event and is left for the next orphan reap.
use crate::core::container::control_command;
use crate::observability::events;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

/// Handle to the remover thread. Clones share the thread; it exits once every
/// handle is dropped and the queue is empty.
#[derive(Clone)]
pub struct ContainerRemover {
    tx: Sender<String>,
    pending: Arc<AtomicUsize>,
}

impl ContainerRemover {
    pub fn spawn(binary: String, control_timeout: Duration, max_attempts: u32) -> Self {
        let (tx, rx) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);
        let max_attempts = max_attempts.max(1);

        let spawned = thread::Builder::new()
            .name("codebox-remover".to_string())
            .spawn(move || {
                remover_loop(rx, counter, &binary, control_timeout, max_attempts)
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn container remover: {}", e);
        }

        Self { tx, pending }
    }

    /// Queue `container` for forced removal
    pub fn submit(&self, container: &str) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(container.to_string()) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            events::container_removal_failed(&e.into_inner(), 0, "container remover not running");
        }
    }

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

fn remover_loop(
    rx: Receiver<String>,
    pending: Arc<AtomicUsize>,
    binary: &str,
    control_timeout: Duration,
    max_attempts: u32,
) {
    for container in rx.iter() {
        let mut last_error = String::new();
        let mut removed = false;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                thread::sleep(DEFAULT_BACKOFF * 2u32.saturating_pow(attempt - 1));
            }
            match control_command(binary, &["rm", "--force", &container], control_timeout) {
                Ok(out) if out.status.success() => {
                    removed = true;
                    break;
                }
                Ok(out) => last_error = out.stderr.trim().to_string(),
                Err(e) => last_error = e.to_string(),
            }
            // The runtime answers for containers it knows; silence means gone
            if let Ok(out) = control_command(
                binary,
                &["inspect", "--format", "{{.Id}}", &container],
                control_timeout,
            ) {
                if !out.status.success() {
                    removed = true;
                    break;
                }
            }
            debug!("Removal {} of {} failed: {}", attempt + 1, container, last_error);
        }

        if removed {
            debug!("Container {} removed", container);
        } else {
            events::container_removal_failed(&container, max_attempts, &last_error);
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}
