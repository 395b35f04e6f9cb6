/// Fixed-size admission control
///
/// Slots are tokens in a bounded channel. Acquiring blocks until a token is
/// free; dropping the permit returns it.
use crate::core::types::CancelToken;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

#[derive(Clone)]
pub struct WorkerPool {
    size: usize,
    take: Receiver<()>,
    give: Sender<()>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (give, take) = bounded(size);
        for _ in 0..size {
            // Cannot fail: capacity equals the number of tokens
            let _ = give.send(());
        }
        Self {
            size,
            take,
            give,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Block until a slot is free
    pub fn acquire(&self) -> PoolPermit {
        // The pool holds a sender, so the channel never disconnects
        let _ = self.take.recv();
        self.admit()
    }

    /// Block until a slot is free or `cancel` fires; `None` when cancelled
    pub fn acquire_until_cancelled(&self, cancel: &CancelToken) -> Option<PoolPermit> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.take.recv_timeout(CANCEL_POLL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        if cancel.is_cancelled() {
            // Hand the slot straight back
            let _ = self.give.send(());
            return None;
        }
        Some(self.admit())
    }

    fn admit(&self) -> PoolPermit {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.high_water.fetch_max(now, Ordering::SeqCst);
        PoolPermit {
            give: self.give.clone(),
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Largest number of concurrent executions seen
    pub fn high_water(&self) -> usize {
        self.counters.high_water.load(Ordering::SeqCst)
    }
}

/// One occupied slot; released on drop
pub struct PoolPermit {
    give: Sender<()>,
    counters: Arc<Counters>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = self.give.send(());
    }
}
