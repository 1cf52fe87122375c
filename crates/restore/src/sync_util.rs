//! Small concurrency primitives shared by the restore context and
//! pipeline stages: a compare-and-set "first error wins" latch, a
//! striped counter for the many-writer/one-reader WAL-entry count, and a
//! multi-waiter completion signal for the attempt's "stop future".
//!
//! Grounded in the same discipline `engine::background::BackgroundScheduler`
//! uses for its queue/drain condvar pair — lock briefly, mutate, notify.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Compare-and-set error slot: only the first error set is retained.
pub struct ErrorLatch<E> {
    slot: Mutex<Option<Arc<E>>>,
}

impl<E> ErrorLatch<E> {
    /// An empty latch.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Set the error if none has been set yet. Returns `true` if this
    /// call won the race and installed `err`.
    pub fn set_if_absent(&self, err: E) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::new(err));
        true
    }

    /// True iff an error has been latched.
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The latched error, if any.
    pub fn get(&self) -> Option<Arc<E>> {
        self.slot.lock().clone()
    }
}

impl<E> Default for ErrorLatch<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-width striped counter: many concurrent writers add to their
/// own shard (picked round-robin per call to avoid a thread-local), a
/// single reader sums all shards for a metrics snapshot.
pub struct StripedCounter {
    shards: Vec<AtomicU64>,
    next_shard: AtomicUsize,
}

impl StripedCounter {
    /// Create a counter with `width` shards.
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            shards: (0..width).map(|_| AtomicU64::new(0)).collect(),
            next_shard: AtomicUsize::new(0),
        }
    }

    /// Add `n` to one shard.
    pub fn add(&self, n: u64) {
        let idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[idx].fetch_add(n, Ordering::Relaxed);
    }

    /// Sum of all shards at the time of the call.
    pub fn sum(&self) -> u64 {
        self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }
}

/// A completion signal with a cached result: once set, all current and
/// future waiters observe it immediately; `wait()` may be called any
/// number of times (idempotent), including after completion.
pub struct Completion<T: Clone> {
    result: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Completion<T> {
    /// A not-yet-completed signal.
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Complete the signal, waking all current waiters. A second call
    /// is a no-op (first completion wins, like the error latch).
    pub fn complete(&self, value: T) {
        let mut slot = self.result.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_waiters();
    }

    /// True if already completed.
    pub fn is_complete(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Wait for completion, returning the completed value. Safe to call
    /// concurrently and after completion.
    pub async fn wait(&self) -> T {
        loop {
            if let Some(v) = self.result.lock().clone() {
                return v;
            }
            let notified = self.notify.notified();
            // Re-check after registering interest, to close the race
            // where `complete` ran between our first check and here.
            if let Some(v) = self.result.lock().clone() {
                return v;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_latch_keeps_first_error() {
        let latch: ErrorLatch<&'static str> = ErrorLatch::new();
        assert!(latch.set_if_absent("first"));
        assert!(!latch.set_if_absent("second"));
        assert_eq!(*latch.get().unwrap(), "first");
    }

    #[test]
    fn striped_counter_sums_across_shards() {
        let counter = StripedCounter::new(4);
        for _ in 0..10 {
            counter.add(1);
        }
        assert_eq!(counter.sum(), 10);
    }

    #[tokio::test]
    async fn completion_wakes_waiters() {
        let completion: Arc<Completion<u32>> = Arc::new(Completion::new());
        let waiter = {
            let completion = Arc::clone(&completion);
            tokio::spawn(async move { completion.wait().await })
        };
        tokio::task::yield_now().await;
        completion.complete(42);
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn completion_wait_after_complete_returns_immediately() {
        let completion: Completion<u32> = Completion::new();
        completion.complete(7);
        assert_eq!(completion.wait().await, 7);
    }

    #[tokio::test]
    async fn completion_second_complete_is_ignored() {
        let completion: Completion<u32> = Completion::new();
        completion.complete(1);
        completion.complete(2);
        assert_eq!(completion.wait().await, 1);
    }
}
