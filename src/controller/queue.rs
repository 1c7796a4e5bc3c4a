//! Deduplicating work queue of object keys.
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! already queued is a no-op; adding one that is being processed marks it
//! dirty, and it is queued again when the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use super::backoff::Backoff;
use crate::resources::Kind;

/// Identifies one object to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ObjectKey {
    pub kind: Kind,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shut_down: bool,
}

#[derive(Debug)]
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Queues `key` unless it is already queued.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queues `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queues `key` after a backoff that grows with each consecutive failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let attempt = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            *failures
        };
        let delay = self.backoff.delay(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a wakeup between the check and the
            // await is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as processed, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wakes every waiting worker; all later `get` calls return `None`.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
        )))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(Kind::Claim, name)
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_coalesced() {
        let queue = queue();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_requeued_on_done() {
        let queue = queue();
        queue.add(key("a"));
        let got = queue.get().await.unwrap();

        // Not handed out twice while in flight
        queue.add(key("a"));
        assert_eq!(queue.len(), 0);

        queue.done(&got);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add(key("a"));
        let got = queue.get().await.unwrap();
        queue.done(&got);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiters() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("a"));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_waiting_worker_receives_added_key() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(key("late"));
        assert_eq!(waiter.await.unwrap(), Some(key("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_delivery() {
        let queue = queue();
        queue.add_after(key("a"), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_delay_grows_until_forgotten() {
        let queue = queue();
        let first = queue.add_rate_limited(key("a"));
        let _ = queue.add_rate_limited(key("a"));
        let third = queue.add_rate_limited(key("a"));
        assert!(first <= Duration::from_millis(10));
        assert!(third >= Duration::from_millis(20));

        queue.forget(&key("a"));
        let reset = queue.add_rate_limited(key("a"));
        assert!(reset <= Duration::from_millis(10));
    }
}
