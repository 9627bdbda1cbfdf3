//! Deduplicating, rate-limited work queue.
//!
//! Semantics:
//! - A key waiting in the queue is held at most once; adding it again is a no-op.
//! - A key handed out by [`WorkQueue::get`] is not handed out again until the
//!   holder calls [`WorkQueue::done`]. If it was re-added in the meantime it is
//!   queued on `done`.
//! - [`WorkQueue::add_rate_limited`] re-adds a key after an exponential delay
//!   driven by a per-key requeue counter; [`WorkQueue::forget`] resets it.
//! - [`WorkQueue::shut_down`] discards pending keys and makes every `get`
//!   return `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::backoff::BackoffPolicy;

/// Trait bound for queue keys.
pub trait QueueKey: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static> QueueKey for T {}

/// Shared handle to a work queue. Cloning is cheap.
pub struct WorkQueue<K: QueueKey> {
    inner: Arc<Inner<K>>,
}

impl<K: QueueKey> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

struct QueueState<K> {
    /// Keys ready to be handed out, in insertion order.
    queue: VecDeque<K>,

    /// Keys that need processing (queued, or re-added while in flight).
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    /// Rate-limited requeue count per key.
    requeues: HashMap<K, u32>,

    shutting_down: bool,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a new named queue.
    pub fn new(name: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    requeues: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Queue name, for logging.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a key.
    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // Queued again on `done`.
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add a key after `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            let queue = self.clone();
            tokio::spawn(async move { queue.add(key).await });
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Re-add a key with exponential backoff and bump its requeue counter.
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                return;
            }
            let count = state.requeues.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*count);
            *count += 1;
            delay
        };

        debug!(queue = %self.inner.name, key = ?key, delay_ms = delay.as_millis() as u64, "Requeue with backoff");
        self.add_after(key, delay);
    }

    /// Number of rate-limited requeues recorded for a key.
    pub async fn num_requeues(&self, key: &K) -> u32 {
        let state = self.inner.state.lock().await;
        state.requeues.get(key).copied().unwrap_or(0)
    }

    /// Clear the requeue counter for a key.
    pub async fn forget(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.requeues.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register interest before checking so a concurrent add or
            // shutdown cannot slip between the check and the wait.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key as finished. Requeues it if it was added while held.
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Returns true if no keys are waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop handing out keys and discard everything pending.
    pub async fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        debug!(queue = %self.inner.name, "Work queue shut down");
        self.inner.notify.notify_waiters();
    }
}
