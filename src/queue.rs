//! Work queue of resource keys.
//!
//! A key is handed to at most one worker at a time. Keys added while they
//! are being processed are parked and re-queued once the worker calls
//! [`WorkQueue::done`], so a burst of events for one key collapses into a
//! single follow-up pass.
//!
//! Delayed adds are held by one timer task per queue. A key waits there at
//! most once, at the earliest deadline requested for it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

use crate::config::Backoff;

struct State<K> {
    queue: VecDeque<K>,
    /// Keys waiting in `queue` or parked behind a worker.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
    /// Requests for the timer task; taken on shutdown, which stops it.
    delays: Mutex<Option<mpsc::UnboundedSender<(K, Instant)>>>,
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutdown || !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }
}

async fn run_timer<K: Clone + Eq + Hash>(
    inner: Weak<Inner<K>>,
    mut requests: mpsc::UnboundedReceiver<(K, Instant)>,
) {
    let mut delays = DelayQueue::new();
    let mut scheduled: HashMap<K, (delay_queue::Key, Instant)> = HashMap::new();
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some((key, deadline)) = request else {
                    return;
                };
                match scheduled.get_mut(&key) {
                    Some((_, at)) if *at <= deadline => {}
                    Some((slot, at)) => {
                        delays.reset_at(slot, deadline);
                        *at = deadline;
                    }
                    None => {
                        let slot = delays.insert_at(key.clone(), deadline);
                        scheduled.insert(key, (slot, deadline));
                    }
                }
            }
            Some(expired) = delays.next() => {
                let key = expired.into_inner();
                scheduled.remove(&key);
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.add(key);
            }
        }
    }
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> WorkQueue<K> {
    /// Must be called within a tokio runtime; the timer task is spawned here.
    pub fn new(backoff: Backoff) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            backoff,
            delays: Mutex::new(Some(tx)),
        });
        tokio::spawn(run_timer(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn add(&self, key: K) {
        self.inner.add(key);
    }

    /// Adds `key` once `delay` has passed.
    ///
    /// A key already waiting keeps the earlier of its two deadlines.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if let Some(delays) = self.inner.delays.lock().as_ref() {
            let _ = delays.send((key, Instant::now() + delay));
        }
    }

    /// Adds `key` after a delay that grows with each consecutive failure.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            self.inner.backoff.delay(*failures)
        };
        self.add_after(key, delay);
        delay
    }

    /// Resets the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Waits for the next key, or returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutdown {
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

    /// Marks `key` as no longer being processed, re-queueing it if it was
    /// added in the meantime.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every waiting worker and drops delayed keys; later calls to
    /// [`next`](Self::next) return `None`.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.delays.lock().take();
        self.inner.notify.notify_waiters();
    }
}
