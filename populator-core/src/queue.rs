use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Rate-limited deduplicating FIFO of reconcile keys.
///
/// `add` collapses keys already waiting in the queue, so a burst of events
/// for one claim costs a single pass. A single worker draining the queue
/// gives per-key serialization.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<String>,
    queued: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    pub fn add(&self, key: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown || inner.queued.contains(key) {
                return;
            }
            inner.queued.insert(key.to_owned());
            inner.items.push_back(key.to_owned());
        }
        self.notify.notify_one();
    }

    /// Re-adds `key` after its per-key exponential backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            let failures = inner.failures.entry(key.to_owned()).or_insert(0);
            let delay = backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Clears the backoff history for `key` after a clean pass.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    /// Next key to process. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.items.pop_front() {
                    inner.queued.remove(&key);
                    return Some(key);
                }
                if inner.shutdown {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(failures: u32) -> Duration {
    let shift = failures.min(20);
    (BASE_DELAY * (1u32 << shift)).min(MAX_DELAY)
}
