use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::queue::WorkQueue;

/// Kind tag of an observed-object key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjKind {
    Claim,
    Volume,
    Pod,
    StorageClass,
    Source,
}

impl fmt::Display for ObjKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ObjKind::Claim => "claim",
            ObjKind::Volume => "volume",
            ObjKind::Pod => "pod",
            ObjKind::StorageClass => "sc",
            ObjKind::Source => "source",
        };
        f.write_str(tag)
    }
}

/// Composes the `type/[namespace/]name` key for an observed object.
pub fn obj_key(kind: ObjKind, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{kind}/{ns}/{name}"),
        _ => format!("{kind}/{name}"),
    }
}

#[derive(Default)]
struct Maps {
    /// objKey -> reconcile keys to wake when it changes.
    notify: HashMap<String, HashSet<String>>,
    /// reconcileKey -> objKeys to forget when it terminates.
    cleanup: HashMap<String, HashSet<String>>,
}

/// Bidirectional index between observed-object keys and the reconcile keys
/// waiting on them.
///
/// `subscribe` is additive and idempotent; `wake` enqueues every waiter on
/// the workqueue; `forget` drops all of a reconcile key's subscriptions at
/// terminal success. Both maps stay consistent: a `(obj, rk)` notify entry
/// always has its `(rk, obj)` cleanup inverse. No operation performs I/O.
pub struct NotificationFabric {
    maps: Mutex<Maps>,
    queue: Arc<WorkQueue>,
}

impl NotificationFabric {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            queue,
        }
    }

    /// Records that `reconcile_key` must be enqueued whenever `obj_key`
    /// changes. Duplicate subscriptions collapse.
    pub fn subscribe(&self, reconcile_key: &str, obj_key: &str) {
        let mut maps = self.maps.lock().unwrap();
        maps.notify
            .entry(obj_key.to_owned())
            .or_default()
            .insert(reconcile_key.to_owned());
        maps.cleanup
            .entry(reconcile_key.to_owned())
            .or_default()
            .insert(obj_key.to_owned());
    }

    /// Enqueues every reconcile key waiting on `obj_key`.
    pub fn wake(&self, obj_key: &str) {
        let waiters: Vec<String> = {
            let maps = self.maps.lock().unwrap();
            maps.notify
                .get(obj_key)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        for key in waiters {
            self.queue.add(&key);
        }
    }

    /// Removes every subscription `reconcile_key` placed, pruning entries
    /// left without waiters.
    pub fn forget(&self, reconcile_key: &str) {
        let mut maps = self.maps.lock().unwrap();
        let Some(watched) = maps.cleanup.remove(reconcile_key) else {
            return;
        };
        for obj_key in watched {
            if let Some(waiters) = maps.notify.get_mut(&obj_key) {
                waiters.remove(reconcile_key);
                if waiters.is_empty() {
                    maps.notify.remove(&obj_key);
                }
            }
        }
    }

    /// Observed-object keys with at least one waiter, sorted.
    pub fn watched_keys(&self) -> Vec<String> {
        let maps = self.maps.lock().unwrap();
        let mut keys: Vec<String> = maps.notify.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        let maps = self.maps.lock().unwrap();
        maps.notify.is_empty() && maps.cleanup.is_empty()
    }
}
