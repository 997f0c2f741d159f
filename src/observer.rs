//! Engine event observers.
//!
//! Observers see every mutating operation before and after it runs. They are
//! best effort: a slow or misbehaving observer can delay an operation but
//! cannot change its outcome, and observers must not call back into the
//! engine.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::{KeyValue, SyncDiff, TreeId};

/// Callbacks around the engine's mutating operations. All methods default to
/// no-ops; implement only the events of interest.
#[allow(unused_variables)]
pub trait HashTreesObserver: Send + Sync {
    fn pre_h_put(&self, key: &[u8], value: &[u8]) {}
    fn post_h_put(&self, key: &[u8], value: &[u8]) {}
    fn pre_h_remove(&self, key: &[u8]) {}
    fn post_h_remove(&self, key: &[u8]) {}
    fn pre_rebuild(&self, tree_id: TreeId, full_rebuild: bool) {}
    fn post_rebuild(&self, tree_id: TreeId, full_rebuild: bool) {}
    fn pre_s_put(&self, pairs: &[KeyValue]) {}
    fn post_s_put(&self, pairs: &[KeyValue]) {}
    fn pre_s_remove(&self, keys: &[Vec<u8>]) {}
    fn post_s_remove(&self, keys: &[Vec<u8>]) {}
    fn pre_sync(&self, tree_id: TreeId) {}
    fn post_sync(&self, tree_id: TreeId, result: &SyncDiff) {}
}

/// Fans one event out to every registered observer, in registration order,
/// over a snapshot taken at notification time.
#[derive(Default)]
pub(crate) struct ObserverNotifier {
    observers: RwLock<Vec<Arc<dyn HashTreesObserver>>>,
}

impl ObserverNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, observer: Arc<dyn HashTreesObserver>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn remove(&self, observer: &Arc<dyn HashTreesObserver>) {
        self.observers
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    fn snapshot(&self) -> Vec<Arc<dyn HashTreesObserver>> {
        self.observers.read().clone()
    }

    pub(crate) fn pre_h_put(&self, key: &[u8], value: &[u8]) {
        for obs in self.snapshot() {
            obs.pre_h_put(key, value);
        }
    }

    pub(crate) fn post_h_put(&self, key: &[u8], value: &[u8]) {
        for obs in self.snapshot() {
            obs.post_h_put(key, value);
        }
    }

    pub(crate) fn pre_h_remove(&self, key: &[u8]) {
        for obs in self.snapshot() {
            obs.pre_h_remove(key);
        }
    }

    pub(crate) fn post_h_remove(&self, key: &[u8]) {
        for obs in self.snapshot() {
            obs.post_h_remove(key);
        }
    }

    pub(crate) fn pre_rebuild(&self, tree_id: TreeId, full_rebuild: bool) {
        for obs in self.snapshot() {
            obs.pre_rebuild(tree_id, full_rebuild);
        }
    }

    pub(crate) fn post_rebuild(&self, tree_id: TreeId, full_rebuild: bool) {
        for obs in self.snapshot() {
            obs.post_rebuild(tree_id, full_rebuild);
        }
    }

    pub(crate) fn pre_s_put(&self, pairs: &[KeyValue]) {
        for obs in self.snapshot() {
            obs.pre_s_put(pairs);
        }
    }

    pub(crate) fn post_s_put(&self, pairs: &[KeyValue]) {
        for obs in self.snapshot() {
            obs.post_s_put(pairs);
        }
    }

    pub(crate) fn pre_s_remove(&self, keys: &[Vec<u8>]) {
        for obs in self.snapshot() {
            obs.pre_s_remove(keys);
        }
    }

    pub(crate) fn post_s_remove(&self, keys: &[Vec<u8>]) {
        for obs in self.snapshot() {
            obs.post_s_remove(keys);
        }
    }

    pub(crate) fn pre_sync(&self, tree_id: TreeId) {
        for obs in self.snapshot() {
            obs.pre_sync(tree_id);
        }
    }

    pub(crate) fn post_sync(&self, tree_id: TreeId, result: &SyncDiff) {
        for obs in self.snapshot() {
            obs.post_sync(tree_id, result);
        }
    }
}
