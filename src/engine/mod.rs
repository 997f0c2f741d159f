// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The hash-tree engine.
//!
//! [`HashTreeEngine`] maintains, next to the application's key/value store,
//! a digest structure that partitions each tree's key space into segments
//! and summarizes the segments with a binary hash tree. Writes only touch
//! the affected segment and a dirty bit; a periodic
//! [`rebuild_tree`](HashTreeEngine::rebuild_tree) folds dirty segments back
//! into the tree, and [`sync_with`](HashTreeEngine::sync_with) walks two
//! trees top-down to repair a peer with the minimal set of key transfers.
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Started -> Stopped
//! ```
//!
//! With non-blocking calls enabled (the default), `start()` spawns the
//! background update worker and only a Started engine accepts writes;
//! reads work in any state.

mod rebuild;
mod sync;

pub use sync::HashTreePeer;

use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info};

use crate::config::HashTreesConfig;
use crate::error::HtError;
use crate::hashing;
use crate::locks::{LockProvider, TreeLockProvider};
use crate::metrics;
use crate::model::{KeyValue, NodeId, SegId, SegmentData, SegmentHash, TreeId};
use crate::observer::{HashTreesObserver, ObserverNotifier};
use crate::providers::{ModuloSegmentIdProvider, SegmentIdProvider, TreeIdProvider};
use crate::store::{DigestStore, KvStore, MemDigestStore};
use crate::tree;
use crate::updater::{NonBlockingUpdater, TreeOp};

pub(crate) const ROOT_NODE: NodeId = 0;

/// Engine lifecycle state, broadcast to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background worker not yet running.
    Created,
    /// Accepting writes; worker running when non-blocking is enabled.
    Started,
    /// Worker drained and exited.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Started => write!(f, "Started"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Everything the engine and its background worker share.
pub(crate) struct EngineCore {
    pub(crate) segments: u32,
    pub(crate) height: u32,
    pub(crate) internal_nodes: u32,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) digests: Arc<dyn DigestStore>,
    pub(crate) tree_ids: Arc<dyn TreeIdProvider>,
    pub(crate) seg_ids: Arc<dyn SegmentIdProvider>,
    pub(crate) locks: Arc<dyn LockProvider>,
    pub(crate) notifier: ObserverNotifier,
}

impl EngineCore {
    /// Record one key's digest and dirty its segment. The dirty bit is
    /// written first; a crash between the two steps must not leave an
    /// unreported datum change.
    pub(crate) async fn apply_put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), HtError> {
        self.notifier.pre_h_put(&key, &value);
        let tree_id = self.tree_ids.tree_id(&key);
        let seg_id = self.seg_ids.segment_id(&key);
        let digest = hashing::sha1_bytes(&value);
        self.digests.set_dirty_segment(tree_id, seg_id).await?;
        self.digests
            .put_segment_data(tree_id, seg_id, key.clone(), digest)
            .await?;
        metrics::record_update("put");
        self.notifier.post_h_put(&key, &value);
        Ok(())
    }

    pub(crate) async fn apply_remove(&self, key: Vec<u8>) -> Result<(), HtError> {
        self.notifier.pre_h_remove(&key);
        let tree_id = self.tree_ids.tree_id(&key);
        let seg_id = self.seg_ids.segment_id(&key);
        self.digests.set_dirty_segment(tree_id, seg_id).await?;
        self.digests
            .delete_segment_data(tree_id, seg_id, &key)
            .await?;
        metrics::record_update("remove");
        self.notifier.post_h_remove(&key);
        Ok(())
    }

    pub(crate) fn leaf_id(&self, seg_id: SegId) -> NodeId {
        self.internal_nodes + seg_id
    }

    pub(crate) fn seg_of_leaf(&self, leaf_id: NodeId) -> SegId {
        leaf_id - self.internal_nodes
    }

    pub(crate) fn is_leaf(&self, node_id: NodeId) -> bool {
        node_id >= self.internal_nodes
    }

    /// Inclusive segment range covered by the subtree under `node_id`.
    pub(crate) fn leaf_span(&self, node_id: NodeId) -> (SegId, SegId) {
        let first = tree::leftmost_leaf(node_id, tree::BRANCH_FACTOR, self.height);
        let last = tree::rightmost_leaf(node_id, tree::BRANCH_FACTOR, self.height);
        (self.seg_of_leaf(first), self.seg_of_leaf(last))
    }
}

/// Builds a [`HashTreeEngine`]. The user store and tree-id provider are
/// required; everything else has a default.
pub struct Builder {
    kv: Arc<dyn KvStore>,
    tree_ids: Arc<dyn TreeIdProvider>,
    digests: Option<Arc<dyn DigestStore>>,
    seg_ids: Option<Arc<dyn SegmentIdProvider>>,
    locks: Option<Arc<dyn LockProvider>>,
    segments: u32,
    non_blocking: bool,
    queue_size: usize,
}

impl Builder {
    fn new(kv: Arc<dyn KvStore>, tree_ids: Arc<dyn TreeIdProvider>) -> Self {
        let defaults = HashTreesConfig::default();
        Self {
            kv,
            tree_ids,
            digests: None,
            seg_ids: None,
            locks: None,
            segments: defaults.segments,
            non_blocking: defaults.non_blocking,
            queue_size: defaults.queue_size,
        }
    }

    /// Apply the tunables from a [`HashTreesConfig`].
    #[must_use]
    pub fn config(mut self, config: &HashTreesConfig) -> Self {
        self.segments = config.segments;
        self.non_blocking = config.non_blocking;
        self.queue_size = config.queue_size;
        self
    }

    /// Digest store to use. Defaults to an in-memory store; pass a
    /// [`crate::store::SledDigestStore`] for persistence.
    #[must_use]
    pub fn digest_store(mut self, digests: Arc<dyn DigestStore>) -> Self {
        self.digests = Some(digests);
        self
    }

    /// Segment mapping. Defaults to modulo of a stable key hash.
    #[must_use]
    pub fn segment_id_provider(mut self, seg_ids: Arc<dyn SegmentIdProvider>) -> Self {
        self.seg_ids = Some(seg_ids);
        self
    }

    /// Lock provider guarding rebuild and sync. Defaults to one try-lock
    /// mutex per tree.
    #[must_use]
    pub fn lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Segment count per tree; rounded up to a power of two and clamped.
    #[must_use]
    pub fn segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    /// Enable or disable the background update queue.
    #[must_use]
    pub fn non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// Capacity of the background queue.
    #[must_use]
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn build(self) -> Result<HashTreeEngine, HtError> {
        if self.non_blocking && self.queue_size == 0 {
            return Err(HtError::Config(
                "queue_size must be at least 1 when non-blocking calls are enabled".into(),
            ));
        }
        let segments = tree::valid_segment_count(self.segments);
        let height = tree::height(segments, tree::BRANCH_FACTOR);
        let internal_nodes = tree::internal_node_count(height, tree::BRANCH_FACTOR);
        let core = EngineCore {
            segments,
            height,
            internal_nodes,
            kv: self.kv,
            digests: self
                .digests
                .unwrap_or_else(|| Arc::new(MemDigestStore::new())),
            tree_ids: self.tree_ids,
            seg_ids: self
                .seg_ids
                .unwrap_or_else(|| Arc::new(ModuloSegmentIdProvider::new(segments))),
            locks: self.locks.unwrap_or_else(|| Arc::new(TreeLockProvider::new())),
            notifier: ObserverNotifier::new(),
        };
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Ok(HashTreeEngine {
            core: Arc::new(core),
            non_blocking: self.non_blocking,
            queue_size: self.queue_size,
            state_tx,
            state_rx,
            updater: RwLock::new(None),
            shutdown: Mutex::new(None),
        })
    }
}

/// See the [module docs](self).
pub struct HashTreeEngine {
    core: Arc<EngineCore>,
    non_blocking: bool,
    queue_size: usize,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    updater: RwLock<Option<NonBlockingUpdater>>,
    shutdown: Mutex<Option<oneshot::Receiver<()>>>,
}

impl HashTreeEngine {
    /// Start building an engine over the given user store.
    pub fn builder(kv: Arc<dyn KvStore>, tree_ids: Arc<dyn TreeIdProvider>) -> Builder {
        Builder::new(kv, tree_ids)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == EngineState::Started
    }

    /// Segment count per tree after power-of-two coercion.
    #[must_use]
    pub fn segment_count(&self) -> u32 {
        self.core.segments
    }

    /// Start accepting writes. Spawns the background worker when
    /// non-blocking calls are enabled. Idempotent.
    pub async fn start(&self) {
        if self.non_blocking {
            let spawned = {
                let mut slot = self.updater.write();
                if slot.is_none() {
                    let (updater, done_rx) =
                        NonBlockingUpdater::spawn(self.core.clone(), self.queue_size);
                    *slot = Some(updater);
                    Some(done_rx)
                } else {
                    None
                }
            };
            if let Some(done_rx) = spawned {
                *self.shutdown.lock().await = Some(done_rx);
                info!(queue_size = self.queue_size, "non-blocking calls enabled");
            }
        }
        let _ = self.state_tx.send(EngineState::Started);
    }

    /// Stop accepting deferred writes, drain the queue, and wait for the
    /// worker to exit. In-flight items complete normally.
    pub async fn stop(&self) {
        let updater = self.updater.write().take();
        if let Some(updater) = updater {
            updater.send_stop().await;
            if let Some(done_rx) = self.shutdown.lock().await.take() {
                let _ = done_rx.await;
            }
            info!("non-blocking calls disabled");
        }
        let _ = self.state_tx.send(EngineState::Stopped);
    }

    /// Report that `key` now maps to `value` in the user store.
    ///
    /// Computes the value digest, stores it under the key's segment, and
    /// dirties the segment. With non-blocking calls enabled this only
    /// enqueues and returns; the worker does the rest.
    pub async fn h_put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), HtError> {
        self.issue(TreeOp::Put { key, value }).await
    }

    /// Report that `key` was deleted from the user store.
    pub async fn h_remove(&self, key: Vec<u8>) -> Result<(), HtError> {
        self.issue(TreeOp::Remove { key }).await
    }

    pub(crate) async fn issue(&self, op: TreeOp) -> Result<(), HtError> {
        if self.non_blocking {
            let updater = self.updater.read().clone();
            match updater {
                Some(updater) => updater.enqueue(op).await,
                None => Err(HtError::Stopped),
            }
        } else {
            match op {
                TreeOp::Put { key, value } | TreeOp::PutIfAbsent { key, value } => {
                    self.core.apply_put(key, value).await
                }
                TreeOp::Remove { key } | TreeOp::RemoveIfAbsent { key } => {
                    self.core.apply_remove(key).await
                }
                TreeOp::Stop => Ok(()),
            }
        }
    }

    // --- Passthrough reads over current persisted state ---

    pub async fn get_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
    ) -> Result<Option<SegmentHash>, HtError> {
        Ok(self.core.digests.get_segment_hash(tree_id, node_id).await?)
    }

    pub async fn get_segment_hashes(
        &self,
        tree_id: TreeId,
        node_ids: &[NodeId],
    ) -> Result<Vec<SegmentHash>, HtError> {
        Ok(self
            .core
            .digests
            .get_segment_hashes(tree_id, node_ids)
            .await?)
    }

    pub async fn get_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: &[u8],
    ) -> Result<Option<SegmentData>, HtError> {
        Ok(self
            .core
            .digests
            .get_segment_data(tree_id, seg_id, key)
            .await?)
    }

    pub async fn get_segment(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
    ) -> Result<Vec<SegmentData>, HtError> {
        Ok(self.core.digests.get_segment(tree_id, seg_id).await?)
    }

    // --- Peer-driven user-store mutations ---

    /// Apply a batch of key/value pairs to the user store on behalf of a
    /// syncing peer.
    pub async fn s_put(&self, pairs: Vec<KeyValue>) -> Result<(), HtError> {
        self.core.notifier.pre_s_put(&pairs);
        for pair in &pairs {
            self.core.kv.put(pair.key.clone(), pair.value.clone()).await?;
        }
        self.core.notifier.post_s_put(&pairs);
        Ok(())
    }

    /// Delete a batch of keys from the user store on behalf of a syncing
    /// peer.
    pub async fn s_remove(&self, keys: Vec<Vec<u8>>) -> Result<(), HtError> {
        self.core.notifier.pre_s_remove(&keys);
        for key in &keys {
            self.core.kv.delete(key).await?;
        }
        self.core.notifier.post_s_remove(&keys);
        Ok(())
    }

    /// Delete from the user store every key whose segment falls under
    /// `node_id`. Driven by a peer that found this whole subtree absent on
    /// its side.
    pub async fn delete_tree_node(&self, tree_id: TreeId, node_id: NodeId) -> Result<(), HtError> {
        let (seg_from, seg_to) = self.core.leaf_span(node_id);
        debug!(tree_id, node_id, seg_from, seg_to, "deleting subtree keys");
        let mut data = self
            .core
            .digests
            .segment_data_stream(tree_id, seg_from, seg_to);
        while let Some(entry) = data.next().await {
            let entry = entry?;
            self.core.kv.delete(&entry.key).await?;
        }
        Ok(())
    }

    // --- Observers ---

    pub fn add_observer(&self, observer: Arc<dyn HashTreesObserver>) {
        self.core.notifier.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn HashTreesObserver>) {
        self.core.notifier.remove(observer);
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
