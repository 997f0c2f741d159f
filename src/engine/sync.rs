// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-down reconciliation between two trees.
//!
//! Both sides expose ordered segment hashes, so each level of the walk is a
//! three-way merge by node id:
//!
//! - matching ids with equal hashes close that whole subtree;
//! - matching ids with differing hashes descend, or at leaf level resolve
//!   the segment key by key;
//! - a node only the local side has means the remote is missing the whole
//!   subtree, which is streamed over in bounded batches;
//! - a node only the remote side has is an extrinsic subtree, deleted over
//!   there when updating.
//!
//! Local state is the authority throughout: the remote converges toward
//! local, never the other way around.

use std::cmp::Ordering;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, info, instrument};

use super::{HashTreeEngine, ROOT_NODE};
use crate::error::HtError;
use crate::metrics;
use crate::model::{KeyValue, NodeId, SegId, SegmentData, SegmentHash, SyncDiff, SyncMode, TreeId};
use crate::tree;

/// Largest `s_put` batch shipped while streaming a missing subtree.
const MAX_TRANSFER_BATCH: usize = 5000;

/// The surface a reconciliation partner exposes: the engine's read side
/// plus the user-store write side. Implemented by [`HashTreeEngine`] for
/// in-process peers and by [`crate::net::HttpPeer`] for remote ones.
#[async_trait]
pub trait HashTreePeer: Send + Sync {
    async fn get_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
    ) -> Result<Option<SegmentHash>, HtError> {
        Ok(self
            .get_segment_hashes(tree_id, &[node_id])
            .await?
            .into_iter()
            .next())
    }

    /// Hashes for the requested nodes that exist, node-id ascending.
    async fn get_segment_hashes(
        &self,
        tree_id: TreeId,
        node_ids: &[NodeId],
    ) -> Result<Vec<SegmentHash>, HtError>;

    /// One segment's data, key ascending.
    async fn get_segment(&self, tree_id: TreeId, seg_id: SegId)
        -> Result<Vec<SegmentData>, HtError>;

    async fn s_put(&self, pairs: Vec<KeyValue>) -> Result<(), HtError>;

    async fn s_remove(&self, keys: Vec<Vec<u8>>) -> Result<(), HtError>;

    async fn delete_tree_node(&self, tree_id: TreeId, node_id: NodeId) -> Result<(), HtError>;
}

#[async_trait]
impl HashTreePeer for HashTreeEngine {
    async fn get_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
    ) -> Result<Option<SegmentHash>, HtError> {
        HashTreeEngine::get_segment_hash(self, tree_id, node_id).await
    }

    async fn get_segment_hashes(
        &self,
        tree_id: TreeId,
        node_ids: &[NodeId],
    ) -> Result<Vec<SegmentHash>, HtError> {
        HashTreeEngine::get_segment_hashes(self, tree_id, node_ids).await
    }

    async fn get_segment(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
    ) -> Result<Vec<SegmentData>, HtError> {
        HashTreeEngine::get_segment(self, tree_id, seg_id).await
    }

    async fn s_put(&self, pairs: Vec<KeyValue>) -> Result<(), HtError> {
        HashTreeEngine::s_put(self, pairs).await
    }

    async fn s_remove(&self, keys: Vec<Vec<u8>>) -> Result<(), HtError> {
        HashTreeEngine::s_remove(self, keys).await
    }

    async fn delete_tree_node(&self, tree_id: TreeId, node_id: NodeId) -> Result<(), HtError> {
        HashTreeEngine::delete_tree_node(self, tree_id, node_id).await
    }
}

impl HashTreeEngine {
    /// Reconcile `tree_id` against `peer`, pushing local state over.
    pub async fn sync_with(
        &self,
        tree_id: TreeId,
        peer: &dyn HashTreePeer,
    ) -> Result<SyncDiff, HtError> {
        self.sync_with_mode(tree_id, peer, SyncMode::Update).await
    }

    /// Reconcile `tree_id` against `peer`. With [`SyncMode::LocalOnly`] the
    /// differences are only counted, nothing is written remotely. Returns a
    /// zero diff without any work when a rebuild or sync already holds the
    /// tree.
    #[instrument(skip(self, peer))]
    pub async fn sync_with_mode(
        &self,
        tree_id: TreeId,
        peer: &dyn HashTreePeer,
        mode: SyncMode,
    ) -> Result<SyncDiff, HtError> {
        let Some(_lock) = self.core.locks.try_acquire(tree_id) else {
            debug!(tree_id, "tree busy, skipping sync");
            return Ok(SyncDiff::default());
        };
        let began = Instant::now();
        self.core.notifier.pre_sync(tree_id);
        let do_update = mode == SyncMode::Update;

        let mut key_differences = 0u64;
        let mut extrinsic_segments = 0u64;
        let mut worklist = vec![ROOT_NODE];

        while !worklist.is_empty() {
            let local = self.get_segment_hashes(tree_id, &worklist).await?;
            let remote = peer.get_segment_hashes(tree_id, &worklist).await?;
            let mut next = Vec::new();

            let mut li = local.into_iter().peekable();
            let mut ri = remote.into_iter().peekable();
            loop {
                let order = match (li.peek(), ri.peek()) {
                    (None, None) => break,
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (Some(l), Some(r)) => l.node_id.cmp(&r.node_id),
                };
                match order {
                    Ordering::Equal => {
                        let l = li.next().expect("matched local node");
                        let r = ri.next().expect("matched remote node");
                        if l.hash != r.hash {
                            if self.core.is_leaf(l.node_id) {
                                key_differences += self
                                    .sync_segment(
                                        tree_id,
                                        self.core.seg_of_leaf(l.node_id),
                                        peer,
                                        do_update,
                                    )
                                    .await?;
                            } else {
                                next.extend(tree::children(l.node_id, tree::BRANCH_FACTOR));
                            }
                        }
                    }
                    Ordering::Less => {
                        let l = li.next().expect("local-only node");
                        key_differences += self
                            .push_missing_subtree(tree_id, l.node_id, peer, do_update)
                            .await?;
                    }
                    Ordering::Greater => {
                        let r = ri.next().expect("remote-only node");
                        if do_update {
                            peer.delete_tree_node(tree_id, r.node_id).await?;
                        }
                        extrinsic_segments += 1;
                    }
                }
            }
            worklist = next;
        }

        let diff = SyncDiff::new(key_differences, extrinsic_segments);
        self.core.notifier.post_sync(tree_id, &diff);
        metrics::record_sync(diff.key_differences, diff.extrinsic_segments, began.elapsed());
        info!(tree_id, %diff, "sync complete");
        Ok(diff)
    }

    /// Resolve one differing segment key by key. Returns how many keys had
    /// to be pushed or removed.
    async fn sync_segment(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        peer: &dyn HashTreePeer,
        do_update: bool,
    ) -> Result<u64, HtError> {
        let local = self.core.digests.get_segment(tree_id, seg_id).await?;
        let remote = peer.get_segment(tree_id, seg_id).await?;

        let mut additions: Vec<KeyValue> = Vec::new();
        let mut removals: Vec<Vec<u8>> = Vec::new();

        let mut li = local.into_iter().peekable();
        let mut ri = remote.into_iter().peekable();
        loop {
            let order = match (li.peek(), ri.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(l), Some(r)) => l.key.cmp(&r.key),
            };
            match order {
                Ordering::Equal => {
                    let l = li.next().expect("matched local key");
                    let r = ri.next().expect("matched remote key");
                    if l.digest != r.digest {
                        // Vanished between hashing and now: a concurrent
                        // delete, leave it to the next pass.
                        if let Some(value) = self.core.kv.get(&l.key).await? {
                            additions.push(KeyValue::new(l.key, value));
                        }
                    }
                }
                Ordering::Less => {
                    let l = li.next().expect("local-only key");
                    if let Some(value) = self.core.kv.get(&l.key).await? {
                        additions.push(KeyValue::new(l.key, value));
                    }
                }
                Ordering::Greater => {
                    let r = ri.next().expect("remote-only key");
                    removals.push(r.key);
                }
            }
        }

        let count = (additions.len() + removals.len()) as u64;
        if do_update {
            if !additions.is_empty() {
                peer.s_put(additions).await?;
            }
            if !removals.is_empty() {
                peer.s_remove(removals).await?;
            }
        }
        Ok(count)
    }

    /// Stream every key under a subtree the remote does not have at all,
    /// shipping values in batches of at most [`MAX_TRANSFER_BATCH`].
    async fn push_missing_subtree(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
        peer: &dyn HashTreePeer,
        do_update: bool,
    ) -> Result<u64, HtError> {
        let (seg_from, seg_to) = self.core.leaf_span(node_id);
        debug!(tree_id, node_id, seg_from, seg_to, "pushing missing subtree");

        let mut pushed = 0u64;
        let mut batch: Vec<KeyValue> = Vec::new();
        let mut data = self
            .core
            .digests
            .segment_data_stream(tree_id, seg_from, seg_to);
        while let Some(entry) = data.next().await {
            let entry = entry?;
            if let Some(value) = self.core.kv.get(&entry.key).await? {
                batch.push(KeyValue::new(entry.key, value));
            }
            if batch.len() >= MAX_TRANSFER_BATCH {
                pushed += batch.len() as u64;
                if do_update {
                    peer.s_put(std::mem::take(&mut batch)).await?;
                } else {
                    batch.clear();
                }
            }
        }
        if !batch.is_empty() {
            pushed += batch.len() as u64;
            if do_update {
                peer.s_put(batch).await?;
            }
        }
        Ok(pushed)
    }
}
