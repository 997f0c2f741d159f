// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rebuilding tree hashes from dirty segments.
//!
//! A rebuild consumes the dirty-segment snapshot, rehashes each dirty leaf
//! from its segment data, then propagates new hashes level by level to the
//! root. A *full* rebuild first reconciles the digest store against the user
//! store, repairing any drift between the two (the engine gives no
//! atomicity guarantee across them).
//!
//! Failure safety: the snapshot is re-marked in the store before any leaf
//! hash is written, and the marks are dropped only after success. Whatever
//! goes wrong in between, the touched segments keep reporting dirty and the
//! next rebuild picks them up again.

use std::collections::BTreeSet;
use std::time::Instant;

use futures_util::StreamExt;
use tracing::{debug, info, instrument};

use super::{now_ms, HashTreeEngine, ROOT_NODE};
use crate::error::HtError;
use crate::hashing;
use crate::metrics;
use crate::model::{NodeId, SegId, TreeId};
use crate::tree;
use crate::updater::TreeOp;

impl HashTreeEngine {
    /// Rebuild, choosing full or dirty-only from the persisted timestamp of
    /// the last full rebuild: full when there never was one, or when
    /// `full_rebuild_period_ms` is non-negative and that much time has
    /// passed since.
    pub async fn rebuild_tree_by_period(
        &self,
        tree_id: TreeId,
        full_rebuild_period_ms: i64,
    ) -> Result<usize, HtError> {
        let last = self.core.digests.last_full_rebuild(tree_id).await?;
        let full_rebuild = last == 0
            || (full_rebuild_period_ms >= 0 && now_ms() - last > full_rebuild_period_ms);
        self.rebuild_tree(tree_id, full_rebuild).await
    }

    /// Rebuild the hashes of `tree_id`. Returns the number of dirty
    /// segments processed, or 0 without doing anything when a rebuild or
    /// sync already holds the tree.
    #[instrument(skip(self), fields(processed))]
    pub async fn rebuild_tree(&self, tree_id: TreeId, full_rebuild: bool) -> Result<usize, HtError> {
        let Some(_lock) = self.core.locks.try_acquire(tree_id) else {
            debug!(tree_id, "tree busy, skipping rebuild");
            return Ok(0);
        };
        let began = Instant::now();
        let began_ms = now_ms();
        self.core.notifier.pre_rebuild(tree_id, full_rebuild);

        let mut snapshot: Option<Vec<SegId>> = None;
        match self
            .rebuild_locked(tree_id, full_rebuild, began_ms, &mut snapshot)
            .await
        {
            Ok(processed) => {
                self.core.notifier.post_rebuild(tree_id, full_rebuild);
                metrics::record_rebuild(full_rebuild, processed, began.elapsed());
                tracing::Span::current().record("processed", processed);
                info!(tree_id, full_rebuild, processed, "rebuild complete");
                Ok(processed)
            }
            Err(error) => {
                // Whatever was snapshotted must stay dirty for the next run.
                if let Some(seg_ids) = snapshot {
                    let _ = self.core.digests.mark_segments(tree_id, &seg_ids).await;
                }
                Err(error)
            }
        }
    }

    async fn rebuild_locked(
        &self,
        tree_id: TreeId,
        full_rebuild: bool,
        began_ms: i64,
        snapshot: &mut Option<Vec<SegId>>,
    ) -> Result<usize, HtError> {
        if full_rebuild {
            self.reconcile_with_user_store(tree_id).await?;
        }

        let dirty = self.core.digests.dirty_segments(tree_id).await?;
        *snapshot = Some(dirty.clone());
        self.core.digests.mark_segments(tree_id, &dirty).await?;

        let leaves = self.rebuild_leaves(tree_id, &dirty).await?;
        self.rebuild_internal_nodes(tree_id, leaves).await?;

        self.core.digests.unmark_segments(tree_id, &dirty).await?;
        if full_rebuild {
            self.core
                .digests
                .set_last_full_rebuild(tree_id, began_ms)
                .await?;
        }
        Ok(dirty.len())
    }

    /// Repair drift between the user store and the digest store: feed every
    /// user-store pair back in, then drop digests whose key no longer
    /// exists. Both directions go through the conditional ops so concurrent
    /// application writes win over this scan.
    async fn reconcile_with_user_store(&self, tree_id: TreeId) -> Result<(), HtError> {
        let mut entries = self.core.kv.iter(tree_id);
        while let Some(pair) = entries.next().await {
            let (key, value) = pair?;
            self.issue(TreeOp::PutIfAbsent { key, value }).await?;
        }
        drop(entries);

        let mut data = self
            .core
            .digests
            .segment_data_stream(tree_id, 0, self.core.segments - 1);
        while let Some(entry) = data.next().await {
            let entry = entry?;
            if !self.core.kv.contains(&entry.key).await? {
                self.issue(TreeOp::RemoveIfAbsent { key: entry.key }).await?;
            }
        }
        Ok(())
    }

    /// Rehash the dirty leaves. A segment whose bit was already cleared by
    /// someone else is skipped; returns the leaf node ids actually written.
    async fn rebuild_leaves(
        &self,
        tree_id: TreeId,
        dirty: &[SegId],
    ) -> Result<Vec<NodeId>, HtError> {
        let mut leaves = Vec::with_capacity(dirty.len());
        for &seg_id in dirty {
            if self.core.digests.clear_dirty_segment(tree_id, seg_id).await? {
                let block = self.core.digests.get_segment(tree_id, seg_id).await?;
                let digest = hashing::digest_segment_block(&block);
                let node_id = self.core.leaf_id(seg_id);
                self.core
                    .digests
                    .put_segment_hash(tree_id, node_id, digest)
                    .await?;
                leaves.push(node_id);
            }
        }
        Ok(leaves)
    }

    /// Propagate hashes upward level by level until the root is written.
    async fn rebuild_internal_nodes(
        &self,
        tree_id: TreeId,
        leaves: Vec<NodeId>,
    ) -> Result<(), HtError> {
        let mut frontier: BTreeSet<NodeId> = leaves.into_iter().collect();
        while !frontier.is_empty() {
            let parents: BTreeSet<NodeId> = frontier
                .iter()
                .map(|&node| tree::parent(node, tree::BRANCH_FACTOR))
                .collect();
            for &parent in &parents {
                self.rebuild_parent(tree_id, parent).await?;
            }
            if parents.contains(&ROOT_NODE) {
                break;
            }
            frontier = parents;
        }
        Ok(())
    }

    /// Rehash one internal node from the child hashes that currently exist,
    /// in child-id order. Absent children contribute nothing.
    async fn rebuild_parent(&self, tree_id: TreeId, parent: NodeId) -> Result<(), HtError> {
        let mut child_hashes = Vec::with_capacity(tree::BRANCH_FACTOR as usize);
        for child in tree::children(parent, tree::BRANCH_FACTOR) {
            if let Some(hash) = self.core.digests.get_segment_hash(tree_id, child).await? {
                child_hashes.push(hash.hash);
            }
        }
        let digest = hashing::digest_hashes(&child_hashes);
        self.core
            .digests
            .put_segment_hash(tree_id, parent, digest)
            .await?;
        Ok(())
    }
}
