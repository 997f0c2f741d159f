//! Storage contracts consumed by the engine.
//!
//! Two stores are involved. The *user store* ([`KvStore`]) holds the
//! application's actual key/value data and is owned by the application; the
//! engine only reads it (full-rebuild scans, value fetches during sync) and
//! writes it on behalf of a syncing peer. The *digest store*
//! ([`DigestStore`]) is owned by the engine and holds everything derived:
//! per-key digests grouped by segment, per-node tree hashes, and the dirty
//! bookkeeping.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::model::{NodeId, SegId, SegmentData, SegmentHash, TreeId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A key/value pair yielded by user-store iteration.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Read/write surface of the application's key/value store.
///
/// The iterator has no ordering requirement; it only has to enumerate the
/// tree's full key set once.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    async fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()>;

    async fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Enumerate every key/value pair belonging to `tree_id`.
    fn iter(&self, tree_id: TreeId) -> BoxStream<'static, StoreResult<KvPair>>;
}

/// Persistent, ordered storage for digests, tree-node hashes, and dirty
/// bookkeeping.
///
/// Writes are single-key atomic. `get_segment` and
/// `clear_and_get_dirty_segments` present a point-in-time view against
/// concurrent writers.
#[async_trait]
pub trait DigestStore: Send + Sync {
    async fn put_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: Vec<u8>,
        digest: Vec<u8>,
    ) -> StoreResult<()>;

    async fn delete_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: &[u8],
    ) -> StoreResult<()>;

    /// Exact lookup of one key's datum within its segment.
    async fn get_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: &[u8],
    ) -> StoreResult<Option<SegmentData>>;

    /// The whole segment, ordered by key ascending.
    async fn get_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<Vec<SegmentData>>;

    /// Lazy ordered iteration over the segment data of a contiguous segment
    /// range (both bounds inclusive). Restartable only by calling again.
    fn segment_data_stream(
        &self,
        tree_id: TreeId,
        seg_from: SegId,
        seg_to: SegId,
    ) -> BoxStream<'static, StoreResult<SegmentData>>;

    async fn put_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
        hash: Vec<u8>,
    ) -> StoreResult<()>;

    async fn get_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
    ) -> StoreResult<Option<SegmentHash>>;

    /// Hashes for the requested nodes that currently have one, in node-id
    /// ascending order.
    async fn get_segment_hashes(
        &self,
        tree_id: TreeId,
        node_ids: &[NodeId],
    ) -> StoreResult<Vec<SegmentHash>>;

    async fn set_dirty_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<()>;

    /// Test-and-clear one dirty bit; returns the prior value.
    async fn clear_dirty_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<bool>;

    /// Segments with unreflected writes, including any currently marked for
    /// rebuild (see [`mark_segments`](Self::mark_segments)).
    async fn dirty_segments(&self, tree_id: TreeId) -> StoreResult<Vec<SegId>>;

    /// Snapshot-then-clear of the dirty bits, atomic against readers.
    async fn clear_and_get_dirty_segments(&self, tree_id: TreeId) -> StoreResult<Vec<SegId>>;

    /// Re-mark the listed segments as dirty and record that they are being
    /// rebuilt. The marks persist and keep counting as dirty until unmarked,
    /// so a failed or interrupted rebuild can never lose dirtiness.
    /// Idempotent.
    async fn mark_segments(&self, tree_id: TreeId, seg_ids: &[SegId]) -> StoreResult<()>;

    /// Drop rebuild marks after the segments' hashes have been written.
    async fn unmark_segments(&self, tree_id: TreeId, seg_ids: &[SegId]) -> StoreResult<()>;

    /// Wall clock (unix ms) of the last completed full rebuild, 0 if never.
    async fn last_full_rebuild(&self, tree_id: TreeId) -> StoreResult<i64>;

    async fn set_last_full_rebuild(&self, tree_id: TreeId, at_ms: i64) -> StoreResult<()>;
}
