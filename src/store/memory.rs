//! In-memory reference implementations of both store contracts.
//!
//! [`MemDigestStore`] is the default digest store and the one the test suite
//! leans on; [`MemKvStore`] stands in for the application's key/value store
//! when embedding or testing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream};
use parking_lot::RwLock;

use super::traits::{DigestStore, KvPair, KvStore, StoreResult};
use crate::model::{NodeId, SegId, SegmentData, SegmentHash, TreeId};
use crate::providers::TreeIdProvider;

/// In-memory user store.
///
/// Holds one flat keyspace. Without a [`TreeIdProvider`] the store behaves
/// as hosting a single tree and `iter` enumerates every pair regardless of
/// the requested id; with one, iteration filters to the requested tree.
#[derive(Default)]
pub struct MemKvStore {
    data: DashMap<Vec<u8>, Vec<u8>>,
    tree_ids: Option<Arc<dyn TreeIdProvider>>,
}

impl MemKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose iteration filters keys through `tree_ids`.
    #[must_use]
    pub fn with_tree_ids(tree_ids: Arc<dyn TreeIdProvider>) -> Self {
        Self {
            data: DashMap::new(),
            tree_ids: Some(tree_ids),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Ordered copy of the current contents; handy for equality checks.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.data.contains_key(key))
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()> {
        self.data.insert(key, value);
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.data.remove(key);
        Ok(())
    }

    fn iter(&self, tree_id: TreeId) -> BoxStream<'static, StoreResult<KvPair>> {
        let pairs: Vec<KvPair> = self
            .data
            .iter()
            .filter(|entry| match &self.tree_ids {
                Some(provider) => provider.tree_id(entry.key()) == tree_id,
                None => true,
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Box::pin(stream::iter(pairs.into_iter().map(Ok)))
    }
}

#[derive(Default)]
struct TreeState {
    /// seg id -> (key -> digest), both levels ordered.
    segments: BTreeMap<SegId, BTreeMap<Vec<u8>, Vec<u8>>>,
    node_hashes: BTreeMap<NodeId, Vec<u8>>,
    dirty: BTreeSet<SegId>,
    marked: BTreeSet<SegId>,
    last_full_rebuild: i64,
}

/// In-memory digest store. The default when no persistent store is supplied.
#[derive(Default)]
pub struct MemDigestStore {
    trees: RwLock<HashMap<TreeId, TreeState>>,
}

impl MemDigestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DigestStore for MemDigestStore {
    async fn put_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: Vec<u8>,
        digest: Vec<u8>,
    ) -> StoreResult<()> {
        let mut trees = self.trees.write();
        trees
            .entry(tree_id)
            .or_default()
            .segments
            .entry(seg_id)
            .or_default()
            .insert(key, digest);
        Ok(())
    }

    async fn delete_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: &[u8],
    ) -> StoreResult<()> {
        let mut trees = self.trees.write();
        if let Some(tree) = trees.get_mut(&tree_id) {
            if let Some(segment) = tree.segments.get_mut(&seg_id) {
                segment.remove(key);
            }
        }
        Ok(())
    }

    async fn get_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: &[u8],
    ) -> StoreResult<Option<SegmentData>> {
        let trees = self.trees.read();
        Ok(trees
            .get(&tree_id)
            .and_then(|tree| tree.segments.get(&seg_id))
            .and_then(|segment| segment.get(key))
            .map(|digest| SegmentData::new(key.to_vec(), digest.clone())))
    }

    async fn get_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<Vec<SegmentData>> {
        let trees = self.trees.read();
        Ok(trees
            .get(&tree_id)
            .and_then(|tree| tree.segments.get(&seg_id))
            .map(|segment| {
                segment
                    .iter()
                    .map(|(key, digest)| SegmentData::new(key.clone(), digest.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn segment_data_stream(
        &self,
        tree_id: TreeId,
        seg_from: SegId,
        seg_to: SegId,
    ) -> BoxStream<'static, StoreResult<SegmentData>> {
        let trees = self.trees.read();
        let data: Vec<SegmentData> = trees
            .get(&tree_id)
            .map(|tree| {
                tree.segments
                    .range(seg_from..=seg_to)
                    .flat_map(|(_, segment)| {
                        segment
                            .iter()
                            .map(|(key, digest)| SegmentData::new(key.clone(), digest.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(stream::iter(data.into_iter().map(Ok)))
    }

    async fn put_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
        hash: Vec<u8>,
    ) -> StoreResult<()> {
        let mut trees = self.trees.write();
        trees
            .entry(tree_id)
            .or_default()
            .node_hashes
            .insert(node_id, hash);
        Ok(())
    }

    async fn get_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
    ) -> StoreResult<Option<SegmentHash>> {
        let trees = self.trees.read();
        Ok(trees
            .get(&tree_id)
            .and_then(|tree| tree.node_hashes.get(&node_id))
            .map(|hash| SegmentHash::new(node_id, hash.clone())))
    }

    async fn get_segment_hashes(
        &self,
        tree_id: TreeId,
        node_ids: &[NodeId],
    ) -> StoreResult<Vec<SegmentHash>> {
        let wanted: BTreeSet<NodeId> = node_ids.iter().copied().collect();
        let trees = self.trees.read();
        Ok(trees
            .get(&tree_id)
            .map(|tree| {
                wanted
                    .iter()
                    .filter_map(|node_id| {
                        tree.node_hashes
                            .get(node_id)
                            .map(|hash| SegmentHash::new(*node_id, hash.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_dirty_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<()> {
        let mut trees = self.trees.write();
        trees.entry(tree_id).or_default().dirty.insert(seg_id);
        Ok(())
    }

    async fn clear_dirty_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<bool> {
        let mut trees = self.trees.write();
        Ok(trees
            .get_mut(&tree_id)
            .map(|tree| tree.dirty.remove(&seg_id))
            .unwrap_or(false))
    }

    async fn dirty_segments(&self, tree_id: TreeId) -> StoreResult<Vec<SegId>> {
        let trees = self.trees.read();
        Ok(trees
            .get(&tree_id)
            .map(|tree| tree.dirty.union(&tree.marked).copied().collect())
            .unwrap_or_default())
    }

    async fn clear_and_get_dirty_segments(&self, tree_id: TreeId) -> StoreResult<Vec<SegId>> {
        let mut trees = self.trees.write();
        Ok(trees
            .get_mut(&tree_id)
            .map(|tree| {
                let cleared = std::mem::take(&mut tree.dirty);
                cleared.union(&tree.marked).copied().collect()
            })
            .unwrap_or_default())
    }

    async fn mark_segments(&self, tree_id: TreeId, seg_ids: &[SegId]) -> StoreResult<()> {
        let mut trees = self.trees.write();
        let tree = trees.entry(tree_id).or_default();
        tree.dirty.extend(seg_ids);
        tree.marked.extend(seg_ids);
        Ok(())
    }

    async fn unmark_segments(&self, tree_id: TreeId, seg_ids: &[SegId]) -> StoreResult<()> {
        let mut trees = self.trees.write();
        if let Some(tree) = trees.get_mut(&tree_id) {
            for seg_id in seg_ids {
                tree.marked.remove(seg_id);
            }
        }
        Ok(())
    }

    async fn last_full_rebuild(&self, tree_id: TreeId) -> StoreResult<i64> {
        let trees = self.trees.read();
        Ok(trees
            .get(&tree_id)
            .map(|tree| tree.last_full_rebuild)
            .unwrap_or(0))
    }

    async fn set_last_full_rebuild(&self, tree_id: TreeId, at_ms: i64) -> StoreResult<()> {
        let mut trees = self.trees.write();
        trees.entry(tree_id).or_default().last_full_rebuild = at_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn segment_data_round_trip() {
        let store = MemDigestStore::new();
        store
            .put_segment_data(1, 2, b"key".to_vec(), b"digest".to_vec())
            .await
            .unwrap();

        let data = store.get_segment_data(1, 2, b"key").await.unwrap().unwrap();
        assert_eq!(data.key, b"key");
        assert_eq!(data.digest, b"digest");

        store.delete_segment_data(1, 2, b"key").await.unwrap();
        assert!(store.get_segment_data(1, 2, b"key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn segment_is_key_ordered() {
        let store = MemDigestStore::new();
        for key in [b"c".to_vec(), b"a".to_vec(), b"b".to_vec()] {
            store
                .put_segment_data(1, 0, key.clone(), key)
                .await
                .unwrap();
        }
        let segment = store.get_segment(1, 0).await.unwrap();
        let keys: Vec<_> = segment.iter().map(|sd| sd.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn stream_covers_requested_segment_range() {
        let store = MemDigestStore::new();
        for seg in 0u32..4 {
            store
                .put_segment_data(1, seg, vec![seg as u8], vec![seg as u8])
                .await
                .unwrap();
        }
        let collected: Vec<_> = store
            .segment_data_stream(1, 1, 2)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].key, vec![1]);
        assert_eq!(collected[1].key, vec![2]);
    }

    #[tokio::test]
    async fn dirty_bits_test_and_clear() {
        let store = MemDigestStore::new();
        store.set_dirty_segment(1, 5).await.unwrap();
        store.set_dirty_segment(1, 5).await.unwrap();

        assert!(store.clear_dirty_segment(1, 5).await.unwrap());
        assert!(!store.clear_dirty_segment(1, 5).await.unwrap());
    }

    #[tokio::test]
    async fn marked_segments_stay_dirty_until_unmarked() {
        let store = MemDigestStore::new();
        store.set_dirty_segment(1, 3).await.unwrap();
        store.mark_segments(1, &[3]).await.unwrap();

        assert!(store.clear_dirty_segment(1, 3).await.unwrap());
        // The bit is cleared but the mark keeps the segment reported dirty.
        assert_eq!(store.dirty_segments(1).await.unwrap(), vec![3]);

        store.unmark_segments(1, &[3]).await.unwrap();
        assert!(store.dirty_segments(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn marking_reasserts_the_dirty_bit() {
        let store = MemDigestStore::new();
        store.set_dirty_segment(1, 6).await.unwrap();
        assert!(store.clear_dirty_segment(1, 6).await.unwrap());

        // Re-marking makes the bit clearable again, as a recovering rebuild
        // needs it to be.
        store.mark_segments(1, &[6]).await.unwrap();
        assert!(store.clear_dirty_segment(1, 6).await.unwrap());
    }

    #[tokio::test]
    async fn clear_and_get_returns_snapshot() {
        let store = MemDigestStore::new();
        store.set_dirty_segment(1, 1).await.unwrap();
        store.set_dirty_segment(1, 9).await.unwrap();

        let snapshot = store.clear_and_get_dirty_segments(1).await.unwrap();
        assert_eq!(snapshot, vec![1, 9]);
        assert!(store.dirty_segments(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batched_hashes_are_ascending_and_present_only() {
        let store = MemDigestStore::new();
        store.put_segment_hash(1, 4, vec![4]).await.unwrap();
        store.put_segment_hash(1, 2, vec![2]).await.unwrap();

        let hashes = store.get_segment_hashes(1, &[4, 2, 7]).await.unwrap();
        let ids: Vec<_> = hashes.iter().map(|h| h.node_id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[tokio::test]
    async fn rebuild_timestamp_defaults_to_zero() {
        let store = MemDigestStore::new();
        assert_eq!(store.last_full_rebuild(42).await.unwrap(), 0);
        store.set_last_full_rebuild(42, 1234).await.unwrap();
        assert_eq!(store.last_full_rebuild(42).await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn kv_store_round_trip() {
        let store = MemKvStore::new();
        store.put(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        assert!(store.contains(b"k").await.unwrap());
        assert_eq!(store.get(b"k").await.unwrap().unwrap(), b"v");

        store.delete(b"k").await.unwrap();
        assert!(!store.contains(b"k").await.unwrap());
    }

    #[tokio::test]
    async fn kv_iteration_enumerates_everything() {
        let store = MemKvStore::new();
        for i in 0u8..10 {
            store.put(vec![i], vec![i]).await.unwrap();
        }
        let pairs: Vec<_> = store.iter(1).map(|r| r.unwrap()).collect().await;
        assert_eq!(pairs.len(), 10);
    }
}
