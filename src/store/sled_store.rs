// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistent digest store backed by sled.
//!
//! Everything lives in one sled tree under disjoint key prefixes, encoded so
//! that lexicographic order equals logical order and range scans by
//! `(tree_id, seg_id)` come out sorted:
//!
//! ```text
//! segment-data: 0x01 | tree_id (8B BE) | seg_id (4B BE) | key  -> digest (20B)
//! segment-hash: 0x02 | tree_id (8B BE) | node_id (4B BE)       -> hash (20B)
//! dirty:        0x03 | tree_id (8B BE) | seg_id (4B BE)        -> 0x01
//! meta:         0x04 | tree_id (8B BE) | scope (1B)            -> value
//! marked:       0x05 | tree_id (8B BE) | seg_id (4B BE)        -> 0x01
//! ```
//!
//! sled iterators have a start bound but the requested end is a logical
//! `(tree_id, seg_id)` pair, so range scans decode each key and stop as soon
//! as the prefix passes the end.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use super::traits::{DigestStore, StoreError, StoreResult};
use crate::model::{NodeId, SegId, SegmentData, SegmentHash, TreeId};

const SEGMENT_DATA: u8 = 0x01;
const SEGMENT_HASH: u8 = 0x02;
const DIRTY_SEGMENT: u8 = 0x03;
const META: u8 = 0x04;
const MARKED_SEGMENT: u8 = 0x05;

const META_LAST_FULL_REBUILD: u8 = 0x01;

const PRESENT: &[u8] = &[0x01];

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

fn tree_seg_prefix(kind: u8, tree_id: TreeId, seg_id: SegId) -> Vec<u8> {
    let mut key = Vec::with_capacity(13);
    key.push(kind);
    key.extend_from_slice(&tree_id.to_be_bytes());
    key.extend_from_slice(&seg_id.to_be_bytes());
    key
}

fn tree_prefix(kind: u8, tree_id: TreeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(kind);
    key.extend_from_slice(&tree_id.to_be_bytes());
    key
}

fn segment_data_key(tree_id: TreeId, seg_id: SegId, key: &[u8]) -> Vec<u8> {
    let mut encoded = tree_seg_prefix(SEGMENT_DATA, tree_id, seg_id);
    encoded.extend_from_slice(key);
    encoded
}

fn node_hash_key(tree_id: TreeId, node_id: NodeId) -> Vec<u8> {
    tree_seg_prefix(SEGMENT_HASH, tree_id, node_id)
}

fn meta_key(tree_id: TreeId, scope: u8) -> Vec<u8> {
    let mut key = tree_prefix(META, tree_id);
    key.push(scope);
    key
}

/// Split a segment-data key back into `(seg_id, user key)`. The caller has
/// already matched the kind byte and tree id.
fn decode_segment_data_key(raw: &[u8]) -> StoreResult<(SegId, Vec<u8>)> {
    if raw.len() < 13 {
        return Err(StoreError::Decode(format!(
            "segment data key too short: {} bytes",
            raw.len()
        )));
    }
    let seg_id = SegId::from_be_bytes(raw[9..13].try_into().expect("4 byte slice"));
    Ok((seg_id, raw[13..].to_vec()))
}

/// Trailing 4 bytes of a dirty/marked key.
fn decode_seg_id(raw: &[u8]) -> StoreResult<SegId> {
    if raw.len() != 13 {
        return Err(StoreError::Decode(format!(
            "segment key has {} bytes, expected 13",
            raw.len()
        )));
    }
    Ok(SegId::from_be_bytes(raw[9..13].try_into().expect("4 byte slice")))
}

/// Digest store persisted in a sled tree.
pub struct SledDigestStore {
    // Kept so the store owns the database lifetime when opened from a path.
    _db: Option<sled::Db>,
    tree: sled::Tree,
}

impl SledDigestStore {
    /// Open (or create) a digest store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree("hashtree-digests")?;
        Ok(Self {
            _db: Some(db),
            tree,
        })
    }

    /// Use an already-open database, for embedders that share one.
    pub fn from_db(db: &sled::Db) -> StoreResult<Self> {
        let tree = db.open_tree("hashtree-digests")?;
        Ok(Self { _db: None, tree })
    }

    /// Flush dirty pages to disk.
    pub async fn flush(&self) -> StoreResult<()> {
        self.tree.flush_async().await?;
        Ok(())
    }

    fn collect_seg_ids(&self, kind: u8, tree_id: TreeId) -> StoreResult<BTreeSet<SegId>> {
        let mut seg_ids = BTreeSet::new();
        for entry in self.tree.scan_prefix(tree_prefix(kind, tree_id)) {
            let (key, _) = entry?;
            seg_ids.insert(decode_seg_id(&key)?);
        }
        Ok(seg_ids)
    }
}

#[async_trait]
impl DigestStore for SledDigestStore {
    async fn put_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: Vec<u8>,
        digest: Vec<u8>,
    ) -> StoreResult<()> {
        self.tree
            .insert(segment_data_key(tree_id, seg_id, &key), digest)?;
        Ok(())
    }

    async fn delete_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: &[u8],
    ) -> StoreResult<()> {
        self.tree.remove(segment_data_key(tree_id, seg_id, key))?;
        Ok(())
    }

    async fn get_segment_data(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
        key: &[u8],
    ) -> StoreResult<Option<SegmentData>> {
        Ok(self
            .tree
            .get(segment_data_key(tree_id, seg_id, key))?
            .map(|digest| SegmentData::new(key.to_vec(), digest.to_vec())))
    }

    async fn get_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<Vec<SegmentData>> {
        let mut block = Vec::new();
        for entry in self
            .tree
            .scan_prefix(tree_seg_prefix(SEGMENT_DATA, tree_id, seg_id))
        {
            let (raw_key, digest) = entry?;
            let (_, key) = decode_segment_data_key(&raw_key)?;
            block.push(SegmentData::new(key, digest.to_vec()));
        }
        Ok(block)
    }

    fn segment_data_stream(
        &self,
        tree_id: TreeId,
        seg_from: SegId,
        seg_to: SegId,
    ) -> BoxStream<'static, StoreResult<SegmentData>> {
        let start = tree_seg_prefix(SEGMENT_DATA, tree_id, seg_from);
        let bound = tree_prefix(SEGMENT_DATA, tree_id);
        let iter = self.tree.range(start..).map(move |entry| {
            let (raw_key, digest) = entry?;
            if !raw_key.starts_with(&bound) {
                return Ok(None);
            }
            let (seg_id, key) = decode_segment_data_key(&raw_key)?;
            if seg_id > seg_to {
                return Ok(None);
            }
            Ok(Some(SegmentData::new(key, digest.to_vec())))
        });
        Box::pin(
            stream::iter(iter)
                .take_while(|item: &StoreResult<Option<SegmentData>>| {
                    let keep = !matches!(item, Ok(None));
                    async move { keep }
                })
                .filter_map(|item| async move {
                    match item {
                        Ok(Some(data)) => Some(Ok(data)),
                        Ok(None) => None,
                        Err(err) => Some(Err(err)),
                    }
                }),
        )
    }

    async fn put_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
        hash: Vec<u8>,
    ) -> StoreResult<()> {
        self.tree.insert(node_hash_key(tree_id, node_id), hash)?;
        Ok(())
    }

    async fn get_segment_hash(
        &self,
        tree_id: TreeId,
        node_id: NodeId,
    ) -> StoreResult<Option<SegmentHash>> {
        Ok(self
            .tree
            .get(node_hash_key(tree_id, node_id))?
            .map(|hash| SegmentHash::new(node_id, hash.to_vec())))
    }

    async fn get_segment_hashes(
        &self,
        tree_id: TreeId,
        node_ids: &[NodeId],
    ) -> StoreResult<Vec<SegmentHash>> {
        let wanted: BTreeSet<NodeId> = node_ids.iter().copied().collect();
        let mut hashes = Vec::with_capacity(wanted.len());
        for node_id in wanted {
            if let Some(hash) = self.tree.get(node_hash_key(tree_id, node_id))? {
                hashes.push(SegmentHash::new(node_id, hash.to_vec()));
            }
        }
        Ok(hashes)
    }

    async fn set_dirty_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<()> {
        self.tree
            .insert(tree_seg_prefix(DIRTY_SEGMENT, tree_id, seg_id), PRESENT)?;
        Ok(())
    }

    async fn clear_dirty_segment(&self, tree_id: TreeId, seg_id: SegId) -> StoreResult<bool> {
        Ok(self
            .tree
            .remove(tree_seg_prefix(DIRTY_SEGMENT, tree_id, seg_id))?
            .is_some())
    }

    async fn dirty_segments(&self, tree_id: TreeId) -> StoreResult<Vec<SegId>> {
        let mut seg_ids = self.collect_seg_ids(DIRTY_SEGMENT, tree_id)?;
        seg_ids.extend(self.collect_seg_ids(MARKED_SEGMENT, tree_id)?);
        Ok(seg_ids.into_iter().collect())
    }

    async fn clear_and_get_dirty_segments(&self, tree_id: TreeId) -> StoreResult<Vec<SegId>> {
        let mut seg_ids = self.collect_seg_ids(DIRTY_SEGMENT, tree_id)?;
        for seg_id in &seg_ids {
            self.tree
                .remove(tree_seg_prefix(DIRTY_SEGMENT, tree_id, *seg_id))?;
        }
        seg_ids.extend(self.collect_seg_ids(MARKED_SEGMENT, tree_id)?);
        Ok(seg_ids.into_iter().collect())
    }

    async fn mark_segments(&self, tree_id: TreeId, seg_ids: &[SegId]) -> StoreResult<()> {
        for seg_id in seg_ids {
            self.tree
                .insert(tree_seg_prefix(DIRTY_SEGMENT, tree_id, *seg_id), PRESENT)?;
            self.tree
                .insert(tree_seg_prefix(MARKED_SEGMENT, tree_id, *seg_id), PRESENT)?;
        }
        Ok(())
    }

    async fn unmark_segments(&self, tree_id: TreeId, seg_ids: &[SegId]) -> StoreResult<()> {
        for seg_id in seg_ids {
            self.tree
                .remove(tree_seg_prefix(MARKED_SEGMENT, tree_id, *seg_id))?;
        }
        Ok(())
    }

    async fn last_full_rebuild(&self, tree_id: TreeId) -> StoreResult<i64> {
        match self.tree.get(meta_key(tree_id, META_LAST_FULL_REBUILD))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_ref().try_into().map_err(|_| {
                    StoreError::Decode(format!("timestamp has {} bytes, expected 8", raw.len()))
                })?;
                Ok(i64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    async fn set_last_full_rebuild(&self, tree_id: TreeId, at_ms: i64) -> StoreResult<()> {
        self.tree.insert(
            meta_key(tree_id, META_LAST_FULL_REBUILD),
            &at_ms.to_be_bytes()[..],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> SledDigestStore {
        SledDigestStore::open(dir.path().join("digests")).unwrap()
    }

    #[tokio::test]
    async fn segment_data_round_trip_and_order() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        for key in [b"b".to_vec(), b"a".to_vec(), b"c".to_vec()] {
            store
                .put_segment_data(1, 7, key.clone(), key)
                .await
                .unwrap();
        }
        let segment = store.get_segment(1, 7).await.unwrap();
        let keys: Vec<_> = segment.into_iter().map(|sd| sd.key).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        store.delete_segment_data(1, 7, b"b").await.unwrap();
        assert!(store.get_segment_data(1, 7, b"b").await.unwrap().is_none());
        assert!(store.get_segment_data(1, 7, b"a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stream_stops_at_requested_segment_end() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        for seg in 0u32..5 {
            store
                .put_segment_data(1, seg, vec![seg as u8], vec![0xAA])
                .await
                .unwrap();
        }
        // Neighboring tree must never leak into the scan.
        store
            .put_segment_data(2, 0, b"other".to_vec(), vec![0xBB])
            .await
            .unwrap();

        let collected: Vec<_> = store
            .segment_data_stream(1, 1, 3)
            .map(|r| r.unwrap())
            .collect()
            .await;
        let keys: Vec<_> = collected.into_iter().map(|sd| sd.key).collect();
        assert_eq!(keys, vec![vec![1], vec![2], vec![3]]);

        let whole_tree: Vec<_> = store.segment_data_stream(1, 0, 4).collect().await;
        assert_eq!(whole_tree.len(), 5);
    }

    #[tokio::test]
    async fn dirty_and_marked_bits() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.set_dirty_segment(9, 1).await.unwrap();
        store.set_dirty_segment(9, 2).await.unwrap();
        store.mark_segments(9, &[2, 3]).await.unwrap();

        assert_eq!(store.dirty_segments(9).await.unwrap(), vec![1, 2, 3]);

        assert!(store.clear_dirty_segment(9, 1).await.unwrap());
        assert!(!store.clear_dirty_segment(9, 1).await.unwrap());

        // 2 and 3 stay reported: marking re-asserted their bits and the
        // marks themselves persist until unmarked.
        assert_eq!(store.dirty_segments(9).await.unwrap(), vec![2, 3]);

        assert!(store.clear_dirty_segment(9, 2).await.unwrap());
        assert!(store.clear_dirty_segment(9, 3).await.unwrap());
        store.unmark_segments(9, &[2, 3]).await.unwrap();
        assert!(store.dirty_segments(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_and_get_clears_bits_not_marks() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.set_dirty_segment(1, 4).await.unwrap();
        store.mark_segments(1, &[8]).await.unwrap();

        let snapshot = store.clear_and_get_dirty_segments(1).await.unwrap();
        assert_eq!(snapshot, vec![4, 8]);
        // 8 keeps reporting dirty through its mark.
        assert_eq!(store.dirty_segments(1).await.unwrap(), vec![8]);
    }

    #[tokio::test]
    async fn node_hashes_batched_ascending() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.put_segment_hash(1, 6, vec![6]).await.unwrap();
        store.put_segment_hash(1, 0, vec![0]).await.unwrap();

        let hashes = store.get_segment_hashes(1, &[6, 0, 3]).await.unwrap();
        let ids: Vec<_> = hashes.iter().map(|h| h.node_id).collect();
        assert_eq!(ids, vec![0, 6]);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir);
            store
                .put_segment_data(3, 1, b"key".to_vec(), b"digest".to_vec())
                .await
                .unwrap();
            store.set_dirty_segment(3, 1).await.unwrap();
            store.set_last_full_rebuild(3, 77).await.unwrap();
            store.flush().await.unwrap();
        }
        let store = open_store(&dir);
        assert!(store.get_segment_data(3, 1, b"key").await.unwrap().is_some());
        assert_eq!(store.dirty_segments(3).await.unwrap(), vec![1]);
        assert_eq!(store.last_full_rebuild(3).await.unwrap(), 77);
    }
}
