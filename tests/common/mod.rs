//! Shared fixtures for the end-to-end tests.
//!
//! The application in these tests is simulated by [`TrackedKv`], a user
//! store that reports every write to its engine the way an embedding
//! application is expected to: `put` is followed by `h_put`, `delete` by
//! `h_remove`. Engines run with blocking calls so assertions can run right
//! after a write.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rand::RngCore;

use hashtree_sync::store::{KvPair, StoreError, StoreResult};
use hashtree_sync::{
    HashTreeEngine, KvStore, MemDigestStore, MemKvStore, SingleTreeIdProvider, TreeId,
};

/// User store that mirrors its writes into an engine.
pub struct TrackedKv {
    inner: MemKvStore,
    engine: OnceLock<Arc<HashTreeEngine>>,
}

impl TrackedKv {
    pub fn new() -> Self {
        Self {
            inner: MemKvStore::new(),
            engine: OnceLock::new(),
        }
    }

    /// Wire the engine whose tree this store feeds. Must be called before
    /// the first write.
    pub fn attach(&self, engine: Arc<HashTreeEngine>) {
        self.engine
            .set(engine)
            .unwrap_or_else(|_| panic!("engine already attached"));
    }

    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.inner.snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn engine_err(err: hashtree_sync::HtError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl KvStore for TrackedKv {
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        self.inner.contains(key).await
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StoreResult<()> {
        self.inner.put(key.clone(), value.clone()).await?;
        if let Some(engine) = self.engine.get() {
            engine.h_put(key, value).await.map_err(engine_err)?;
        }
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.inner.delete(key).await?;
        if let Some(engine) = self.engine.get() {
            engine.h_remove(key.to_vec()).await.map_err(engine_err)?;
        }
        Ok(())
    }

    fn iter(&self, tree_id: TreeId) -> BoxStream<'static, StoreResult<KvPair>> {
        self.inner.iter(tree_id)
    }
}

/// A replica: a tracked user store, its digest store, and the engine over
/// both, with blocking calls for deterministic assertions.
pub fn replica(
    segments: u32,
    tree_id: TreeId,
) -> (Arc<TrackedKv>, Arc<MemDigestStore>, Arc<HashTreeEngine>) {
    let kv = Arc::new(TrackedKv::new());
    let digests = Arc::new(MemDigestStore::new());
    let engine = Arc::new(
        HashTreeEngine::builder(kv.clone(), Arc::new(SingleTreeIdProvider::new(tree_id)))
            .digest_store(digests.clone())
            .segments(segments)
            .non_blocking(false)
            .build()
            .expect("engine builds"),
    );
    kv.attach(engine.clone());
    (kv, digests, engine)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
