//! # hashtree-sync
//!
//! A persistent hash-tree (Merkle) engine for detecting and reconciling
//! differences between two replicas of a large key/value dataset with
//! minimal transfer.
//!
//! ## Architecture
//!
//! The application's data stays in its own key/value store; the engine
//! maintains a compact digest structure next to it:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Application writes                      │
//! │  • put/delete against the user store                       │
//! │  • h_put/h_remove notifications to the engine              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 (bounded queue, coalescing)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Digest store                          │
//! │  • per-key SHA-1 digests, grouped into segments            │
//! │  • dirty bit per touched segment                           │
//! │  • binary hash tree summarizing the segments               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (periodic rebuild + sync)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Reconciliation                         │
//! │  • top-down walk of two trees finds differing segments     │
//! │  • key-level diff emits s_put/s_remove against the peer    │
//! │  • remote peers reachable over HTTP (axum/reqwest)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes never rehash anything: they update one segment entry and set a
//! dirty bit. A periodic [`HashTreeEngine::rebuild_tree`] folds dirty
//! segments into fresh leaf hashes and propagates them to the root, and
//! [`HashTreeEngine::sync_with`] compares two trees top-down, exchanging
//! only the keys that actually diverge.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hashtree_sync::{HashTreeEngine, KvStore, MemKvStore, SingleTreeIdProvider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hashtree_sync::HtError> {
//!     let store = Arc::new(MemKvStore::new());
//!     let engine = HashTreeEngine::builder(
//!         store.clone(),
//!         Arc::new(SingleTreeIdProvider::new(1)),
//!     )
//!     .segments(1 << 10)
//!     .build()?;
//!
//!     engine.start().await;
//!
//!     // Mirror every user-store write into the engine.
//!     store.put(b"key".to_vec(), b"value".to_vec()).await?;
//!     engine.h_put(b"key".to_vec(), b"value".to_vec()).await?;
//!
//!     // Periodically fold dirty segments into the tree.
//!     engine.rebuild_tree(1, false).await?;
//!
//!     // Reconcile a remote replica toward local state.
//!     let peer = hashtree_sync::HttpPeer::new("replica-b", 8999);
//!     let diff = engine.sync_with(1, &peer).await?;
//!     println!("pushed {} differing keys", diff.key_differences);
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: the [`HashTreeEngine`] itself (writes, rebuild, sync)
//! - [`store`]: store contracts plus in-memory and sled-backed digest stores
//! - [`net`]: HTTP peer server and client
//! - [`tree`]: node-id arithmetic over the balanced binary tree
//! - [`hashing`]: the line-oriented SHA-1 digest format
//! - [`providers`]: key-to-tree and key-to-segment mappings
//! - [`locks`]: per-tree locking for rebuild and sync
//! - [`observer`]: engine event callbacks

pub mod config;
pub mod engine;
pub mod error;
pub mod hashing;
pub mod locks;
pub mod metrics;
pub mod model;
pub mod net;
pub mod observer;
pub mod providers;
pub mod store;
pub mod tree;

pub(crate) mod updater;

pub use config::HashTreesConfig;
pub use engine::{Builder, EngineState, HashTreeEngine, HashTreePeer};
pub use error::HtError;
pub use locks::{LockProvider, TreeLock, TreeLockProvider};
pub use model::{
    KeyValue, NodeId, SegId, SegmentData, SegmentHash, SyncDiff, SyncMode, TreeId,
};
pub use net::HttpPeer;
pub use observer::HashTreesObserver;
pub use providers::{
    ModuloSegmentIdProvider, SegmentIdProvider, SingleTreeIdProvider, TreeIdProvider,
};
pub use store::{
    DigestStore, KvStore, MemDigestStore, MemKvStore, SledDigestStore, StoreError,
};
