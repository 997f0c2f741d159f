//! Reconciliation against a peer reached over HTTP: a peer server wraps the
//! remote engine and the local side drives sync through the thin client.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{random_bytes, replica, TrackedKv};
use hashtree_sync::net::router;
use hashtree_sync::{HashTreeEngine, HttpPeer, KvStore, MemDigestStore, TreeId};

const TREE_ID: TreeId = 1;
const SEGMENTS: u32 = 64;

async fn spawn_peer_server(
    engine: Arc<HashTreeEngine>,
) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let app = router(engine);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("peer server");
    });
    addr
}

async fn replicas_with_server() -> (
    (Arc<TrackedKv>, Arc<MemDigestStore>, Arc<HashTreeEngine>),
    (Arc<TrackedKv>, Arc<MemDigestStore>, Arc<HashTreeEngine>),
    HttpPeer,
) {
    let local = replica(SEGMENTS, TREE_ID);
    let remote = replica(SEGMENTS, TREE_ID);
    let addr = spawn_peer_server(remote.2.clone()).await;
    let peer = HttpPeer::new("127.0.0.1", addr.port());
    (local, remote, peer)
}

#[tokio::test]
async fn http_sync_populates_empty_remote() {
    let ((local_kv, _, local), (remote_kv, _, remote), peer) = replicas_with_server().await;

    for _ in 0..SEGMENTS {
        local_kv
            .put(random_bytes(8), random_bytes(8))
            .await
            .unwrap();
    }
    local.rebuild_tree(TREE_ID, false).await.unwrap();

    let diff = local.sync_with(TREE_ID, &peer).await.unwrap();
    assert!(diff.has_differences());
    assert_eq!(local_kv.snapshot(), remote_kv.snapshot());

    remote.rebuild_tree(TREE_ID, false).await.unwrap();
    let diff = local.sync_with(TREE_ID, &peer).await.unwrap();
    assert!(!diff.has_differences());

    let local_root = local.get_segment_hash(TREE_ID, 0).await.unwrap().unwrap();
    let remote_root = remote.get_segment_hash(TREE_ID, 0).await.unwrap().unwrap();
    assert_eq!(local_root.hash, remote_root.hash);
}

#[tokio::test]
async fn http_sync_converges_overwritten_segments() {
    let ((local_kv, _, local), (remote_kv, _, remote), peer) = replicas_with_server().await;

    for _ in 0..SEGMENTS {
        local_kv
            .put(random_bytes(8), random_bytes(8))
            .await
            .unwrap();
    }
    local.rebuild_tree(TREE_ID, false).await.unwrap();
    local.sync_with(TREE_ID, &peer).await.unwrap();
    remote.rebuild_tree(TREE_ID, false).await.unwrap();

    for seg in 0..SEGMENTS {
        let block = remote.get_segment(TREE_ID, seg).await.unwrap();
        for datum in block {
            local_kv.put(datum.key, random_bytes(8)).await.unwrap();
        }
        local.rebuild_tree(TREE_ID, false).await.unwrap();
        remote.rebuild_tree(TREE_ID, false).await.unwrap();
        local.sync_with(TREE_ID, &peer).await.unwrap();

        assert_eq!(local_kv.snapshot(), remote_kv.snapshot());
    }
}

#[tokio::test]
async fn unreachable_peer_aborts_sync_cleanly() {
    let (local_kv, _, local) = replica(SEGMENTS, TREE_ID);

    local_kv
        .put(random_bytes(8), random_bytes(8))
        .await
        .unwrap();
    local.rebuild_tree(TREE_ID, false).await.unwrap();

    // Nothing listens here; the sync must fail with a remote error and a
    // later retry against a real peer must still work.
    let dead_peer = HttpPeer::new("127.0.0.1", 1);
    let result = local.sync_with(TREE_ID, &dead_peer).await;
    assert!(matches!(result, Err(hashtree_sync::HtError::Remote(_))));

    let (remote_kv, _, remote_engine) = replica(SEGMENTS, TREE_ID);
    let addr = spawn_peer_server(remote_engine).await;
    let peer = HttpPeer::new("127.0.0.1", addr.port());
    let diff = local.sync_with(TREE_ID, &peer).await.unwrap();
    assert!(diff.has_differences());
    assert_eq!(local_kv.snapshot(), remote_kv.snapshot());
}
