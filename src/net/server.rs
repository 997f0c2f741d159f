//! Peer server: a long-running HTTP process dispatching to a local engine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tracing::info;

use super::{
    DeleteTreeNodeRequest, SPutRequest, SRemoveRequest, SegmentHashesRequest, SegmentRequest,
    WireSegmentData, WireSegmentHash,
};
use crate::engine::HashTreeEngine;
use crate::error::HtError;
use crate::model::KeyValue;

struct PeerServerError {
    status: StatusCode,
    message: String,
}

impl PeerServerError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<HtError> for PeerServerError {
    fn from(err: HtError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for PeerServerError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn segment_hashes(
    State(engine): State<Arc<HashTreeEngine>>,
    Json(req): Json<SegmentHashesRequest>,
) -> Result<Json<Vec<WireSegmentHash>>, PeerServerError> {
    let hashes = engine.get_segment_hashes(req.tree_id, &req.node_ids).await?;
    Ok(Json(hashes.iter().map(WireSegmentHash::from).collect()))
}

async fn segment(
    State(engine): State<Arc<HashTreeEngine>>,
    Json(req): Json<SegmentRequest>,
) -> Result<Json<Vec<WireSegmentData>>, PeerServerError> {
    let block = engine.get_segment(req.tree_id, req.seg_id).await?;
    Ok(Json(block.iter().map(WireSegmentData::from).collect()))
}

async fn s_put(
    State(engine): State<Arc<HashTreeEngine>>,
    Json(req): Json<SPutRequest>,
) -> Result<StatusCode, PeerServerError> {
    let pairs: Vec<KeyValue> = req
        .pairs
        .into_iter()
        .map(KeyValue::try_from)
        .collect::<Result<_, _>>()
        .map_err(|e| PeerServerError::bad_request(format!("invalid key/value hex: {e}")))?;
    engine.s_put(pairs).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn s_remove(
    State(engine): State<Arc<HashTreeEngine>>,
    Json(req): Json<SRemoveRequest>,
) -> Result<StatusCode, PeerServerError> {
    let keys: Vec<Vec<u8>> = req
        .keys
        .into_iter()
        .map(hex::decode)
        .collect::<Result<_, _>>()
        .map_err(|e| PeerServerError::bad_request(format!("invalid key hex: {e}")))?;
    engine.s_remove(keys).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_tree_node(
    State(engine): State<Arc<HashTreeEngine>>,
    Json(req): Json<DeleteTreeNodeRequest>,
) -> Result<StatusCode, PeerServerError> {
    engine.delete_tree_node(req.tree_id, req.node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Build the peer API router over an engine.
pub fn router(engine: Arc<HashTreeEngine>) -> Router {
    Router::new()
        .route("/api/tree/hashes", post(segment_hashes))
        .route("/api/tree/segment", post(segment))
        .route("/api/tree/delete-node", post(delete_tree_node))
        .route("/api/store/put", post(s_put))
        .route("/api/store/remove", post(s_remove))
        .with_state(engine)
}

/// Serve the peer API on `port` until the task is dropped or the listener
/// fails.
pub async fn serve(engine: Arc<HashTreeEngine>, port: u16) -> Result<(), HtError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "peer server listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}
