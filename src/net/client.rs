//! Thin client implementing [`HashTreePeer`] against a remote peer server.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    DeleteTreeNodeRequest, SPutRequest, SRemoveRequest, SegmentHashesRequest, SegmentRequest,
    WireKeyValue, WireSegmentData, WireSegmentHash,
};
use crate::engine::HashTreePeer;
use crate::error::HtError;
use crate::model::{KeyValue, NodeId, SegId, SegmentData, SegmentHash, TreeId};

/// A reconciliation partner reachable over HTTP.
///
/// Any failure (connect, status, decode) surfaces as [`HtError::Remote`];
/// the caller's sync aborts without touching local state and can simply be
/// retried.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPeer {
    /// Address a peer server by host and port.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self::from_url(format!("http://{host}:{port}"))
    }

    /// Address a peer server by base URL, without a trailing slash.
    #[must_use]
    pub fn from_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, HtError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self.send(path, body).await?;
        response
            .json()
            .await
            .map_err(|e| HtError::Remote(format!("invalid peer response: {e}")))
    }

    async fn post_no_content<Req>(&self, path: &str, body: &Req) -> Result<(), HtError>
    where
        Req: Serialize + ?Sized,
    {
        self.send(path, body).await.map(drop)
    }

    async fn send<Req>(&self, path: &str, body: &Req) -> Result<reqwest::Response, HtError>
    where
        Req: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| HtError::Remote(e.to_string()))?;
        if !response.status().is_success() {
            return Err(HtError::Remote(format!(
                "peer returned {} for {}",
                response.status(),
                path
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl HashTreePeer for HttpPeer {
    async fn get_segment_hashes(
        &self,
        tree_id: TreeId,
        node_ids: &[NodeId],
    ) -> Result<Vec<SegmentHash>, HtError> {
        let wire: Vec<WireSegmentHash> = self
            .post(
                "/api/tree/hashes",
                &SegmentHashesRequest {
                    tree_id,
                    node_ids: node_ids.to_vec(),
                },
            )
            .await?;
        wire.into_iter()
            .map(|w| {
                SegmentHash::try_from(w).map_err(|e| HtError::Remote(format!("invalid hash hex: {e}")))
            })
            .collect()
    }

    async fn get_segment(
        &self,
        tree_id: TreeId,
        seg_id: SegId,
    ) -> Result<Vec<SegmentData>, HtError> {
        let wire: Vec<WireSegmentData> = self
            .post("/api/tree/segment", &SegmentRequest { tree_id, seg_id })
            .await?;
        wire.into_iter()
            .map(|w| {
                SegmentData::try_from(w)
                    .map_err(|e| HtError::Remote(format!("invalid segment hex: {e}")))
            })
            .collect()
    }

    async fn s_put(&self, pairs: Vec<KeyValue>) -> Result<(), HtError> {
        let request = SPutRequest {
            pairs: pairs.iter().map(WireKeyValue::from).collect(),
        };
        self.post_no_content("/api/store/put", &request).await
    }

    async fn s_remove(&self, keys: Vec<Vec<u8>>) -> Result<(), HtError> {
        let request = SRemoveRequest {
            keys: keys.iter().map(hex::encode).collect(),
        };
        self.post_no_content("/api/store/remove", &request).await
    }

    async fn delete_tree_node(&self, tree_id: TreeId, node_id: NodeId) -> Result<(), HtError> {
        self.post_no_content(
            "/api/tree/delete-node",
            &DeleteTreeNodeRequest { tree_id, node_id },
        )
        .await
    }
}
