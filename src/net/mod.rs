//! JSON-over-HTTP peer transport.
//!
//! A thin client/server pair carrying the peer surface of
//! [`crate::engine::HashTreePeer`] between processes. The server side wraps
//! a local engine behind an HTTP API; the client side implements the peer
//! trait against such a server. Binary payloads travel hex encoded inside
//! JSON bodies.

pub mod client;
pub mod server;

pub use client::HttpPeer;
pub use server::{router, serve};

use serde::{Deserialize, Serialize};

use crate::model::{KeyValue, NodeId, SegId, SegmentData, SegmentHash, TreeId};

/// Default port for the peer server.
pub const DEFAULT_PEER_PORT: u16 = 8999;

#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentHashesRequest {
    pub tree_id: TreeId,
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentRequest {
    pub tree_id: TreeId,
    pub seg_id: SegId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteTreeNodeRequest {
    pub tree_id: TreeId,
    pub node_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireSegmentHash {
    pub node_id: NodeId,
    /// Hex-encoded node hash.
    pub hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireSegmentData {
    /// Hex-encoded key bytes.
    pub key: String,
    /// Hex-encoded value digest.
    pub digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireKeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SPutRequest {
    pub pairs: Vec<WireKeyValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SRemoveRequest {
    /// Hex-encoded keys.
    pub keys: Vec<String>,
}

impl From<&SegmentHash> for WireSegmentHash {
    fn from(hash: &SegmentHash) -> Self {
        Self {
            node_id: hash.node_id,
            hash: hex::encode(&hash.hash),
        }
    }
}

impl TryFrom<WireSegmentHash> for SegmentHash {
    type Error = hex::FromHexError;

    fn try_from(wire: WireSegmentHash) -> Result<Self, Self::Error> {
        Ok(SegmentHash::new(wire.node_id, hex::decode(wire.hash)?))
    }
}

impl From<&SegmentData> for WireSegmentData {
    fn from(data: &SegmentData) -> Self {
        Self {
            key: hex::encode(&data.key),
            digest: hex::encode(&data.digest),
        }
    }
}

impl TryFrom<WireSegmentData> for SegmentData {
    type Error = hex::FromHexError;

    fn try_from(wire: WireSegmentData) -> Result<Self, Self::Error> {
        Ok(SegmentData::new(
            hex::decode(wire.key)?,
            hex::decode(wire.digest)?,
        ))
    }
}

impl From<&KeyValue> for WireKeyValue {
    fn from(pair: &KeyValue) -> Self {
        Self {
            key: hex::encode(&pair.key),
            value: hex::encode(&pair.value),
        }
    }
}

impl TryFrom<WireKeyValue> for KeyValue {
    type Error = hex::FromHexError;

    fn try_from(wire: WireKeyValue) -> Result<Self, Self::Error> {
        Ok(KeyValue::new(hex::decode(wire.key)?, hex::decode(wire.value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_hash_wire_round_trip() {
        let original = SegmentHash::new(7, vec![0xde, 0xad, 0xbe, 0xef]);
        let wire = WireSegmentHash::from(&original);
        assert_eq!(wire.hash, "deadbeef");
        let back = SegmentHash::try_from(wire).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn key_value_wire_round_trip() {
        let original = KeyValue::new(vec![0x01], vec![0x02, 0x03]);
        let wire = WireKeyValue::from(&original);
        let back = KeyValue::try_from(wire).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn invalid_hex_is_rejected() {
        let wire = WireSegmentData {
            key: "zz".into(),
            digest: "00".into(),
        };
        assert!(SegmentData::try_from(wire).is_err());
    }

    #[test]
    fn requests_serialize_as_json() {
        let req = SegmentHashesRequest {
            tree_id: 1,
            node_ids: vec![0, 1, 2],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"tree_id":1,"node_ids":[0,1,2]}"#);
    }
}
