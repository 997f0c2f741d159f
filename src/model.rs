//! Core data types shared by the engine, the stores, and the peer transport.

use std::fmt;

/// Identifies a logical sub-tree. One engine may host many independent trees.
pub type TreeId = i64;

/// Identifies one of the `S` segments a tree's key space is partitioned into.
pub type SegId = u32;

/// Pre-order id of a node in the balanced binary tree summarizing a tree's
/// segments. The root is node 0; leaves occupy the tail of the id range.
pub type NodeId = u32;

/// A `(key, digest)` pair stored under its segment.
///
/// The digest is the SHA-1 of the user-store value at the time the key was
/// last reported to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentData {
    pub key: Vec<u8>,
    pub digest: Vec<u8>,
}

impl SegmentData {
    pub fn new(key: Vec<u8>, digest: Vec<u8>) -> Self {
        Self { key, digest }
    }
}

/// A stored hash for one tree node (leaf or internal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHash {
    pub node_id: NodeId,
    pub hash: Vec<u8>,
}

impl SegmentHash {
    pub fn new(node_id: NodeId, hash: Vec<u8>) -> Self {
        Self { node_id, hash }
    }
}

/// A key/value pair shipped to a peer during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }
}

/// Outcome of one reconciliation pass against a peer.
///
/// `key_differences` counts keys that had to be pushed or repaired;
/// `extrinsic_segments` counts subtrees present only on the remote side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncDiff {
    pub key_differences: u64,
    pub extrinsic_segments: u64,
}

impl SyncDiff {
    pub fn new(key_differences: u64, extrinsic_segments: u64) -> Self {
        Self {
            key_differences,
            extrinsic_segments,
        }
    }

    /// True when the pass found anything to reconcile.
    #[must_use]
    pub fn has_differences(&self) -> bool {
        self.key_differences > 0 || self.extrinsic_segments > 0
    }
}

impl fmt::Display for SyncDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncDiff(keys={}, extrinsic={})",
            self.key_differences, self.extrinsic_segments
        )
    }
}

/// Whether a reconciliation pass mutates the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Push local state to the remote (the remote converges toward local).
    #[default]
    Update,
    /// Compute and report differences without writing to the remote.
    LocalOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_diff_difference_detection() {
        assert!(!SyncDiff::default().has_differences());
        assert!(SyncDiff::new(1, 0).has_differences());
        assert!(SyncDiff::new(0, 3).has_differences());
    }

    #[test]
    fn sync_diff_display() {
        assert_eq!(
            format!("{}", SyncDiff::new(12, 2)),
            "SyncDiff(keys=12, extrinsic=2)"
        );
    }
}
