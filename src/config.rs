//! Configuration for the hash-tree engine.
//!
//! # Example
//!
//! ```
//! use hashtree_sync::HashTreesConfig;
//!
//! // Minimal config (uses defaults)
//! let config = HashTreesConfig::default();
//! assert_eq!(config.segments, 1 << 17);
//! assert!(config.non_blocking);
//!
//! // Full config
//! let config = HashTreesConfig {
//!     segments: 1 << 10,
//!     non_blocking: false,
//!     ..Default::default()
//! };
//! assert_eq!(config.segments, 1 << 10);
//! ```

use serde::Deserialize;

/// Tunables for one engine instance.
///
/// All fields have sensible defaults. Segment count is the main knob: data
/// size and segment count should grow together, otherwise one dirty segment
/// forces the rebuild to re-read a large block of keys.
#[derive(Debug, Clone, Deserialize)]
pub struct HashTreesConfig {
    /// Number of segments per tree. Rounded up to a power of two and clamped
    /// to 2^30 at construction (default: 2^17).
    #[serde(default = "default_segments")]
    pub segments: u32,

    /// Route `h_put`/`h_remove` through the background queue so user-store
    /// writers pay constant notification cost (default: true).
    #[serde(default = "default_non_blocking")]
    pub non_blocking: bool,

    /// Capacity of the background queue. Producers block while the queue is
    /// full; nothing is ever dropped (default: 2^20).
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Port for the peer server when one is run for this engine.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_segments() -> u32 {
    1 << 17
}
fn default_non_blocking() -> bool {
    true
}
fn default_queue_size() -> usize {
    1 << 20
}
fn default_server_port() -> u16 {
    crate::net::DEFAULT_PEER_PORT
}

impl Default for HashTreesConfig {
    fn default() -> Self {
        Self {
            segments: default_segments(),
            non_blocking: default_non_blocking(),
            queue_size: default_queue_size(),
            server_port: default_server_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_json() {
        let config: HashTreesConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.segments, 1 << 17);
        assert!(config.non_blocking);
        assert_eq!(config.queue_size, 1 << 20);
        assert_eq!(config.server_port, crate::net::DEFAULT_PEER_PORT);
    }

    #[test]
    fn partial_json_overrides() {
        let config: HashTreesConfig =
            serde_json::from_str(r#"{"segments": 1024, "non_blocking": false}"#).unwrap();
        assert_eq!(config.segments, 1024);
        assert!(!config.non_blocking);
        assert_eq!(config.queue_size, 1 << 20);
    }
}
