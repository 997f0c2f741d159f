// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Digest computation for segment blocks and tree nodes.
//!
//! The on-disk and wire format is line oriented: each element is hex encoded,
//! elements of one entry are joined with `,`, and every line ends with `\n`,
//! including the last. A leaf hash digests its segment's `(key, digest)`
//! stream in key order; an internal hash digests only the child hashes that
//! are currently present, in child-id order. The two are not interchangeable:
//! an absent child contributes nothing, not an empty string.

use sha1::{Digest, Sha1};

use crate::model::SegmentData;

/// Length in bytes of every digest produced here.
pub const DIGEST_LEN: usize = 20;

/// SHA-1 of a byte slice.
pub fn sha1_bytes(data: &[u8]) -> Vec<u8> {
    Sha1::digest(data).to_vec()
}

/// Hex-encode each value and join with commas: `hex(a),hex(b)`.
pub fn hex_line(values: &[&[u8]]) -> String {
    values
        .iter()
        .map(|v| hex::encode(v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Digest a list of lines, appending `\n` after every line.
pub fn digest_lines<I, S>(lines: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line.as_ref());
        buf.push('\n');
    }
    sha1_bytes(buf.as_bytes())
}

/// Hash for an internal node: the present child hashes, hex encoded, one per
/// line, in child-id order.
pub fn digest_hashes(hashes: &[Vec<u8>]) -> Vec<u8> {
    digest_lines(hashes.iter().map(|h| hex::encode(h)))
}

/// Hash for a leaf node: the segment's `(key, digest)` pairs, one
/// `hex(key),hex(digest)` line each, in key order.
pub fn digest_segment_block(block: &[SegmentData]) -> Vec<u8> {
    digest_lines(
        block
            .iter()
            .map(|sd| hex_line(&[sd.key.as_slice(), sd.digest.as_slice()])),
    )
}
