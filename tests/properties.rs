//! Property-based checks over the digest format and the engine.

mod common;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use common::replica;
use hashtree_sync::hashing::{digest_segment_block, sha1_bytes};
use hashtree_sync::{DigestStore, KvStore, SegmentData, TreeId};

const TREE_ID: TreeId = 1;

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..16)
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..32)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// The leaf digest is exactly the SHA-1 of the line-encoded key stream,
    /// whatever the segment holds.
    #[test]
    fn segment_digest_matches_line_encoding(
        entries in prop::collection::btree_map(key_strategy(), value_strategy(), 0..20)
    ) {
        let block: Vec<SegmentData> = entries
            .iter()
            .map(|(key, value)| SegmentData::new(key.clone(), sha1_bytes(value)))
            .collect();

        let mut encoded = String::new();
        for datum in &block {
            encoded.push_str(&hex::encode(&datum.key));
            encoded.push(',');
            encoded.push_str(&hex::encode(&datum.digest));
            encoded.push('\n');
        }

        prop_assert_eq!(digest_segment_block(&block), sha1_bytes(encoded.as_bytes()));
    }

    /// Two engines fed the same pairs in different orders end up with the
    /// same root hash after a rebuild.
    #[test]
    fn root_hash_is_insertion_order_independent(
        entries in prop::collection::btree_map(key_strategy(), value_strategy(), 1..40),
        seed in any::<u64>(),
    ) {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (first_kv, _, first) = replica(16, TREE_ID);
            let (second_kv, _, second) = replica(16, TREE_ID);

            for (key, value) in &entries {
                first_kv.put(key.clone(), value.clone()).await.unwrap();
            }

            let mut shuffled: Vec<_> = entries.iter().collect();
            shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
            for (key, value) in shuffled {
                second_kv.put(key.clone(), value.clone()).await.unwrap();
            }

            first.rebuild_tree(TREE_ID, false).await.unwrap();
            second.rebuild_tree(TREE_ID, false).await.unwrap();

            let first_root = first.get_segment_hash(TREE_ID, 0).await.unwrap().unwrap();
            let second_root = second.get_segment_hash(TREE_ID, 0).await.unwrap().unwrap();
            assert_eq!(first_root.hash, second_root.hash);
        });
    }

    /// A rebuild leaves no segment dirty, however the writes interleaved.
    #[test]
    fn rebuild_always_clears_dirty_set(
        entries in prop::collection::vec((key_strategy(), value_strategy()), 1..30)
    ) {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (kv, digests, engine) = replica(8, TREE_ID);
            for (i, (key, value)) in entries.iter().enumerate() {
                if i % 3 == 2 {
                    kv.delete(key).await.unwrap();
                } else {
                    kv.put(key.clone(), value.clone()).await.unwrap();
                }
            }
            engine.rebuild_tree(TREE_ID, false).await.unwrap();
            assert!(digests.dirty_segments(TREE_ID).await.unwrap().is_empty());
        });
    }
}
