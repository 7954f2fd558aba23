//! Property-based tests for the dedup write path.

mod common;

use common::*;
use nvdedup::{BlockStore, DedupMode};
use proptest::prelude::*;

fn any_mode() -> impl Strategy<Value = DedupMode> {
    prop_oneof![
        Just(DedupMode::NonFin),
        Just(DedupMode::WeakStrFin),
        Just(DedupMode::StrFin)
    ]
}

fn any_chunk() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), CHUNK..=CHUNK)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_round_trip(mode in any_mode(), data in any_chunk()) {
        let (engine, store) = engine(mode);
        let w = engine.dedup_write(&data).unwrap();
        prop_assert_eq!(store.read_block(w.block).unwrap(), data);
    }

    #[test]
    fn prop_idempotent_dedup(
        strong_first in any::<bool>(),
        data in any_chunk(),
        n in 1u32..20,
    ) {
        let mode = if strong_first { DedupMode::StrFin } else { DedupMode::WeakStrFin };
        let (engine, store) = engine(mode);
        let first = engine.dedup_write(&data).unwrap();
        for _ in 1..n {
            prop_assert_eq!(engine.dedup_write(&data).unwrap().block, first.block);
        }
        prop_assert_eq!(engine.entry(first.entry).unwrap().refcount, n);
        prop_assert_eq!(store.blocks_used(), 1);
    }

    #[test]
    fn prop_blocks_match_distinct_contents(
        mode in prop_oneof![Just(DedupMode::WeakStrFin), Just(DedupMode::StrFin)],
        ids in proptest::collection::vec(0u64..12, 1..60),
    ) {
        let (engine, store) = engine(mode);
        for id in &ids {
            engine.dedup_write(&unique(*id)).unwrap();
        }
        let mut distinct = ids.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(store.blocks_used(), distinct.len());
        let snap = engine.metrics();
        prop_assert_eq!(snap.writes, ids.len() as u64);
        prop_assert_eq!(snap.blocks_allocated, distinct.len() as u64);
    }
}
