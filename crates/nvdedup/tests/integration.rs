//! End-to-end tests of the dedup write path over `MemStore`.

mod common;

use std::sync::{mpsc, Arc};
use std::time::Duration;

use common::*;
use nvdedup::{
    strong_fingerprint, weak_fingerprint, BlockStore, DedupConfig, DedupEngine, DedupMode,
    EntryFlag, MemStore,
};

#[test]
fn test_identical_writes_dedup_in_fingerprinting_modes() {
    for mode in [DedupMode::StrFin, DedupMode::WeakStrFin] {
        let (engine, store) = engine(mode);
        let data = filled(0x42);
        let first = engine.dedup_write(&data).unwrap();
        for _ in 1..10 {
            let w = engine.dedup_write(&data).unwrap();
            assert_eq!(w.block, first.block, "mode {}", mode);
            assert_eq!(w.blocks_allocated, 0);
        }
        assert_eq!(engine.entry(first.entry).unwrap().refcount, 10);
        assert_eq!(store.blocks_used(), 1);
    }
}

#[test]
fn test_non_fin_never_dedups() {
    let (engine, store) = engine(DedupMode::NonFin);
    let data = filled(0x42);
    let blocks: Vec<_> = (0..6)
        .map(|_| engine.dedup_write(&data).unwrap())
        .inspect(|w| assert_eq!(w.blocks_allocated, 1))
        .map(|w| {
            let entry = engine.entry(w.entry).unwrap();
            assert_eq!(entry.refcount, 1);
            assert_eq!(entry.flag, EntryFlag::NonFin);
            w.block
        })
        .collect();
    let mut distinct = blocks.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 6);
    assert_eq!(store.blocks_used(), 6);
    assert_eq!(engine.index().weak().node_count(), 0);
}

#[test]
fn test_weak_collision_keeps_contents_apart() {
    for mode in [DedupMode::StrFin, DedupMode::WeakStrFin] {
        let (engine, store) = engine(mode);
        let original = unique(7);
        let forged = forge_weak_collision(&original, 0xC3);
        assert_eq!(weak_fingerprint(&original), weak_fingerprint(&forged));

        let a = engine.dedup_write(&original).unwrap();
        let b = engine.dedup_write(&forged).unwrap();
        assert_eq!(b.blocks_allocated, 1, "mode {}", mode);
        assert_ne!(a.block, b.block);
        assert_ne!(a.entry, b.entry);

        let ea = engine.entry(a.entry).unwrap();
        let eb = engine.entry(b.entry).unwrap();
        assert_eq!(ea.refcount, 1);
        assert_eq!(eb.refcount, 1);
        assert_eq!(ea.strong_fp, strong_fingerprint(&original));
        assert_eq!(eb.strong_fp, strong_fingerprint(&forged));
        assert_eq!(store.read_block(a.block).unwrap(), original);
        assert_eq!(store.read_block(b.block).unwrap(), forged);
    }
}

#[test]
fn test_round_trip_every_mode() {
    for mode in [DedupMode::NonFin, DedupMode::WeakStrFin, DedupMode::StrFin] {
        let (engine, store) = engine(mode);
        for id in 0..20 {
            let data = unique(id % 7);
            let w = engine.dedup_write(&data).unwrap();
            assert_eq!(store.read_block(w.block).unwrap(), data, "mode {}", mode);
        }
    }
}

#[test]
fn test_worked_example() {
    let (engine, _store) = engine(DedupMode::StrFin);
    let a = filled(0x00);
    let b = filled(0xFF);

    let first = engine.dedup_write(&a).unwrap();
    assert_eq!(first.blocks_allocated, 1);
    assert_eq!(engine.entry(first.entry).unwrap().refcount, 1);

    let second = engine.dedup_write(&a).unwrap();
    assert_eq!(second.block, first.block);
    assert_eq!(second.blocks_allocated, 0);
    assert_eq!(engine.entry(first.entry).unwrap().refcount, 2);

    let third = engine.dedup_write(&b).unwrap();
    assert_ne!(third.block, first.block);
    assert_eq!(third.blocks_allocated, 1);
}

fn window_config(initial_mode: DedupMode, seed: u64) -> DedupConfig {
    DedupConfig {
        sample_block: 20,
        str_fin_thresh: 10,
        non_fin_thresh: 3,
        rng_seed: Some(seed),
        ..test_config(initial_mode)
    }
}

/// Write one window of 20 chunks containing `dups` hits against a fresh engine
/// in StrFin mode, and return the mode selected for the next window.
fn mode_after_window(dups: u64, seed: u64) -> DedupMode {
    let (engine, _store) = engine_with(window_config(DedupMode::StrFin, seed));
    let hot = unique(u64::MAX);
    engine.dedup_write(&hot).unwrap();
    for _ in 0..dups {
        assert!(engine.dedup_write(&hot).unwrap().is_dedup_hit());
    }
    for id in 0..(19 - dups) {
        engine.dedup_write(&unique(id)).unwrap();
    }
    assert_eq!(engine.window().unwrap().cur_block, 0);
    engine.mode().unwrap()
}

#[test]
fn test_mode_transitions() {
    assert_eq!(mode_after_window(11, 1), DedupMode::StrFin);
    assert_eq!(mode_after_window(15, 1), DedupMode::StrFin);
    for dups in 4..=10 {
        assert_eq!(mode_after_window(dups, 1), DedupMode::WeakStrFin, "dups = {}", dups);
    }
    for seed in 0..8 {
        for dups in [0, 3] {
            let mode = mode_after_window(dups, seed);
            assert!(
                matches!(mode, DedupMode::NonFin | DedupMode::WeakStrFin),
                "dups = {} seed = {} gave {}",
                dups,
                seed,
                mode
            );
        }
    }
}

#[test]
fn test_low_duplication_explores_both_modes() {
    let modes: Vec<_> = (0..32).map(|seed| mode_after_window(0, seed)).collect();
    assert!(modes.contains(&DedupMode::NonFin));
    assert!(modes.contains(&DedupMode::WeakStrFin));
}

#[test]
fn test_concurrent_identical_writes_converge() {
    for mode in [DedupMode::StrFin, DedupMode::WeakStrFin] {
        let (engine, store) = engine(mode);
        let data = filled(0x99);
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let engine = &engine;
                    let data = &data;
                    s.spawn(move || {
                        (0..25)
                            .map(|_| engine.dedup_write(data).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let canonical = results[0].block;
        assert!(results.iter().all(|w| w.block == canonical), "mode {}", mode);
        assert_eq!(results.iter().filter(|w| w.blocks_allocated == 1).count(), 1);
        assert_eq!(engine.entry(results[0].entry).unwrap().refcount, 200);
        assert_eq!(store.blocks_used(), 1);
    }
}

#[test]
fn test_concurrent_mixed_writes_account_for_every_reference() {
    let (engine, store) = engine(DedupMode::WeakStrFin);
    std::thread::scope(|s| {
        for t in 0..4u64 {
            let engine = &engine;
            s.spawn(move || {
                for i in 0..50u64 {
                    engine.dedup_write(&unique((t * 50 + i) % 40)).unwrap();
                }
            });
        }
    });
    assert_eq!(store.blocks_used(), 40);
    let total_refs: u64 = store
        .persisted_records()
        .iter()
        .map(|(nr, _)| engine.entry(*nr).unwrap().refcount as u64)
        .sum();
    assert_eq!(total_refs, 200);
    assert_eq!(engine.metrics().dedup_hits, 160);
}

/// Find a chunk whose weak bucket lives in a different stripe than `stripe`
/// (or the same one when `same` is true).
fn chunk_in_stripe(engine: &DedupEngine<MemStore>, stripe: usize, same: bool) -> Vec<u8> {
    let table = engine.index().weak();
    (1000..)
        .map(unique)
        .find(|data| {
            let s = table.stripe_of(table.bucket_of(&weak_fingerprint(data)));
            (s == stripe) == same
        })
        .unwrap()
}

#[test]
fn test_disjoint_stripes_do_not_block() {
    let (engine, _store) = engine(DedupMode::StrFin);
    let held_data = unique(1);
    let held_fp = weak_fingerprint(&held_data);
    let table = engine.index().weak();
    let held_stripe = table.stripe_of(table.bucket_of(&held_fp));
    let other = chunk_in_stripe(&engine, held_stripe, false);

    let guard = engine.index().lock_weak(&held_fp);
    let (tx, rx) = mpsc::channel();
    std::thread::scope(|s| {
        let engine = &engine;
        s.spawn(move || {
            let w = engine.dedup_write(&other).unwrap();
            tx.send(w).unwrap();
        });
        let w = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("write on a disjoint stripe must not wait");
        assert_eq!(w.blocks_allocated, 1);
    });
    drop(guard);
}

#[test]
fn test_same_stripe_waits_for_holder() {
    let (engine, _store) = engine(DedupMode::StrFin);
    let held_fp = weak_fingerprint(&unique(1));
    let table = engine.index().weak();
    let held_stripe = table.stripe_of(table.bucket_of(&held_fp));
    let contended = chunk_in_stripe(&engine, held_stripe, true);

    let guard = engine.index().lock_weak(&held_fp);
    let (tx, rx) = mpsc::channel();
    std::thread::scope(|s| {
        let engine = &engine;
        s.spawn(move || {
            tx.send(engine.dedup_write(&contended).unwrap()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
    });
}

#[test]
fn test_recover_after_restart() {
    let store = Arc::new(MemStore::new(CHUNK, 4096, 4096));
    let first = DedupEngine::new(test_config(DedupMode::StrFin), Arc::clone(&store)).unwrap();
    let written: Vec<_> = (0..30)
        .map(|i| first.dedup_write(&unique(i % 10)).unwrap())
        .collect();
    drop(first);

    let second = DedupEngine::recover(
        test_config(DedupMode::WeakStrFin),
        Arc::clone(&store),
        store.persisted_records(),
    )
    .unwrap();
    assert_eq!(second.live_entries(), 10);
    assert_eq!(second.index().strong().node_count(), 10);

    for (i, w) in written.iter().take(10).enumerate() {
        let again = second.dedup_write(&unique(i as u64)).unwrap();
        assert!(again.is_dedup_hit());
        assert_eq!(again.block, w.block);
        assert_eq!(second.entry(w.entry).unwrap().refcount, 4);
    }
    assert_eq!(store.blocks_used(), 10);
}

#[test]
fn test_every_new_block_is_mapped_to_its_entry() {
    for mode in [DedupMode::NonFin, DedupMode::WeakStrFin, DedupMode::StrFin] {
        let (engine, store) = engine(mode);
        for id in 0..5 {
            let w = engine.dedup_write(&unique(id)).unwrap();
            assert_eq!(store.entry_for_block(w.block), Some(w.entry));
            assert_eq!(
                store.persisted_record(w.entry),
                Some(engine.entry(w.entry).unwrap().encode())
            );
        }
    }
}
