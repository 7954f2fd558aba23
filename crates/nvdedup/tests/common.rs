//! Shared fixtures for the nvdedup integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use nvdedup::{DedupConfig, DedupEngine, DedupMode, MemStore};

#[path = "../src/finalize/forge.rs"]
mod forge;

pub use forge::forge_weak_collision;

/// Chunk size used by every fixture; small to keep tests fast.
pub const CHUNK: usize = 512;

/// Engine configuration for tests: small tables, a long window, and a fixed seed.
pub fn test_config(initial_mode: DedupMode) -> DedupConfig {
    DedupConfig {
        chunk_size: CHUNK,
        num_entries_bits: 8,
        lock_count: 16,
        max_entries: 4096,
        sample_block: 1 << 20,
        str_fin_thresh: 16,
        non_fin_thresh: 4,
        initial_mode,
        rng_seed: Some(42),
    }
}

/// A `MemStore`-backed engine with room for 4096 blocks.
pub fn engine_with(config: DedupConfig) -> (DedupEngine<MemStore>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new(config.chunk_size, 4096, config.max_entries));
    let engine = DedupEngine::new(config, Arc::clone(&store)).expect("valid test config");
    (engine, store)
}

/// Engine starting in `mode` that will not leave it during a test.
pub fn engine(mode: DedupMode) -> (DedupEngine<MemStore>, Arc<MemStore>) {
    engine_with(test_config(mode))
}

/// A chunk filled with `byte`.
pub fn filled(byte: u8) -> Vec<u8> {
    vec![byte; CHUNK]
}

/// A chunk whose content is unique per `id`.
pub fn unique(id: u64) -> Vec<u8> {
    id.to_le_bytes().iter().copied().cycle().take(CHUNK).collect()
}
