#![warn(missing_docs)]
//! nvdedup workload simulator

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use nvdedup::{DedupConfig, DedupEngine, MemStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Distinct chunk contents duplicates are drawn from.
const HOT_SET: u64 = 64;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: nvdedup-sim <writes> <dup-percent> [threads] [config.toml|json]");
        std::process::exit(1);
    }

    let writes: u64 = args[1].parse().context("invalid write count")?;
    let dup_percent: u32 = args[2].parse().context("invalid duplicate percentage")?;
    if dup_percent > 100 {
        bail!("duplicate percentage must be at most 100, got {}", dup_percent);
    }
    let threads: u64 = match args.get(3) {
        Some(t) => t.parse().context("invalid thread count")?,
        None => 4,
    };
    if threads == 0 {
        bail!("thread count must be at least 1");
    }
    let config = match args.get(4) {
        Some(path) => DedupConfig::from_file(Path::new(path))
            .with_context(|| format!("failed to load config from {}", path))?,
        None => DedupConfig::default(),
    };

    tracing::info!(writes, dup_percent, threads, chunk_size = config.chunk_size, "Starting simulation");

    let seed = config.rng_seed.unwrap_or(0);
    let chunk_size = config.chunk_size;
    let store = Arc::new(MemStore::new(chunk_size, writes, config.max_entries));
    let engine = DedupEngine::new(config, Arc::clone(&store))?;

    std::thread::scope(|s| -> anyhow::Result<()> {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let engine = &engine;
                let share = writes / threads + u64::from(t < writes % threads);
                s.spawn(move || -> anyhow::Result<()> {
                    let mut rng = StdRng::seed_from_u64(seed ^ t);
                    for i in 0..share {
                        let data = if rng.gen_range(0..100) < dup_percent {
                            synthetic_chunk(rng.gen_range(0..HOT_SET), chunk_size)
                        } else {
                            synthetic_chunk(HOT_SET + (t << 40) + i, chunk_size)
                        };
                        engine.dedup_write(&data)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("writer thread panicked"),
            }
        }
        Ok(())
    })?;

    let snapshot = engine.metrics();
    tracing::info!(
        blocks_used = store.blocks_used(),
        live_entries = engine.live_entries(),
        dedup_ratio = snapshot.dedup_ratio,
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Chunk content determined by `id`: the id's bytes repeated.
fn synthetic_chunk(id: u64, chunk_size: usize) -> Vec<u8> {
    id.to_le_bytes().iter().copied().cycle().take(chunk_size).collect()
}
