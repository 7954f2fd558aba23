//! Engine configuration: table geometry, sampling window, and mode thresholds.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::controller::DedupMode;
use crate::error::{DedupError, DedupResult};

/// Largest supported `num_entries_bits`; bounds the bucket array allocation.
pub const MAX_ENTRIES_BITS: u32 = 28;

/// Configuration for a [`crate::DedupEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Fixed chunk size in bytes; every write must be exactly this long.
    pub chunk_size: usize,
    /// Each fingerprint table has `2^num_entries_bits` buckets.
    pub num_entries_bits: u32,
    /// Number of lock stripes per fingerprint table.
    pub lock_count: usize,
    /// Number of slots in the metadata entry table.
    pub max_entries: u64,
    /// Writes per sampling window of the mode controller.
    pub sample_block: u64,
    /// More duplicate hits than this in a window selects Strong-First.
    pub str_fin_thresh: u64,
    /// More duplicate hits than this (but not above `str_fin_thresh`) selects Weak-then-Strong.
    pub non_fin_thresh: u64,
    /// Mode used until the first window closes.
    pub initial_mode: DedupMode,
    /// Seed for the exploration coin; `None` seeds from OS entropy.
    pub rng_seed: Option<u64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            num_entries_bits: 16,
            lock_count: 1024,
            max_entries: 1 << 20,
            sample_block: 1024,
            str_fin_thresh: 512,
            non_fin_thresh: 64,
            initial_mode: DedupMode::WeakStrFin,
            rng_seed: None,
        }
    }
}

impl DedupConfig {
    /// Number of buckets in each fingerprint table.
    pub fn bucket_count(&self) -> usize {
        1usize << self.num_entries_bits
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> DedupResult<()> {
        if self.chunk_size == 0 {
            return Err(DedupError::InvalidConfig(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.num_entries_bits == 0 || self.num_entries_bits > MAX_ENTRIES_BITS {
            return Err(DedupError::InvalidConfig(format!(
                "num_entries_bits must be in 1..={}, got {}",
                MAX_ENTRIES_BITS, self.num_entries_bits
            )));
        }
        if self.lock_count == 0 || self.lock_count > self.bucket_count() {
            return Err(DedupError::InvalidConfig(format!(
                "lock_count must be in 1..={}, got {}",
                self.bucket_count(),
                self.lock_count
            )));
        }
        if self.max_entries == 0 {
            return Err(DedupError::InvalidConfig(
                "max_entries must be greater than 0".to_string(),
            ));
        }
        if self.sample_block == 0 || self.sample_block > u64::from(u32::MAX) {
            return Err(DedupError::InvalidConfig(format!(
                "sample_block must be in 1..={}",
                u32::MAX
            )));
        }
        if self.str_fin_thresh <= self.non_fin_thresh {
            return Err(DedupError::InvalidConfig(format!(
                "str_fin_thresh ({}) must exceed non_fin_thresh ({})",
                self.str_fin_thresh, self.non_fin_thresh
            )));
        }
        Ok(())
    }

    /// Load a configuration from a `.toml` or `.json` file and validate it.
    pub fn from_file(path: &Path) -> DedupResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DedupConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(e.to_string()))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(e.to_string()))?,
            _ => {
                return Err(DedupError::InvalidConfig(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }
}
