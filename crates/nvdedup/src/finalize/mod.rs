//! Write-path finalization: decide whether a chunk reuses an existing block
//! or is stored in a new one.
//!
//! - [`non_fin`]: no fingerprints, always allocate.
//! - [`weak_str_fin`]: weak fingerprint first, strong fingerprint only to
//!   confirm a weak match.
//! - [`str_fin`]: both fingerprints up front, strong table first.

pub mod non_fin;
pub mod str_fin;
pub mod weak_str_fin;

#[cfg(test)]
mod forge;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entry::{EntryTable, MetaEntry};
use crate::error::{DedupError, DedupResult};
use crate::index::FingerprintIndex;
use crate::metrics::DedupMetrics;
use crate::store::BlockStore;
use crate::types::{BlockNumber, EntryNumber};

/// Result of one deduplicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupWrite {
    /// Block now holding the written content.
    pub block: BlockNumber,
    /// Entry describing that block.
    pub entry: EntryNumber,
    /// 0 for a dedup hit, 1 when a new block was consumed.
    pub blocks_allocated: u32,
}

impl DedupWrite {
    pub(crate) fn hit(block: BlockNumber, entry: EntryNumber) -> Self {
        Self {
            block,
            entry,
            blocks_allocated: 0,
        }
    }

    pub(crate) fn allocated(block: BlockNumber, entry: EntryNumber) -> Self {
        Self {
            block,
            entry,
            blocks_allocated: 1,
        }
    }

    /// True if the write reused an existing block.
    pub fn is_dedup_hit(&self) -> bool {
        self.blocks_allocated == 0
    }
}

/// Everything a finalization algorithm works against.
pub struct FinalizeCtx<'a, S: BlockStore + ?Sized> {
    /// In-memory view of the metadata entry table.
    pub entries: &'a EntryTable,
    /// Weak and strong fingerprint tables.
    pub index: &'a FingerprintIndex,
    /// Block store and entry allocator.
    pub store: &'a S,
    /// Engine counters.
    pub metrics: &'a DedupMetrics,
}

impl<S: BlockStore + ?Sized> FinalizeCtx<'_, S> {
    /// Reserve an entry, write the block, populate the entry from `build`,
    /// and register the block→entry mapping. The entry is not flushed.
    pub(crate) fn allocate(
        &self,
        data: &[u8],
        build: impl FnOnce(BlockNumber) -> MetaEntry,
    ) -> DedupResult<(EntryNumber, BlockNumber)> {
        let entry = self.store.alloc_entry().map_err(log_exhaustion)?;
        if entry.as_u64() >= self.entries.capacity() {
            return Err(log_exhaustion(DedupError::AllocationExhausted { resource: "entry" }));
        }
        let block = self
            .store
            .alloc_and_write_block(data)
            .map_err(log_exhaustion)?;
        self.entries.install(entry, build(block))?;
        self.store.record_block_entry_mapping(block, entry);
        debug!(%entry, %block, "Allocated new entry and block");
        Ok((entry, block))
    }

    /// Bump an entry's refcount and return its block.
    pub(crate) fn add_ref(&self, entry: EntryNumber) -> DedupResult<BlockNumber> {
        self.entries.update(entry, |e| {
            e.refcount = e.refcount.saturating_add(1);
            e.block_nr
        })
    }

    /// Durably persist an entry's current state.
    pub(crate) fn flush(&self, entry: EntryNumber) -> DedupResult<()> {
        let record = self.entries.record(entry)?;
        self.store.flush_entry(entry, &record);
        Ok(())
    }
}

fn log_exhaustion(err: DedupError) -> DedupError {
    if let DedupError::AllocationExhausted { resource } = &err {
        warn!(resource, "Dedup allocation failed: store exhausted");
    }
    err
}
