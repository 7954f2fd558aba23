//! The block store and entry allocator consumed by the dedup engine.
//!
//! [`BlockStore`] is the narrow interface to the persistent store: block
//! allocation, reads, durable entry flushes, the block→entry reverse map and
//! the fingerprint backfill trigger. [`MemStore`] is an in-memory
//! implementation for tests and simulation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::entry::ENTRY_SIZE;
use crate::error::{DedupError, DedupResult};
use crate::types::{BlockNumber, EntryNumber};

/// Primitives the dedup engine needs from the persistent store.
/// Object-safe and shareable across writer threads.
pub trait BlockStore: Send + Sync {
    /// Reserve a fresh metadata entry slot.
    fn alloc_entry(&self) -> DedupResult<EntryNumber>;

    /// Allocate a free block and durably write `data` into it.
    fn alloc_and_write_block(&self, data: &[u8]) -> DedupResult<BlockNumber>;

    /// Read back previously written block content.
    fn read_block(&self, block: BlockNumber) -> DedupResult<Vec<u8>>;

    /// Make the entry's current record durable before returning.
    fn flush_entry(&self, entry: EntryNumber, record: &[u8; ENTRY_SIZE]);

    /// Register the reverse lookup from a block to its entry.
    fn record_block_entry_mapping(&self, block: BlockNumber, entry: EntryNumber);

    /// Ask the store to fingerprint blocks written without fingerprints. Fire and forget.
    fn schedule_fingerprint_backfill(&self);
}

/// Counters exposed by [`MemStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemStoreStats {
    /// Blocks allocated and written.
    pub blocks_written: u64,
    /// Block reads served.
    pub blocks_read: u64,
    /// Entry slots handed out.
    pub entries_allocated: u64,
    /// Entry flushes.
    pub entry_flushes: u64,
    /// Backfill requests received.
    pub backfill_requests: u64,
}

/// In-memory block store with bounded block and entry capacity.
pub struct MemStore {
    block_size: usize,
    max_blocks: u64,
    max_entries: u64,
    next_block: AtomicU64,
    next_entry: AtomicU64,
    blocks: DashMap<BlockNumber, Vec<u8>>,
    records: DashMap<EntryNumber, [u8; ENTRY_SIZE]>,
    block_entries: DashMap<BlockNumber, EntryNumber>,
    blocks_read: AtomicU64,
    entry_flushes: AtomicU64,
    backfill_requests: AtomicU64,
}

impl MemStore {
    /// Create a store of `max_blocks` blocks of `block_size` bytes and `max_entries` entry slots.
    pub fn new(block_size: usize, max_blocks: u64, max_entries: u64) -> Self {
        Self {
            block_size,
            max_blocks,
            max_entries,
            next_block: AtomicU64::new(0),
            next_entry: AtomicU64::new(0),
            blocks: DashMap::new(),
            records: DashMap::new(),
            block_entries: DashMap::new(),
            blocks_read: AtomicU64::new(0),
            entry_flushes: AtomicU64::new(0),
            backfill_requests: AtomicU64::new(0),
        }
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn bump(counter: &AtomicU64, limit: u64) -> Option<u64> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
    }

    /// Entry mapped to a block, if any.
    pub fn entry_for_block(&self, block: BlockNumber) -> Option<EntryNumber> {
        self.block_entries.get(&block).map(|e| *e)
    }

    /// Last flushed record of an entry.
    pub fn persisted_record(&self, entry: EntryNumber) -> Option<[u8; ENTRY_SIZE]> {
        self.records.get(&entry).map(|r| *r)
    }

    /// Every flushed record, ordered by entry number.
    pub fn persisted_records(&self) -> Vec<(EntryNumber, [u8; ENTRY_SIZE])> {
        let mut out: Vec<_> = self
            .records
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect();
        out.sort_by_key(|(nr, _)| *nr);
        out
    }

    /// Number of blocks currently holding data.
    pub fn blocks_used(&self) -> usize {
        self.blocks.len()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> MemStoreStats {
        MemStoreStats {
            blocks_written: self.next_block.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            entries_allocated: self.next_entry.load(Ordering::Relaxed),
            entry_flushes: self.entry_flushes.load(Ordering::Relaxed),
            backfill_requests: self.backfill_requests.load(Ordering::Relaxed),
        }
    }
}

impl BlockStore for MemStore {
    fn alloc_entry(&self) -> DedupResult<EntryNumber> {
        Self::bump(&self.next_entry, self.max_entries)
            .map(EntryNumber)
            .ok_or(DedupError::AllocationExhausted { resource: "entry" })
    }

    fn alloc_and_write_block(&self, data: &[u8]) -> DedupResult<BlockNumber> {
        if data.len() != self.block_size {
            return Err(DedupError::InvalidChunkSize {
                expected: self.block_size,
                actual: data.len(),
            });
        }
        let block = Self::bump(&self.next_block, self.max_blocks)
            .map(BlockNumber)
            .ok_or(DedupError::AllocationExhausted { resource: "block" })?;
        self.blocks.insert(block, data.to_vec());
        debug!(%block, "Mem store wrote block");
        Ok(block)
    }

    fn read_block(&self, block: BlockNumber) -> DedupResult<Vec<u8>> {
        let data = self
            .blocks
            .get(&block)
            .map(|d| d.clone())
            .ok_or(DedupError::BlockNotFound(block))?;
        self.blocks_read.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    fn flush_entry(&self, entry: EntryNumber, record: &[u8; ENTRY_SIZE]) {
        self.records.insert(entry, *record);
        self.entry_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_block_entry_mapping(&self, block: BlockNumber, entry: EntryNumber) {
        self.block_entries.insert(block, entry);
    }

    fn schedule_fingerprint_backfill(&self) {
        self.backfill_requests.fetch_add(1, Ordering::Relaxed);
        debug!("Fingerprint backfill requested");
    }
}
