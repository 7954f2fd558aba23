//! The dedup write path: mode selection, dispatch to a finalization
//! algorithm, and index rebuild from persisted entries.

use std::sync::Arc;

use tracing::{debug, info, instrument, Span};

use crate::config::DedupConfig;
use crate::controller::{DedupMode, ModeController, WindowClose, WindowSnapshot};
use crate::entry::{EntryFlag, EntryTable, MetaEntry, ENTRY_SIZE};
use crate::error::{DedupError, DedupResult};
use crate::finalize::{non_fin, str_fin, weak_str_fin, DedupWrite, FinalizeCtx};
use crate::index::FingerprintIndex;
use crate::metrics::{DedupMetric, MetricsHandle, MetricsSnapshot};
use crate::store::BlockStore;
use crate::types::EntryNumber;

/// Inline deduplication engine over a [`BlockStore`].
///
/// Shared by reference between writer threads; every method takes `&self`.
pub struct DedupEngine<S: BlockStore> {
    config: DedupConfig,
    store: Arc<S>,
    entries: EntryTable,
    index: FingerprintIndex,
    controller: ModeController,
    metrics: MetricsHandle,
}

impl<S: BlockStore> DedupEngine<S> {
    /// Create an engine with empty tables.
    pub fn new(config: DedupConfig, store: Arc<S>) -> DedupResult<Self> {
        config.validate()?;
        Ok(Self {
            entries: EntryTable::new(config.max_entries),
            index: FingerprintIndex::new(config.num_entries_bits, config.lock_count),
            controller: ModeController::new(&config),
            metrics: MetricsHandle::new(),
            config,
            store,
        })
    }

    /// Rebuild an engine from persisted entry records.
    ///
    /// Every record is restored into the entry table. Live WeakOnly and
    /// Strong entries get a weak index node, live Strong entries also get a
    /// strong node. NonFin entries are restored but stay unindexed until the
    /// store backfills their fingerprints.
    pub fn recover<I>(config: DedupConfig, store: Arc<S>, records: I) -> DedupResult<Self>
    where
        I: IntoIterator<Item = (EntryNumber, [u8; ENTRY_SIZE])>,
    {
        let engine = Self::new(config, store)?;
        let mut restored = 0u64;
        let mut weak_nodes = 0u64;
        let mut strong_nodes = 0u64;

        for (nr, record) in records {
            let entry = MetaEntry::decode(&record)?;
            engine.entries.install(nr, entry)?;
            restored += 1;
            if !entry.is_live() {
                continue;
            }
            match entry.flag {
                EntryFlag::NonFin => {}
                EntryFlag::WeakOnly => {
                    engine.index.lock_weak(&entry.weak_fp).insert(nr);
                    weak_nodes += 1;
                }
                EntryFlag::Strong => {
                    engine.index.lock_weak(&entry.weak_fp).insert(nr);
                    engine.index.lock_strong(&entry.strong_fp).insert(nr);
                    weak_nodes += 1;
                    strong_nodes += 1;
                }
            }
        }

        info!(restored, weak_nodes, strong_nodes, "Rebuilt dedup index from persisted entries");
        Ok(engine)
    }

    /// Deduplicate one chunk and store it if it is new.
    ///
    /// `data` must be exactly `chunk_size` bytes. Returns the block holding
    /// the content and whether a new block was consumed.
    #[instrument(skip_all, fields(mode))]
    pub fn dedup_write(&self, data: &[u8]) -> DedupResult<DedupWrite> {
        if data.len() != self.config.chunk_size {
            return Err(DedupError::InvalidChunkSize {
                expected: self.config.chunk_size,
                actual: data.len(),
            });
        }

        let decision = self.controller.begin_write()?;
        if let Some(closed) = decision.closed {
            self.on_window_close(closed);
        }
        Span::current().record("mode", decision.mode.as_str());

        let ctx = self.ctx();
        let outcome = match decision.mode {
            DedupMode::NonFin => non_fin::finalize(&ctx, data)?,
            DedupMode::WeakStrFin => weak_str_fin::finalize(&ctx, data)?,
            DedupMode::StrFin => str_fin::finalize(&ctx, data)?,
        };

        if outcome.is_dedup_hit() && !self.controller.record_hit(decision.epoch) {
            debug!(epoch = decision.epoch, "Hit landed after its window closed");
        }
        self.metrics
            .as_ref()
            .record_write(decision.mode, outcome.blocks_allocated);
        debug!(block = %outcome.block, entry = %outcome.entry, allocated = outcome.blocks_allocated, "Dedup write done");
        Ok(outcome)
    }

    fn on_window_close(&self, closed: WindowClose) {
        let metrics = self.metrics.as_ref();
        if closed.needs_backfill() {
            self.store.schedule_fingerprint_backfill();
            metrics.record_backfill();
        }
        if closed.next != closed.outgoing {
            metrics.record_mode_switch();
            info!(
                from = %closed.outgoing,
                to = %closed.next,
                dup_blocks = closed.dup_blocks,
                "Dedup mode switched"
            );
        } else {
            debug!(mode = %closed.next, dup_blocks = closed.dup_blocks, "Sampling window closed");
        }
    }

    fn ctx(&self) -> FinalizeCtx<'_, S> {
        FinalizeCtx {
            entries: &self.entries,
            index: &self.index,
            store: &self.store,
            metrics: self.metrics.as_ref(),
        }
    }

    /// Current state of an entry.
    pub fn entry(&self, nr: EntryNumber) -> DedupResult<MetaEntry> {
        self.entries.get(nr)
    }

    /// Number of entries with a non-zero refcount.
    pub fn live_entries(&self) -> usize {
        self.entries.live_count()
    }

    /// Mode the next write runs under unless it closes a window.
    pub fn mode(&self) -> DedupResult<DedupMode> {
        self.controller.mode()
    }

    /// Pin the current mode until the open sampling window closes.
    pub fn force_mode(&self, mode: DedupMode) {
        info!(%mode, "Dedup mode forced");
        self.controller.force_mode(mode);
    }

    /// Sampling window state.
    pub fn window(&self) -> DedupResult<WindowSnapshot> {
        self.controller.snapshot()
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Metrics with Prometheus names and help text.
    pub fn collect_metrics(&self) -> Vec<DedupMetric> {
        self.metrics.as_ref().collect()
    }

    /// Shareable handle to the engine's counters.
    pub fn metrics_handle(&self) -> MetricsHandle {
        self.metrics.clone()
    }

    /// The underlying block store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The fingerprint index.
    pub fn index(&self) -> &FingerprintIndex {
        &self.index
    }

    /// The engine configuration.
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }
}
