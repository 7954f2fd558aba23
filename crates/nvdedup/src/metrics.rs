//! Prometheus-compatible counters for the dedup write path.
//!
//! All counters are `AtomicU64` updated with `Ordering::Relaxed`; they are
//! statistics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::controller::DedupMode;

/// The type of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up or down.
    Gauge,
}

/// The value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A counter value.
    Counter(u64),
    /// A gauge value.
    Gauge(f64),
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// The kind of metric.
    pub kind: MetricKind,
    /// The metric value.
    pub value: MetricValue,
}

/// Thread-safe counters for the dedup engine.
#[derive(Default)]
pub struct DedupMetrics {
    writes: AtomicU64,
    non_fin_writes: AtomicU64,
    weak_str_fin_writes: AtomicU64,
    str_fin_writes: AtomicU64,
    dedup_hits: AtomicU64,
    blocks_allocated: AtomicU64,
    weak_collisions: AtomicU64,
    strong_upgrades: AtomicU64,
    mode_switches: AtomicU64,
    backfill_signals: AtomicU64,
}

impl DedupMetrics {
    /// Create metrics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished write in `mode`.
    #[inline]
    pub fn record_write(&self, mode: DedupMode, blocks_allocated: u32) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let per_mode = match mode {
            DedupMode::NonFin => &self.non_fin_writes,
            DedupMode::WeakStrFin => &self.weak_str_fin_writes,
            DedupMode::StrFin => &self.str_fin_writes,
        };
        per_mode.fetch_add(1, Ordering::Relaxed);
        if blocks_allocated == 0 {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocks_allocated
                .fetch_add(blocks_allocated as u64, Ordering::Relaxed);
        }
    }

    /// Record a weak match whose strong fingerprint differed.
    #[inline]
    pub fn record_weak_collision(&self) {
        self.weak_collisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a WeakOnly entry upgraded to Strong.
    #[inline]
    pub fn record_strong_upgrade(&self) {
        self.strong_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a window close that changed the mode.
    #[inline]
    pub fn record_mode_switch(&self) {
        self.mode_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fingerprint backfill request.
    #[inline]
    pub fn record_backfill(&self) {
        self.backfill_signals.fetch_add(1, Ordering::Relaxed);
    }

    /// Share of writes that were dedup hits. 0.0 before any write.
    pub fn dedup_ratio(&self) -> f64 {
        let writes = self.writes.load(Ordering::Relaxed);
        if writes == 0 {
            0.0
        } else {
            self.dedup_hits.load(Ordering::Relaxed) as f64 / writes as f64
        }
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            non_fin_writes: self.non_fin_writes.load(Ordering::Relaxed),
            weak_str_fin_writes: self.weak_str_fin_writes.load(Ordering::Relaxed),
            str_fin_writes: self.str_fin_writes.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            weak_collisions: self.weak_collisions.load(Ordering::Relaxed),
            strong_upgrades: self.strong_upgrades.load(Ordering::Relaxed),
            mode_switches: self.mode_switches.load(Ordering::Relaxed),
            backfill_signals: self.backfill_signals.load(Ordering::Relaxed),
            dedup_ratio: self.dedup_ratio(),
        }
    }

    /// Collect all metrics with Prometheus names and help text.
    pub fn collect(&self) -> Vec<DedupMetric> {
        let snap = self.snapshot();
        let counter = |name: &str, help: &str, value: u64| DedupMetric {
            name: format!("nvdedup_{}", name),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(value),
        };
        vec![
            counter("writes_total", "Total chunks written through the dedup engine", snap.writes),
            counter("non_fin_writes_total", "Writes finalized without fingerprints", snap.non_fin_writes),
            counter(
                "weak_str_fin_writes_total",
                "Writes finalized weak fingerprint first",
                snap.weak_str_fin_writes,
            ),
            counter("str_fin_writes_total", "Writes finalized strong fingerprint first", snap.str_fin_writes),
            counter("dedup_hits_total", "Writes that reused an existing block", snap.dedup_hits),
            counter("blocks_allocated_total", "Blocks allocated for unique content", snap.blocks_allocated),
            counter(
                "weak_collisions_total",
                "Weak fingerprint matches with different content",
                snap.weak_collisions,
            ),
            counter("strong_upgrades_total", "Weak-only entries upgraded to strong", snap.strong_upgrades),
            counter("mode_switches_total", "Sampling windows that changed the mode", snap.mode_switches),
            counter("backfill_signals_total", "Fingerprint backfill requests sent", snap.backfill_signals),
            DedupMetric {
                name: "nvdedup_dedup_ratio".to_string(),
                help: "Dedup hit ratio (hits / writes)".to_string(),
                kind: MetricKind::Gauge,
                value: MetricValue::Gauge(snap.dedup_ratio),
            },
        ]
    }
}

/// A shareable handle to [`DedupMetrics`].
#[derive(Clone, Default)]
pub struct MetricsHandle {
    inner: Arc<DedupMetrics>,
}

impl MetricsHandle {
    /// Create a handle with fresh metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying metrics.
    pub fn metrics(&self) -> Arc<DedupMetrics> {
        Arc::clone(&self.inner)
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.snapshot()
    }
}

impl AsRef<DedupMetrics> for MetricsHandle {
    fn as_ref(&self) -> &DedupMetrics {
        &self.inner
    }
}

/// A point-in-time snapshot of all dedup metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total writes.
    pub writes: u64,
    /// Writes run under NonFin.
    pub non_fin_writes: u64,
    /// Writes run under WeakStrFin.
    pub weak_str_fin_writes: u64,
    /// Writes run under StrFin.
    pub str_fin_writes: u64,
    /// Dedup hits.
    pub dedup_hits: u64,
    /// Blocks allocated.
    pub blocks_allocated: u64,
    /// Weak fingerprint collisions.
    pub weak_collisions: u64,
    /// WeakOnly→Strong upgrades.
    pub strong_upgrades: u64,
    /// Mode switches.
    pub mode_switches: u64,
    /// Backfill requests.
    pub backfill_signals: u64,
    /// Dedup hit ratio.
    pub dedup_ratio: f64,
}
