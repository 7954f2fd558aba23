//! Adaptive selection of the finalization mode.
//!
//! Writes are counted in fixed windows of `sample_block` writes. When a
//! window closes, the number of duplicate hits seen in it picks the mode for
//! the next window: many hits favour Strong-First, some hits favour
//! Weak-then-Strong, and few hits flip a fair coin between NonFin and
//! Weak-then-Strong so rising duplication is still noticed.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::DedupConfig;
use crate::error::{DedupError, DedupResult};

/// Finalization algorithm applied to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DedupMode {
    /// No fingerprints; always allocate.
    NonFin = 1,
    /// Weak fingerprint first, strong fingerprint only on a weak match.
    WeakStrFin = 2,
    /// Both fingerprints on every write.
    StrFin = 3,
}

impl DedupMode {
    /// Stable numeric code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Short name used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            DedupMode::NonFin => "non_fin",
            DedupMode::WeakStrFin => "weak_str_fin",
            DedupMode::StrFin => "str_fin",
        }
    }
}

impl TryFrom<u8> for DedupMode {
    type Error = DedupError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(DedupMode::NonFin),
            2 => Ok(DedupMode::WeakStrFin),
            3 => Ok(DedupMode::StrFin),
            other => Err(DedupError::UnknownMode(other)),
        }
    }
}

impl fmt::Display for DedupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened when a sampling window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowClose {
    /// Mode that ran during the closed window.
    pub outgoing: DedupMode,
    /// Mode selected for the next window.
    pub next: DedupMode,
    /// Duplicate hits observed in the closed window.
    pub dup_blocks: u64,
}

impl WindowClose {
    /// Blocks written without fingerprints in the closed window need a backfill.
    pub fn needs_backfill(&self) -> bool {
        self.outgoing == DedupMode::NonFin
    }
}

/// Mode to run for one write, plus the window boundary it crossed, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDecision {
    /// Mode for this write.
    pub mode: DedupMode,
    /// Window the write was counted in; pass it back to [`ModeController::record_hit`].
    pub epoch: u32,
    /// Set on exactly one write per window.
    pub closed: Option<WindowClose>,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Current mode.
    pub mode: DedupMode,
    /// Writes counted in the open window.
    pub cur_block: u64,
    /// Duplicate hits counted in the open window.
    pub dup_block: u64,
    /// Sequence number of the open window.
    pub epoch: u32,
}

struct Window {
    mode: u8,
    cur_block: u64,
    epoch: u32,
    rng: StdRng,
}

/// `dup_block` packs the open window's epoch in the high half and its hit
/// count in the low half, so a hit and a window close cannot interleave.
fn pack(epoch: u32, hits: u32) -> u64 {
    (u64::from(epoch) << 32) | u64::from(hits)
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Sampling controller shared by all writers of an engine.
pub struct ModeController {
    sample_block: u64,
    str_fin_thresh: u64,
    non_fin_thresh: u64,
    window: Mutex<Window>,
    dup_block: AtomicU64,
}

impl ModeController {
    /// Create a controller from the engine configuration.
    pub fn new(config: &DedupConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            sample_block: config.sample_block,
            str_fin_thresh: config.str_fin_thresh,
            non_fin_thresh: config.non_fin_thresh,
            window: Mutex::new(Window {
                mode: config.initial_mode.code(),
                cur_block: 0,
                epoch: 0,
                rng,
            }),
            dup_block: AtomicU64::new(0),
        }
    }

    /// Count a write and return the mode it must run under.
    ///
    /// The write that fills the window closes it: the duplicate counter is
    /// drained, the next mode is chosen and applies to that write already.
    /// Counting, draining and switching happen under one lock, so each
    /// window closes exactly once.
    pub fn begin_write(&self) -> DedupResult<ModeDecision> {
        let mut window = self.window.lock();
        window.cur_block += 1;
        let mut closed = None;
        if window.cur_block >= self.sample_block {
            let outgoing = DedupMode::try_from(window.mode)?;
            window.epoch = window.epoch.wrapping_add(1);
            let (_, hits) = unpack(self.dup_block.swap(pack(window.epoch, 0), Ordering::AcqRel));
            let dup_blocks = u64::from(hits);
            let next = self.select_next(dup_blocks, &mut window.rng);
            window.mode = next.code();
            window.cur_block = 0;
            closed = Some(WindowClose {
                outgoing,
                next,
                dup_blocks,
            });
        }
        let mode = DedupMode::try_from(window.mode)?;
        Ok(ModeDecision {
            mode,
            epoch: window.epoch,
            closed,
        })
    }

    /// Count a duplicate hit for a write begun in window `epoch`. Hits that
    /// land after their window closed are dropped, never carried into the
    /// next window. Returns whether the hit was counted.
    pub fn record_hit(&self, epoch: u32) -> bool {
        self.dup_block
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (open, hits) = unpack(word);
                (open == epoch).then(|| pack(open, hits.saturating_add(1)))
            })
            .is_ok()
    }

    fn select_next(&self, dup_blocks: u64, rng: &mut StdRng) -> DedupMode {
        if dup_blocks > self.str_fin_thresh {
            DedupMode::StrFin
        } else if dup_blocks > self.non_fin_thresh {
            DedupMode::WeakStrFin
        } else if rng.gen::<bool>() {
            DedupMode::NonFin
        } else {
            DedupMode::WeakStrFin
        }
    }

    /// Mode that the next write will run under unless it closes the window.
    pub fn mode(&self) -> DedupResult<DedupMode> {
        DedupMode::try_from(self.window.lock().mode)
    }

    /// Pin the current mode. Adaptation resumes when the window closes.
    pub fn force_mode(&self, mode: DedupMode) {
        self.window.lock().mode = mode.code();
    }

    /// Current mode and counters.
    pub fn snapshot(&self) -> DedupResult<WindowSnapshot> {
        let window = self.window.lock();
        Ok(WindowSnapshot {
            mode: DedupMode::try_from(window.mode)?,
            epoch: window.epoch,
            cur_block: window.cur_block,
            dup_block: u64::from(unpack(self.dup_block.load(Ordering::Relaxed)).1),
        })
    }

    #[cfg(test)]
    pub(crate) fn set_raw_mode(&self, code: u8) {
        self.window.lock().mode = code;
    }
}
