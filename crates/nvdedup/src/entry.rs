//! Metadata entries: one persistent record per physically stored unique block.
//!
//! The on-disk record is a fixed 64-byte little-endian layout:
//!
//! | offset | width | field      |
//! |--------|-------|------------|
//! | 0      | 1     | flag       |
//! | 1      | 7     | reserved   |
//! | 8      | 8     | block_nr   |
//! | 16     | 4     | refcount   |
//! | 20     | 4     | weak_fp    |
//! | 24     | 32    | strong_fp  |
//! | 56     | 8     | reserved   |

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{DedupError, DedupResult};
use crate::fingerprint::{StrongFp, WeakFp};
use crate::types::{BlockNumber, EntryNumber};

/// Size in bytes of one persisted entry record.
pub const ENTRY_SIZE: usize = 64;

const FLAG_OFFSET: usize = 0;
const BLOCK_OFFSET: usize = 8;
const REFCOUNT_OFFSET: usize = 16;
const WEAK_OFFSET: usize = 20;
const STRONG_OFFSET: usize = 24;

/// Which fingerprints of an entry are valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryFlag {
    /// Only the weak fingerprint is valid; the block content is canonical.
    WeakOnly = 1,
    /// Both fingerprints are valid.
    Strong = 2,
    /// Written without fingerprints.
    #[default]
    NonFin = 3,
}

impl EntryFlag {
    /// On-disk flag code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for EntryFlag {
    type Error = DedupError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(EntryFlag::WeakOnly),
            2 => Ok(EntryFlag::Strong),
            3 => Ok(EntryFlag::NonFin),
            other => Err(DedupError::CorruptEntry(format!(
                "unknown flag code {}",
                other
            ))),
        }
    }
}

/// A metadata entry describing one stored unique block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    /// Which fingerprint fields are meaningful.
    pub flag: EntryFlag,
    /// Block holding the content.
    pub block_nr: BlockNumber,
    /// Number of live references; 0 means the slot is vacant.
    pub refcount: u32,
    /// Weak fingerprint of the content.
    pub weak_fp: WeakFp,
    /// Strong fingerprint; meaningful only when `flag == Strong`.
    pub strong_fp: StrongFp,
}

impl MetaEntry {
    /// Fresh entry for a block written without fingerprints.
    pub fn non_fin(block_nr: BlockNumber) -> Self {
        Self {
            flag: EntryFlag::NonFin,
            block_nr,
            refcount: 1,
            weak_fp: WeakFp::default(),
            strong_fp: StrongFp::default(),
        }
    }

    /// Fresh entry carrying only a weak fingerprint.
    pub fn weak_only(block_nr: BlockNumber, weak_fp: WeakFp) -> Self {
        Self {
            flag: EntryFlag::WeakOnly,
            block_nr,
            refcount: 1,
            weak_fp,
            strong_fp: StrongFp::default(),
        }
    }

    /// Fresh entry carrying both fingerprints.
    pub fn strong(block_nr: BlockNumber, weak_fp: WeakFp, strong_fp: StrongFp) -> Self {
        Self {
            flag: EntryFlag::Strong,
            block_nr,
            refcount: 1,
            weak_fp,
            strong_fp,
        }
    }

    /// True while some block mapping references this entry.
    pub fn is_live(&self) -> bool {
        self.refcount > 0
    }

    /// Cached strong fingerprint, if valid.
    pub fn cached_strong(&self) -> Option<StrongFp> {
        match self.flag {
            EntryFlag::Strong => Some(self.strong_fp),
            EntryFlag::WeakOnly | EntryFlag::NonFin => None,
        }
    }

    /// Encode into the stable on-disk record.
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[FLAG_OFFSET] = self.flag.code();
        buf[BLOCK_OFFSET..BLOCK_OFFSET + 8].copy_from_slice(&self.block_nr.0.to_le_bytes());
        buf[REFCOUNT_OFFSET..REFCOUNT_OFFSET + 4].copy_from_slice(&self.refcount.to_le_bytes());
        buf[WEAK_OFFSET..WEAK_OFFSET + 4].copy_from_slice(&self.weak_fp.0.to_le_bytes());
        buf[STRONG_OFFSET..STRONG_OFFSET + 32].copy_from_slice(&self.strong_fp.to_bytes());
        buf
    }

    /// Decode an on-disk record.
    pub fn decode(buf: &[u8]) -> DedupResult<Self> {
        if buf.len() < ENTRY_SIZE {
            return Err(DedupError::CorruptEntry(format!(
                "record too short: {} bytes, expected {}",
                buf.len(),
                ENTRY_SIZE
            )));
        }
        let flag = EntryFlag::try_from(buf[FLAG_OFFSET])?;
        let block_nr = u64::from_le_bytes(read_array(buf, BLOCK_OFFSET));
        let refcount = u32::from_le_bytes(read_array(buf, REFCOUNT_OFFSET));
        let weak = u32::from_le_bytes(read_array(buf, WEAK_OFFSET));
        let strong = StrongFp::from_bytes(&read_array(buf, STRONG_OFFSET));
        Ok(Self {
            flag,
            block_nr: BlockNumber(block_nr),
            refcount,
            weak_fp: WeakFp(weak),
            strong_fp: strong,
        })
    }
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

/// Densely indexed arena of metadata entries.
///
/// Slots are created lazily up to `capacity`. Each slot has its own mutex so
/// reads and in-place updates are memory safe; the fingerprint bucket locks
/// still serialize the dedup decisions that span several reads and writes.
pub struct EntryTable {
    capacity: u64,
    slots: RwLock<Vec<Mutex<MetaEntry>>>,
}

impl EntryTable {
    /// Create an empty table with room for `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn check(&self, nr: EntryNumber) -> DedupResult<usize> {
        if nr.0 >= self.capacity {
            return Err(DedupError::EntryOutOfRange {
                entry: nr,
                capacity: self.capacity,
            });
        }
        Ok(nr.0 as usize)
    }

    /// Snapshot of an entry. Never-installed slots read as vacant.
    pub fn get(&self, nr: EntryNumber) -> DedupResult<MetaEntry> {
        let idx = self.check(nr)?;
        let slots = self.slots.read();
        Ok(slots.get(idx).map(|slot| *slot.lock()).unwrap_or_default())
    }

    /// Overwrite a slot with a freshly populated entry.
    pub fn install(&self, nr: EntryNumber, entry: MetaEntry) -> DedupResult<()> {
        let idx = self.check(nr)?;
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(idx) {
                *slot.lock() = entry;
                return Ok(());
            }
        }
        let mut slots = self.slots.write();
        if slots.len() <= idx {
            slots.resize_with(idx + 1, || Mutex::new(MetaEntry::default()));
        }
        *slots[idx].lock() = entry;
        Ok(())
    }

    /// Mutate an installed entry in place and return the closure's result.
    pub fn update<R>(
        &self,
        nr: EntryNumber,
        f: impl FnOnce(&mut MetaEntry) -> R,
    ) -> DedupResult<R> {
        let idx = self.check(nr)?;
        let slots = self.slots.read();
        let slot = slots.get(idx).ok_or(DedupError::EntryOutOfRange {
            entry: nr,
            capacity: slots.len() as u64,
        })?;
        let mut entry = slot.lock();
        Ok(f(&mut entry))
    }

    /// Encoded on-disk record of an entry's current state.
    pub fn record(&self, nr: EntryNumber) -> DedupResult<[u8; ENTRY_SIZE]> {
        Ok(self.get(nr)?.encode())
    }

    /// Number of entries with a non-zero refcount.
    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.lock().is_live())
            .count()
    }
}
