#![warn(missing_docs)]

//! Inline block deduplication with adaptive fingerprinting.
//!
//! Write path: chunk → mode controller → NonFin | Weak-then-Strong | Strong-First → block store
//!
//! Weak fingerprints (CRC-32) filter duplicate candidates cheaply; strong
//! fingerprints (BLAKE3) confirm them. The controller samples the duplicate
//! rate per window and picks how much fingerprinting the next window pays for.

pub mod config;
pub mod controller;
pub mod engine;
pub mod entry;
pub mod error;
pub mod finalize;
pub mod fingerprint;
pub mod index;
pub mod metrics;
pub mod store;
pub mod types;

pub use config::DedupConfig;
pub use controller::{DedupMode, ModeController, ModeDecision, WindowClose, WindowSnapshot};
pub use engine::DedupEngine;
pub use entry::{EntryFlag, EntryTable, MetaEntry, ENTRY_SIZE};
pub use error::{DedupError, DedupResult};
pub use finalize::DedupWrite;
pub use fingerprint::{strong_fingerprint, weak_fingerprint, StrongFp, WeakFp};
pub use index::{BucketGuard, FingerprintIndex, FingerprintTable};
pub use metrics::{DedupMetric, DedupMetrics, MetricKind, MetricValue, MetricsHandle, MetricsSnapshot};
pub use store::{BlockStore, MemStore, MemStoreStats};
pub use types::{BlockNumber, EntryNumber};
