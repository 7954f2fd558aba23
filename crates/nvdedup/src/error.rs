//! Error types for the dedup engine.

use thiserror::Error;

use crate::types::{BlockNumber, EntryNumber};

/// Result type alias for dedup operations.
pub type DedupResult<T> = Result<T, DedupError>;

/// All errors that can occur on the dedup write path.
#[derive(Debug, Error)]
pub enum DedupError {
    /// The block store or the entry table has no free space left.
    #[error("Allocation exhausted: no free {resource} available")]
    AllocationExhausted {
        /// Which allocator ran dry ("block" or "entry").
        resource: &'static str,
    },

    /// The controller holds a mode code that is not a known finalization mode.
    #[error("Unknown dedup mode code: {0}")]
    UnknownMode(u8),

    /// Incoming data does not match the configured chunk size.
    #[error("Invalid chunk size: expected {expected} bytes, got {actual}")]
    InvalidChunkSize {
        /// Configured chunk size in bytes.
        expected: usize,
        /// Length of the data handed to the write path.
        actual: usize,
    },

    /// A block was read back that was never written.
    #[error("Block not found: {0}")]
    BlockNotFound(BlockNumber),

    /// An entry number lies outside the entry table.
    #[error("Entry {entry} out of range (capacity {capacity})")]
    EntryOutOfRange {
        /// The offending entry number.
        entry: EntryNumber,
        /// Number of slots in the entry table.
        capacity: u64,
    },

    /// A persisted entry record failed to decode.
    #[error("Corrupt metadata entry: {0}")]
    CorruptEntry(String),

    /// Configuration is invalid or could not be parsed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
