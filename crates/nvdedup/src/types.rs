//! Identifier newtypes shared across the dedup engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical block number in the underlying block store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Creates a new block number.
    pub fn new(nr: u64) -> Self {
        Self(nr)
    }

    /// Returns the raw block number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk#{}", self.0)
    }
}

/// Slot number of a metadata entry in the persistent entry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryNumber(pub u64);

impl EntryNumber {
    /// Creates a new entry number.
    pub fn new(nr: u64) -> Self {
        Self(nr)
    }

    /// Returns the raw entry number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ent#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(BlockNumber::new(42).to_string(), "blk#42");
        assert_eq!(EntryNumber::new(7).to_string(), "ent#7");
    }

    #[test]
    fn test_ordering() {
        assert!(BlockNumber(1) < BlockNumber(2));
        assert_eq!(EntryNumber(3).as_u64(), 3);
    }
}
