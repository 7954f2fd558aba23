//! NonFin finalization: store every chunk in a new block without fingerprinting it.

use tracing::debug;

use super::{DedupWrite, FinalizeCtx};
use crate::entry::MetaEntry;
use crate::error::DedupResult;
use crate::store::BlockStore;

/// Allocate a new entry and block for `data`. Touches no index.
pub fn finalize<S: BlockStore + ?Sized>(
    ctx: &FinalizeCtx<'_, S>,
    data: &[u8],
) -> DedupResult<DedupWrite> {
    let (entry, block) = ctx.allocate(data, MetaEntry::non_fin)?;
    ctx.flush(entry)?;
    debug!(%entry, %block, "NonFin write stored");
    Ok(DedupWrite::allocated(block, entry))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::entry::EntryFlag;

    #[test]
    fn test_identical_writes_never_dedup() {
        let h = Harness::new();
        let ctx = h.ctx();
        let data = chunk(0x11);
        let writes: Vec<_> = (0..4).map(|_| finalize(&ctx, &data).unwrap()).collect();

        for w in &writes {
            assert_eq!(w.blocks_allocated, 1);
            let entry = h.entry(w.entry);
            assert_eq!(entry.flag, EntryFlag::NonFin);
            assert_eq!(entry.refcount, 1);
        }
        let mut blocks: Vec<_> = writes.iter().map(|w| w.block).collect();
        blocks.dedup();
        assert_eq!(blocks.len(), 4);
    }

    #[test]
    fn test_index_untouched_and_entry_flushed() {
        let h = Harness::new();
        let w = finalize(&h.ctx(), &chunk(3)).unwrap();
        assert_eq!(h.index.weak().node_count(), 0);
        assert_eq!(h.index.strong().node_count(), 0);
        assert_eq!(h.store.persisted_record(w.entry), Some(h.entry(w.entry).encode()));
        assert_eq!(h.store.entry_for_block(w.block), Some(w.entry));
    }

    #[test]
    fn test_exhaustion_propagates() {
        let h = Harness::with_capacity(1, 8);
        finalize(&h.ctx(), &chunk(1)).unwrap();
        assert!(finalize(&h.ctx(), &chunk(2)).is_err());
    }
}
