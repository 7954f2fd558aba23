//! Strong-First finalization.
//!
//! Both fingerprints are computed for every chunk so a weak fingerprint is
//! never missed while duplication is high. The strong table is consulted
//! first; a weak match is only trusted after recomputing the matched block's
//! strong fingerprint.

use tracing::debug;

use super::{DedupWrite, FinalizeCtx};
use crate::entry::{EntryFlag, MetaEntry};
use crate::error::DedupResult;
use crate::fingerprint::{strong_fingerprint, weak_fingerprint};
use crate::store::BlockStore;

/// Finalize `data` with both fingerprints, holding the weak bucket lock and
/// then the strong bucket lock for the whole decision.
pub fn finalize<S: BlockStore + ?Sized>(
    ctx: &FinalizeCtx<'_, S>,
    data: &[u8],
) -> DedupResult<DedupWrite> {
    let weak_fp = weak_fingerprint(data);
    let strong_fp = strong_fingerprint(data);

    let mut weak_bucket = ctx.index.lock_weak(&weak_fp);
    let weak_hit = weak_bucket.find(&weak_fp, ctx.entries)?;
    let mut strong_bucket = ctx.index.lock_strong(&strong_fp);

    let outcome = if let Some(nr) = strong_bucket.find(&strong_fp, ctx.entries)? {
        let block = ctx.entries.update(nr, |e| {
            e.refcount = e.refcount.saturating_add(1);
            e.weak_fp = weak_fp;
            e.flag = EntryFlag::Strong;
            e.block_nr
        })?;
        ctx.flush(nr)?;
        debug!(entry = %nr, %block, "Strong fingerprint hit");
        DedupWrite::hit(block, nr)
    } else if let Some(candidate) = weak_hit {
        let matched = ctx.entries.get(candidate)?;
        let content = ctx.store.read_block(matched.block_nr)?;
        if strong_fingerprint(&content) == strong_fp {
            let block = ctx.entries.update(candidate, |e| {
                e.strong_fp = strong_fp;
                e.refcount = e.refcount.saturating_add(1);
                e.flag = EntryFlag::Strong;
                e.block_nr
            })?;
            ctx.flush(candidate)?;
            strong_bucket.insert(candidate);
            debug!(entry = %candidate, %block, "Weak hit confirmed by strong fingerprint");
            DedupWrite::hit(block, candidate)
        } else {
            ctx.metrics.record_weak_collision();
            debug!(entry = %candidate, weak = %weak_fp, "Weak fingerprint collision");
            let (entry, block) =
                ctx.allocate(data, |b| MetaEntry::strong(b, weak_fp, strong_fp))?;
            ctx.flush(entry)?;
            strong_bucket.insert(entry);
            DedupWrite::allocated(block, entry)
        }
    } else {
        let (entry, block) = ctx.allocate(data, |b| MetaEntry::strong(b, weak_fp, strong_fp))?;
        ctx.flush(entry)?;
        strong_bucket.insert(entry);
        DedupWrite::allocated(block, entry)
    };

    // converge future weak lookups on the canonical entry
    if weak_hit.is_none() {
        weak_bucket.insert(outcome.entry);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::fingerprint::WeakFp;

    #[test]
    fn test_zero_then_ones_scenario() {
        let h = Harness::new();
        let ctx = h.ctx();
        let a = chunk(0x00);
        let b = chunk(0xFF);

        let first = finalize(&ctx, &a).unwrap();
        assert_eq!(first.blocks_allocated, 1);
        assert_eq!(h.entry(first.entry).refcount, 1);

        let second = finalize(&ctx, &a).unwrap();
        assert_eq!(second.block, first.block);
        assert_eq!(second.blocks_allocated, 0);
        assert_eq!(h.entry(first.entry).refcount, 2);

        let third = finalize(&ctx, &b).unwrap();
        assert_ne!(third.block, first.block);
        assert_eq!(third.blocks_allocated, 1);
    }

    #[test]
    fn test_new_entry_fully_populated_and_indexed() {
        let h = Harness::new();
        let data = chunk(7);
        let w = finalize(&h.ctx(), &data).unwrap();
        let entry = h.entry(w.entry);
        assert_eq!(entry.flag, EntryFlag::Strong);
        assert_eq!(entry.weak_fp, weak_fingerprint(&data));
        assert_eq!(entry.strong_fp, strong_fingerprint(&data));
        assert_eq!(entry.block_nr, w.block);
        assert_eq!(h.index.weak().node_count(), 1);
        assert_eq!(h.index.strong().node_count(), 1);
        assert_eq!(h.store.persisted_record(w.entry), Some(entry.encode()));
    }

    #[test]
    fn test_strong_hit_adds_no_nodes() {
        let h = Harness::new();
        let data = chunk(9);
        finalize(&h.ctx(), &data).unwrap();
        finalize(&h.ctx(), &data).unwrap();
        finalize(&h.ctx(), &data).unwrap();
        assert_eq!(h.index.weak().node_count(), 1);
        assert_eq!(h.index.strong().node_count(), 1);
    }

    #[test]
    fn test_weak_only_entry_confirmed_and_upgraded() {
        let h = Harness::new();
        let ctx = h.ctx();
        let data = chunk(5);
        let weak_fp = weak_fingerprint(&data);
        let (entry, block) = ctx
            .allocate(&data, |b| MetaEntry::weak_only(b, weak_fp))
            .unwrap();
        h.index.lock_weak(&weak_fp).insert(entry);

        let w = finalize(&ctx, &data).unwrap();
        assert!(w.is_dedup_hit());
        assert_eq!(w.block, block);
        let upgraded = h.entry(entry);
        assert_eq!(upgraded.flag, EntryFlag::Strong);
        assert_eq!(upgraded.strong_fp, strong_fingerprint(&data));
        assert_eq!(upgraded.refcount, 2);
        assert_eq!(h.index.strong().node_count(), 1);
        // a weak node already existed
        assert_eq!(h.index.weak().node_count(), 1);
        assert_eq!(h.store.stats().blocks_read, 1);
    }

    #[test]
    fn test_weak_collision_allocates_separate_entry() {
        let h = Harness::new();
        let ctx = h.ctx();
        let original = chunk(0);
        let forged = forge_weak_collision(&original, 0xAB);

        let a = finalize(&ctx, &original).unwrap();
        let b = finalize(&ctx, &forged).unwrap();

        assert_eq!(b.blocks_allocated, 1);
        assert_ne!(a.block, b.block);
        assert_ne!(a.entry, b.entry);
        let ea = h.entry(a.entry);
        let eb = h.entry(b.entry);
        assert_eq!(ea.weak_fp, eb.weak_fp);
        assert_ne!(ea.strong_fp, eb.strong_fp);
        assert_eq!(ea.refcount, 1);
        assert_eq!(eb.refcount, 1);
        assert_eq!(h.metrics.snapshot().weak_collisions, 1);
        assert_eq!(h.store.read_block(a.block).unwrap(), original);
        assert_eq!(h.store.read_block(b.block).unwrap(), forged);

        // both contents still dedup against their own entries
        assert_eq!(finalize(&ctx, &forged).unwrap().block, b.block);
        assert_eq!(finalize(&ctx, &original).unwrap().block, a.block);
    }

    #[test]
    fn test_strong_hit_refreshes_weak_fp() {
        let h = Harness::new();
        let ctx = h.ctx();
        let data = chunk(4);
        let w = finalize(&ctx, &data).unwrap();
        ctx.entries.update(w.entry, |e| e.weak_fp = WeakFp(0)).unwrap();

        finalize(&ctx, &data).unwrap();
        assert_eq!(h.entry(w.entry).weak_fp, weak_fingerprint(&data));
    }
}
