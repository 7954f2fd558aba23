//! Weak-then-Strong finalization.
//!
//! Only the weak fingerprint is computed up front. The strong fingerprint is
//! computed when a weak match needs confirming, and a WeakOnly entry gets its
//! strong fingerprint from the stored block the first time it is matched.

use tracing::debug;

use super::{DedupWrite, FinalizeCtx};
use crate::entry::{EntryFlag, MetaEntry};
use crate::error::DedupResult;
use crate::fingerprint::{strong_fingerprint, weak_fingerprint, StrongFp};
use crate::store::BlockStore;
use crate::types::EntryNumber;

/// Finalize `data` weak fingerprint first. The weak bucket stays locked for
/// the whole decision; strong buckets are locked inside it.
pub fn finalize<S: BlockStore + ?Sized>(
    ctx: &FinalizeCtx<'_, S>,
    data: &[u8],
) -> DedupResult<DedupWrite> {
    let weak_fp = weak_fingerprint(data);
    let mut weak_bucket = ctx.index.lock_weak(&weak_fp);

    let Some(candidate) = weak_bucket.find(&weak_fp, ctx.entries)? else {
        let (entry, block) = ctx.allocate(data, |b| MetaEntry::weak_only(b, weak_fp))?;
        ctx.flush(entry)?;
        weak_bucket.insert(entry);
        return Ok(DedupWrite::allocated(block, entry));
    };

    let reference = reference_strong(ctx, candidate)?;
    let strong_fp = strong_fingerprint(data);

    if strong_fp == reference {
        let block = ctx.add_ref(candidate)?;
        ctx.flush(candidate)?;
        debug!(entry = %candidate, %block, "Weak hit confirmed by strong fingerprint");
        return Ok(DedupWrite::hit(block, candidate));
    }

    ctx.metrics.record_weak_collision();
    debug!(entry = %candidate, weak = %weak_fp, "Weak fingerprint collision");
    let mut strong_bucket = ctx.index.lock_strong(&strong_fp);
    match strong_bucket.find(&strong_fp, ctx.entries)? {
        Some(nr) => {
            let block = ctx.add_ref(nr)?;
            ctx.flush(nr)?;
            debug!(entry = %nr, %block, "Strong fingerprint hit");
            Ok(DedupWrite::hit(block, nr))
        }
        None => {
            let (entry, block) =
                ctx.allocate(data, |b| MetaEntry::strong(b, weak_fp, strong_fp))?;
            ctx.flush(entry)?;
            strong_bucket.insert(entry);
            Ok(DedupWrite::allocated(block, entry))
        }
    }
}

/// Strong fingerprint of the candidate's content. A WeakOnly candidate is
/// upgraded to Strong from its stored block, flushed, and only then indexed
/// in the strong table.
fn reference_strong<S: BlockStore + ?Sized>(
    ctx: &FinalizeCtx<'_, S>,
    candidate: EntryNumber,
) -> DedupResult<StrongFp> {
    let matched = ctx.entries.get(candidate)?;
    if let Some(fp) = matched.cached_strong() {
        return Ok(fp);
    }

    let content = ctx.store.read_block(matched.block_nr)?;
    let fp = strong_fingerprint(&content);
    ctx.entries.update(candidate, |e| {
        e.strong_fp = fp;
        e.flag = EntryFlag::Strong;
    })?;
    ctx.flush(candidate)?;
    ctx.index.lock_strong(&fp).insert(candidate);
    ctx.metrics.record_strong_upgrade();
    debug!(entry = %candidate, strong = %fp, "Upgraded weak-only entry");
    Ok(fp)
}
