//! In-memory fingerprint index: a weak table and a strong table mapping
//! fingerprints to metadata entry numbers.
//!
//! Each table has `2^bits` buckets guarded by `lock_count` striped locks;
//! bucket `b` lives in stripe `b % lock_count`. Lookups and insertions are
//! only reachable through a [`BucketGuard`], so every bucket operation runs
//! with its stripe locked. Whoever needs both tables must lock the weak
//! bucket first; debug builds assert that order.

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fmt::Debug;
use std::marker::PhantomData;

use crate::entry::{EntryTable, MetaEntry};
use crate::error::DedupResult;
use crate::fingerprint::{StrongFp, WeakFp};
use crate::types::EntryNumber;

thread_local! {
    static STRONG_GUARDS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Which fingerprint a table is keyed by.
pub trait TableKind: 'static {
    /// Fingerprint type stored in this table.
    type Fp: Copy + Debug + PartialEq;
    /// Table name for logs.
    const NAME: &'static str;
    /// True for the inner table of the lock order.
    const INNER: bool;
    /// Bucket of a fingerprint in a table of `2^bits` buckets.
    fn bucket(fp: &Self::Fp, bits: u32) -> usize;
    /// Does `entry` carry fingerprint `fp` in this table's field?
    fn matches(entry: &MetaEntry, fp: &Self::Fp) -> bool;
}

/// Weak (CRC-32) table marker.
#[derive(Debug)]
pub enum Weak {}

/// Strong (BLAKE3) table marker.
#[derive(Debug)]
pub enum Strong {}

impl TableKind for Weak {
    type Fp = WeakFp;
    const NAME: &'static str = "weak";
    const INNER: bool = false;

    fn bucket(fp: &WeakFp, bits: u32) -> usize {
        fp.bucket(bits)
    }

    fn matches(entry: &MetaEntry, fp: &WeakFp) -> bool {
        entry.is_live() && entry.weak_fp == *fp
    }
}

impl TableKind for Strong {
    type Fp = StrongFp;
    const NAME: &'static str = "strong";
    const INNER: bool = true;

    fn bucket(fp: &StrongFp, bits: u32) -> usize {
        fp.bucket(bits)
    }

    fn matches(entry: &MetaEntry, fp: &StrongFp) -> bool {
        entry.is_live() && entry.cached_strong() == Some(*fp)
    }
}

/// Buckets owned by one lock stripe, indexed by `bucket / lock_count`.
/// Each bucket stores its nodes oldest first; scans walk newest first.
struct Stripe {
    buckets: Vec<Vec<EntryNumber>>,
}

/// One hash table of index nodes with striped locking.
pub struct FingerprintTable<K: TableKind> {
    bits: u32,
    stripes: Box<[Mutex<Stripe>]>,
    _kind: PhantomData<K>,
}

impl<K: TableKind> FingerprintTable<K> {
    /// Create a table with `2^bits` buckets and `lock_count` stripes.
    pub fn new(bits: u32, lock_count: usize) -> Self {
        let bucket_count = 1usize << bits;
        let lock_count = lock_count.clamp(1, bucket_count);
        let per_stripe = bucket_count.div_ceil(lock_count);
        let stripes = (0..lock_count)
            .map(|_| {
                Mutex::new(Stripe {
                    buckets: vec![Vec::new(); per_stripe],
                })
            })
            .collect();
        Self {
            bits,
            stripes,
            _kind: PhantomData,
        }
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        1usize << self.bits
    }

    /// Number of lock stripes.
    pub fn lock_count(&self) -> usize {
        self.stripes.len()
    }

    /// Bucket a fingerprint hashes to.
    pub fn bucket_of(&self, fp: &K::Fp) -> usize {
        K::bucket(fp, self.bits)
    }

    /// Stripe guarding a bucket.
    pub fn stripe_of(&self, bucket: usize) -> usize {
        bucket % self.stripes.len()
    }

    fn check_order() {
        if !K::INNER {
            debug_assert_eq!(
                STRONG_GUARDS_HELD.with(|held| held.get()),
                0,
                "weak bucket locked while holding a strong bucket lock"
            );
        }
    }

    fn guard<'a>(&'a self, bucket: usize, stripe: MutexGuard<'a, Stripe>) -> BucketGuard<'a, K> {
        if K::INNER {
            STRONG_GUARDS_HELD.with(|held| held.set(held.get() + 1));
        }
        BucketGuard {
            bucket,
            slot: bucket / self.stripes.len(),
            stripe,
            _kind: PhantomData,
        }
    }

    /// Lock the stripe owning `bucket`, blocking until it is free.
    pub fn lock(&self, bucket: usize) -> BucketGuard<'_, K> {
        Self::check_order();
        let stripe = self.stripes[self.stripe_of(bucket)].lock();
        self.guard(bucket, stripe)
    }

    /// Lock the bucket a fingerprint hashes to.
    pub fn lock_fp(&self, fp: &K::Fp) -> BucketGuard<'_, K> {
        self.lock(self.bucket_of(fp))
    }

    /// Lock the stripe owning `bucket` if nobody holds it.
    pub fn try_lock(&self, bucket: usize) -> Option<BucketGuard<'_, K>> {
        Self::check_order();
        let stripe = self.stripes[self.stripe_of(bucket)].try_lock()?;
        Some(self.guard(bucket, stripe))
    }

    /// Total number of index nodes. Locks each stripe in turn.
    pub fn node_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|stripe| stripe.lock().buckets.iter().map(Vec::len).sum::<usize>())
            .sum()
    }
}

/// Exclusive access to one bucket for as long as the guard lives.
pub struct BucketGuard<'a, K: TableKind> {
    bucket: usize,
    slot: usize,
    stripe: MutexGuard<'a, Stripe>,
    _kind: PhantomData<K>,
}

impl<K: TableKind> BucketGuard<'_, K> {
    /// Bucket this guard covers.
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Nodes of the bucket, newest first.
    pub fn nodes(&self) -> impl Iterator<Item = EntryNumber> + '_ {
        self.stripe.buckets[self.slot].iter().rev().copied()
    }

    /// Scan the bucket for an entry carrying `fp`; the newest matching node wins.
    pub fn find(&self, fp: &K::Fp, entries: &EntryTable) -> DedupResult<Option<EntryNumber>> {
        for nr in self.nodes() {
            if K::matches(&entries.get(nr)?, fp) {
                return Ok(Some(nr));
            }
        }
        Ok(None)
    }

    /// Add a node at the head of the bucket.
    pub fn insert(&mut self, nr: EntryNumber) {
        self.stripe.buckets[self.slot].push(nr);
        tracing::trace!(table = K::NAME, bucket = self.bucket, entry = %nr, "Inserted index node");
    }
}

impl<K: TableKind> Drop for BucketGuard<'_, K> {
    fn drop(&mut self) {
        if K::INNER {
            STRONG_GUARDS_HELD.with(|held| held.set(held.get() - 1));
        }
    }
}

/// The weak and strong fingerprint tables.
pub struct FingerprintIndex {
    weak: FingerprintTable<Weak>,
    strong: FingerprintTable<Strong>,
}

impl FingerprintIndex {
    /// Create both tables with `2^bits` buckets and `lock_count` stripes each.
    pub fn new(bits: u32, lock_count: usize) -> Self {
        Self {
            weak: FingerprintTable::new(bits, lock_count),
            strong: FingerprintTable::new(bits, lock_count),
        }
    }

    /// The weak table.
    pub fn weak(&self) -> &FingerprintTable<Weak> {
        &self.weak
    }

    /// The strong table.
    pub fn strong(&self) -> &FingerprintTable<Strong> {
        &self.strong
    }

    /// Lock the weak bucket for `fp`. Must precede any strong lock held at the same time.
    pub fn lock_weak(&self, fp: &WeakFp) -> BucketGuard<'_, Weak> {
        self.weak.lock_fp(fp)
    }

    /// Lock the strong bucket for `fp`.
    pub fn lock_strong(&self, fp: &StrongFp) -> BucketGuard<'_, Strong> {
        self.strong.lock_fp(fp)
    }
}
