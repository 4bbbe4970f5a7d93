//! Ordered extents: one physical write in flight.
//!
//! ```text
//! Reserved ─add─▶ Registered ─IO─▶ PartiallyComplete ─IO─▶ Complete
//!                                                            │ finish
//!                                        Retired ◀─remove─ Committed
//! ```
//!
//! Completion reports are sub-ranges of the file range. They may overlap and
//! arrive in any order on any thread; a set of completed ranges guarantees
//! each byte is counted once, so [`OrderedExtent::dec_test_pending`] returns
//! `true` exactly once. Truncation lowers the committed length but the tail
//! bytes still have to be reported before the extent completes.

use bitflags::bitflags;
use cfs_error::{CfsError, Result};
use cfs_types::CompressionType;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderedKind {
    /// Fresh COW allocation.
    Regular,
    /// In-place overwrite of an existing regular extent.
    Nocow,
    /// First write into a preallocated extent.
    Prealloc,
    Compressed,
    Direct,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OrderedFlags: u32 {
        const IOERR      = 1 << 0;
        const TRUNCATED  = 1 << 1;
        const COMPRESSED = 1 << 2;
        const PREALLOC   = 1 << 3;
        const NOCOW      = 1 << 4;
        const DIRECT     = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderedState {
    Reserved,
    Registered,
    PartiallyComplete,
    Complete,
    Committed,
    Retired,
}

/// Checksums computed at submission for consecutive sectors at `bytenr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedSums {
    pub bytenr: u64,
    pub sums: Vec<u32>,
}

/// Parameters of a new ordered extent.
#[derive(Debug, Clone, Copy)]
pub struct NewOrdered {
    pub file_offset: u64,
    pub num_bytes: u64,
    pub ram_bytes: u64,
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub compression: CompressionType,
    pub kind: OrderedKind,
}

#[derive(Debug)]
struct Inner {
    flags: OrderedFlags,
    state: OrderedState,
    bytes_left: u64,
    /// Completed file ranges, disjoint and merged: start -> end.
    completed: BTreeMap<u64, u64>,
    truncated_len: u64,
    sums: Vec<OrderedSums>,
}

#[derive(Debug)]
pub struct OrderedExtent {
    pub file_offset: u64,
    pub num_bytes: u64,
    pub ram_bytes: u64,
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    pub compression: CompressionType,
    pub kind: OrderedKind,
    inner: Mutex<Inner>,
    retired: Condvar,
}

/// Add `[s, e)` to a disjoint interval set; return the bytes not already
/// present.
fn add_range(set: &mut BTreeMap<u64, u64>, s: u64, e: u64) -> u64 {
    let touching: Vec<(u64, u64)> = set
        .range(..=e)
        .rev()
        .take_while(|&(_, &end)| end >= s)
        .map(|(&k, &v)| (k, v))
        .collect();
    let mut covered = 0;
    let (mut lo, mut hi) = (s, e);
    for (k, v) in touching {
        covered += v.min(e).saturating_sub(k.max(s));
        lo = lo.min(k);
        hi = hi.max(v);
        set.remove(&k);
    }
    set.insert(lo, hi);
    (e - s) - covered
}

impl OrderedExtent {
    #[must_use]
    pub fn new(params: NewOrdered) -> Arc<Self> {
        let flags = match params.kind {
            OrderedKind::Regular => OrderedFlags::empty(),
            OrderedKind::Nocow => OrderedFlags::NOCOW,
            OrderedKind::Prealloc => OrderedFlags::PREALLOC,
            OrderedKind::Compressed => OrderedFlags::COMPRESSED,
            OrderedKind::Direct => OrderedFlags::DIRECT,
        };
        Arc::new(Self {
            file_offset: params.file_offset,
            num_bytes: params.num_bytes,
            ram_bytes: params.ram_bytes,
            disk_bytenr: params.disk_bytenr,
            disk_num_bytes: params.disk_num_bytes,
            compression: params.compression,
            kind: params.kind,
            inner: Mutex::new(Inner {
                flags,
                state: OrderedState::Reserved,
                bytes_left: params.num_bytes,
                completed: BTreeMap::new(),
                truncated_len: params.num_bytes,
                sums: Vec::new(),
            }),
            retired: Condvar::new(),
        })
    }

    /// Exclusive end of the file range.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.file_offset + self.num_bytes
    }

    #[must_use]
    pub fn flags(&self) -> OrderedFlags {
        self.inner.lock().flags
    }

    #[must_use]
    pub fn state(&self) -> OrderedState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn bytes_left(&self) -> u64 {
        self.inner.lock().bytes_left
    }

    /// File bytes the completion will commit.
    #[must_use]
    pub fn committed_len(&self) -> u64 {
        let inner = self.inner.lock();
        if inner.flags.contains(OrderedFlags::TRUNCATED) {
            inner.truncated_len
        } else {
            self.num_bytes
        }
    }

    /// Whether this write reuses space it did not reserve.
    #[must_use]
    pub fn is_in_place(&self) -> bool {
        matches!(self.kind, OrderedKind::Nocow | OrderedKind::Prealloc)
    }

    pub fn set_flags(&self, flags: OrderedFlags) {
        self.inner.lock().flags.insert(flags);
    }

    pub fn add_sums(&self, sums: OrderedSums) {
        self.inner.lock().sums.push(sums);
    }

    #[must_use]
    pub fn take_sums(&self) -> Vec<OrderedSums> {
        let mut sums = std::mem::take(&mut self.inner.lock().sums);
        sums.sort_by_key(|s| s.bytenr);
        sums
    }

    /// Limit the commit to the first `len` file bytes.
    pub fn truncate(&self, len: u64) {
        let mut inner = self.inner.lock();
        let len = len.min(self.num_bytes);
        if !inner.flags.contains(OrderedFlags::TRUNCATED) || len < inner.truncated_len {
            inner.truncated_len = len;
        }
        inner.flags.insert(OrderedFlags::TRUNCATED);
        trace!(
            target: "cfs::ordered",
            file_offset = self.file_offset,
            truncated_len = inner.truncated_len,
            "ordered extent truncated"
        );
    }

    pub(crate) fn set_state(&self, state: OrderedState) {
        self.inner.lock().state = state;
    }

    /// Account a completed sub-range. Returns `true` for the one report
    /// that completes the extent.
    pub fn dec_test_pending(&self, offset: u64, len: u64, uptodate: bool) -> bool {
        let s = offset.max(self.file_offset);
        let e = offset.saturating_add(len).min(self.end());
        let mut inner = self.inner.lock();
        if !uptodate {
            inner.flags.insert(OrderedFlags::IOERR);
        }
        if e <= s || inner.state >= OrderedState::Complete {
            return false;
        }
        let newly = add_range(&mut inner.completed, s, e);
        inner.bytes_left -= newly.min(inner.bytes_left);
        if inner.bytes_left == 0 {
            inner.state = OrderedState::Complete;
            return true;
        }
        if newly > 0 {
            inner.state = OrderedState::PartiallyComplete;
        }
        false
    }

    fn retire(&self) {
        self.inner.lock().state = OrderedState::Retired;
        self.retired.notify_all();
    }

    /// Block until the extent has been removed from its tree.
    pub fn wait(&self) {
        let mut inner = self.inner.lock();
        while inner.state != OrderedState::Retired {
            self.retired.wait(&mut inner);
        }
    }
}

/// Per-inode index of ordered extents keyed by file offset.
#[derive(Debug, Default)]
pub struct OrderedTree {
    map: Mutex<BTreeMap<u64, Arc<OrderedExtent>>>,
}

impl OrderedTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Register an extent; fails with `Exists` if it overlaps another.
    pub fn add(&self, oe: &Arc<OrderedExtent>) -> Result<()> {
        let mut map = self.map.lock();
        if Self::first_overlap(&map, oe.file_offset, oe.end()).is_some() {
            return Err(CfsError::Exists);
        }
        oe.set_state(OrderedState::Registered);
        map.insert(oe.file_offset, Arc::clone(oe));
        Ok(())
    }

    fn first_overlap(
        map: &BTreeMap<u64, Arc<OrderedExtent>>,
        start: u64,
        end: u64,
    ) -> Option<Arc<OrderedExtent>> {
        if let Some((_, oe)) = map.range(..=start).next_back() {
            if oe.end() > start {
                return Some(Arc::clone(oe));
            }
        }
        map.range(start..end).next().map(|(_, oe)| Arc::clone(oe))
    }

    /// The extent containing `offset`.
    #[must_use]
    pub fn lookup(&self, offset: u64) -> Option<Arc<OrderedExtent>> {
        Self::first_overlap(&self.map.lock(), offset, offset.saturating_add(1))
    }

    /// The first extent overlapping `[start, start + len)`.
    #[must_use]
    pub fn lookup_first_in_range(&self, start: u64, len: u64) -> Option<Arc<OrderedExtent>> {
        Self::first_overlap(&self.map.lock(), start, start.saturating_add(len))
    }

    /// Every extent overlapping `[start, end)`.
    #[must_use]
    pub fn in_range(&self, start: u64, end: u64) -> Vec<Arc<OrderedExtent>> {
        let map = self.map.lock();
        let mut out: Vec<Arc<OrderedExtent>> = Vec::new();
        if let Some(first) = Self::first_overlap(&map, start, end) {
            out.extend(
                map.range(first.file_offset..end)
                    .map(|(_, oe)| Arc::clone(oe)),
            );
        }
        out
    }

    /// Remove a completed extent and wake its waiters.
    pub fn remove(&self, oe: &OrderedExtent) -> bool {
        let removed = self.map.lock().remove(&oe.file_offset).is_some();
        oe.retire();
        removed
    }

    /// Block until no extent overlaps `[start, start + len)`.
    pub fn wait_range(&self, start: u64, len: u64) {
        while let Some(oe) = self.lookup_first_in_range(start, len) {
            oe.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn oe(file_offset: u64, num_bytes: u64) -> Arc<OrderedExtent> {
        OrderedExtent::new(NewOrdered {
            file_offset,
            num_bytes,
            ram_bytes: num_bytes,
            disk_bytenr: 1 << 20,
            disk_num_bytes: num_bytes,
            compression: CompressionType::None,
            kind: OrderedKind::Regular,
        })
    }

    #[test]
    fn overlapping_reports_count_once() {
        let e = oe(4096, 16384);
        assert!(!e.dec_test_pending(4096, 8192, true));
        assert_eq!(e.state(), OrderedState::PartiallyComplete);
        assert!(!e.dec_test_pending(8192, 4096, true));
        assert_eq!(e.bytes_left(), 8192);
        assert!(!e.dec_test_pending(0, 4096, true));
        assert!(e.dec_test_pending(12288, 1 << 20, true));
        assert_eq!(e.state(), OrderedState::Complete);
        assert!(!e.dec_test_pending(4096, 16384, true));
    }

    #[test]
    fn errors_stick_and_truncation_keeps_tail_accounting() {
        let e = oe(0, 8192);
        e.truncate(5000);
        e.truncate(6000);
        assert_eq!(e.committed_len(), 5000);
        assert!(!e.dec_test_pending(0, 4096, false));
        assert!(e.flags().contains(OrderedFlags::IOERR | OrderedFlags::TRUNCATED));
        assert!(e.dec_test_pending(4096, 4096, true));
    }

    #[test]
    fn tree_rejects_overlap_and_wait_returns_after_remove() {
        let tree = Arc::new(OrderedTree::new());
        let a = oe(0, 8192);
        tree.add(&a).expect("add");
        assert_eq!(a.state(), OrderedState::Registered);
        assert!(matches!(tree.add(&oe(4096, 4096)), Err(CfsError::Exists)));
        tree.add(&oe(8192, 4096)).expect("adjacent");
        assert_eq!(tree.in_range(4096, 12288).len(), 2);
        assert!(tree.lookup(8191).is_some());
        assert!(tree.lookup_first_in_range(12288, 100).is_none());

        let t2 = Arc::clone(&tree);
        let a2 = Arc::clone(&a);
        let waiter = std::thread::spawn(move || {
            t2.wait_range(0, 4096);
            a2.state()
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(tree.remove(&a));
        assert_eq!(waiter.join().expect("join"), OrderedState::Retired);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn concurrent_reports_finish_exactly_once() {
        let e = oe(0, 256 * 4096);
        let finished = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8_u64)
            .map(|t| {
                let e = Arc::clone(&e);
                let finished = Arc::clone(&finished);
                std::thread::spawn(move || {
                    for i in 0..64_u64 {
                        // Every thread reports an overlapping stripe.
                        let off = ((i * 8 + t) % 256) * 4096;
                        if e.dec_test_pending(off, 8192, true) {
                            finished.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("join");
        }
        if e.bytes_left() > 0 && e.dec_test_pending(0, 256 * 4096, true) {
            finished.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn random_chunking_completes_once(
            cuts in proptest::collection::btree_set(1_u64..64, 0..20),
            dupes in proptest::collection::vec(0_usize..21, 0..10),
            seed in any::<u64>(),
        ) {
            let sectors = 64_u64;
            let e = oe(0, sectors * 4096);
            let mut bounds: Vec<u64> = std::iter::once(0)
                .chain(cuts.iter().copied())
                .chain(std::iter::once(sectors))
                .collect();
            bounds.dedup();
            let mut chunks: Vec<(u64, u64)> = bounds
                .windows(2)
                .map(|w| (w[0] * 4096, (w[1] - w[0]) * 4096))
                .collect();
            for d in dupes {
                if let Some(&c) = chunks.get(d % chunks.len()) {
                    chunks.push(c);
                }
            }
            // Deterministic shuffle.
            let mut s = seed | 1;
            for i in (1..chunks.len()).rev() {
                s ^= s << 13;
                s ^= s >> 7;
                s ^= s << 17;
                let j = usize::try_from(s % (i as u64 + 1)).unwrap_or(0);
                chunks.swap(i, j);
            }
            let chunks = Arc::new(chunks);
            let finished = Arc::new(AtomicUsize::new(0));
            let threads: Vec<_> = (0..4_usize)
                .map(|t| {
                    let (e, chunks, finished) =
                        (Arc::clone(&e), Arc::clone(&chunks), Arc::clone(&finished));
                    std::thread::spawn(move || {
                        for (i, &(off, len)) in chunks.iter().enumerate() {
                            if i % 4 == t && e.dec_test_pending(off, len, true) {
                                finished.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().expect("join");
            }
            prop_assert_eq!(finished.load(Ordering::SeqCst), 1);
            prop_assert_eq!(e.state(), OrderedState::Complete);
        }
    }
}
