//! Per-inode delalloc accounting.
//!
//! [`InodeAccounting`] is the [`ExtentIoHooks`] implementation installed on
//! every inode's IO tree. It keeps the worst-case outstanding extent count
//! exact across splits and merges, releases data reservations only when a
//! clear asks for it, and keeps the metadata reservation equal to
//! `per_extent * outstanding_extents` whenever it is allowed to shrink.
//!
//! Hooks run with the IO tree lock held. They take the accounting lock and
//! then, on the first and last delalloc byte, the root's delalloc list lock.

use crate::root::RootDelalloc;
use cfs_alloc::SpaceInfo;
use cfs_error::Result;
use cfs_extent::{ExtentBits, ExtentIoHooks, StateRange};
use cfs_types::count_max_extents;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

/// Counter snapshot, serializable for scenario reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcctState {
    pub outstanding_extents: u64,
    pub delalloc_bytes: u64,
    pub new_delalloc_bytes: u64,
    pub defrag_bytes: u64,
    pub csum_bytes: u64,
    pub meta_reserved: u64,
}

pub struct InodeAccounting {
    ino: u64,
    data_space: Arc<SpaceInfo>,
    meta_space: Arc<SpaceInfo>,
    per_extent: u64,
    max_extent: u64,
    root_list: Arc<RootDelalloc>,
    state: Mutex<AcctState>,
}

impl std::fmt::Debug for InodeAccounting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeAccounting")
            .field("ino", &self.ino)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

fn sub(counter: &mut u64, by: u64) {
    *counter = counter.saturating_sub(by);
}

impl InodeAccounting {
    #[must_use]
    pub fn new(
        ino: u64,
        data_space: Arc<SpaceInfo>,
        meta_space: Arc<SpaceInfo>,
        per_extent: u64,
        max_extent: u64,
        root_list: Arc<RootDelalloc>,
    ) -> Self {
        Self {
            ino,
            data_space,
            meta_space,
            per_extent,
            max_extent,
            root_list,
            state: Mutex::new(AcctState::default()),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> AcctState {
        *self.state.lock()
    }

    #[must_use]
    pub fn outstanding_extents(&self) -> u64 {
        self.state.lock().outstanding_extents
    }

    #[must_use]
    pub fn delalloc_bytes(&self) -> u64 {
        self.state.lock().delalloc_bytes
    }

    fn extents(&self, len: u64) -> u64 {
        count_max_extents(len, self.max_extent)
    }

    /// Bring the metadata reservation to `per_extent * outstanding`. Growth
    /// is forced; shrinking only happens when `shrink` is set.
    fn rebalance(&self, state: &mut AcctState, shrink: bool) {
        let target = self.per_extent * state.outstanding_extents;
        if target > state.meta_reserved {
            self.meta_space.reserve_force(target - state.meta_reserved);
            state.meta_reserved = target;
        } else if shrink && target < state.meta_reserved {
            self.meta_space.release(state.meta_reserved - target);
            state.meta_reserved = target;
        }
    }

    /// Reserve metadata space for a write before its range is dirtied.
    pub fn reserve_meta(&self, bytes: u64) -> Result<()> {
        self.meta_space.reserve(bytes)?;
        self.state.lock().meta_reserved += bytes;
        Ok(())
    }

    /// Drop any metadata reservation above what outstanding extents need.
    pub fn settle(&self) {
        let mut state = self.state.lock();
        self.rebalance(&mut state, true);
    }

    /// An ordered extent took over part of a delalloc range.
    pub fn ordered_added(&self) {
        let mut state = self.state.lock();
        state.outstanding_extents += 1;
        self.rebalance(&mut state, false);
    }

    /// An ordered extent was removed from the inode.
    pub fn ordered_removed(&self) {
        let mut state = self.state.lock();
        sub(&mut state.outstanding_extents, 1);
        self.rebalance(&mut state, true);
    }
}

impl ExtentIoHooks for InodeAccounting {
    fn on_set(&self, range: StateRange, old: ExtentBits, bits: ExtentBits) {
        let len = range.len();
        let newly = bits - old;
        if newly.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if newly.contains(ExtentBits::DELALLOC) {
            let was_clean = state.delalloc_bytes == 0;
            state.outstanding_extents += self.extents(len);
            state.delalloc_bytes += len;
            if !(old | bits).contains(ExtentBits::NODATASUM) {
                state.csum_bytes += len;
            }
            if was_clean {
                self.root_list.link(self.ino);
            }
            self.rebalance(&mut state, false);
        }
        if newly.contains(ExtentBits::DELALLOC_NEW) {
            state.new_delalloc_bytes += len;
        }
        if newly.contains(ExtentBits::DEFRAG) {
            state.defrag_bytes += len;
        }
        trace!(
            target: "cfs::acct",
            ino = self.ino,
            start = range.start,
            end = range.end,
            ?newly,
            outstanding = state.outstanding_extents,
            "delalloc set"
        );
    }

    fn on_clear(&self, range: StateRange, old: ExtentBits, bits: ExtentBits) {
        let len = range.len();
        let cleared = old & bits;
        let mut state = self.state.lock();
        if cleared.contains(ExtentBits::DELALLOC) {
            sub(&mut state.outstanding_extents, self.extents(len));
            sub(&mut state.delalloc_bytes, len);
            if !old.contains(ExtentBits::NODATASUM) {
                sub(&mut state.csum_bytes, len);
            }
            if bits.intersects(ExtentBits::CLEAR_DATA_RESV | ExtentBits::DO_ACCOUNTING)
                && !old.contains(ExtentBits::NORESERVE)
            {
                self.data_space.release(len);
            }
            let shrink = bits.intersects(ExtentBits::CLEAR_META_RESV | ExtentBits::DO_ACCOUNTING);
            self.rebalance(&mut state, shrink);
            if state.delalloc_bytes == 0 {
                self.root_list.unlink(self.ino);
            }
        }
        if cleared.contains(ExtentBits::DELALLOC_NEW) {
            sub(&mut state.new_delalloc_bytes, len);
        }
        if cleared.contains(ExtentBits::DEFRAG) {
            sub(&mut state.defrag_bytes, len);
        }
    }

    fn on_split(&self, orig: StateRange, bits: ExtentBits, at: u64) {
        if !bits.contains(ExtentBits::DELALLOC) {
            return;
        }
        let before = self.extents(orig.len());
        let after = self.extents(at - orig.start) + self.extents(orig.end - at);
        let mut state = self.state.lock();
        state.outstanding_extents = (state.outstanding_extents + after).saturating_sub(before);
        self.rebalance(&mut state, false);
    }

    fn on_merge(&self, left: StateRange, right: StateRange, bits: ExtentBits) {
        if !bits.contains(ExtentBits::DELALLOC) {
            return;
        }
        let before = self.extents(left.len()) + self.extents(right.len());
        let after = self.extents(right.end - left.start);
        let mut state = self.state.lock();
        state.outstanding_extents = (state.outstanding_extents + after).saturating_sub(before);
    }
}
