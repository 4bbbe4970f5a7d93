//! Buffered writes.
//!
//! A write reserves data and metadata space for its sector-aligned range,
//! copies the bytes into the page cache and marks the range `DELALLOC`
//! under the IO tree lock. When data space is exhausted, a write to a
//! No-COW or preallocated range that can be overwritten in place proceeds
//! without a data reservation (`NORESERVE`).

use crate::cow::HANDOFF_CLEAR;
use crate::inode::{Inode, InodeFlags};
use crate::ops::InodeOps;
use cfs_error::{CfsError, Result};
use cfs_extent::ExtentBits;
use cfs_types::{MAX_EXTENT_SIZE, count_max_extents};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

impl Inode {
    /// Write through the inode's kind-specific writer.
    pub fn write(self: &Arc<Self>, offset: u64, data: &[u8]) -> Result<usize> {
        self.ops().writer().write_pages(self, offset, data)
    }

    /// Read through the inode's kind-specific reader.
    pub fn read(self: &Arc<Self>, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.ops().reader().read_pages(self, offset, len)
    }

    /// Store a symlink's target. Only allowed once, on an empty link.
    pub fn set_symlink_target(self: &Arc<Self>, target: &[u8]) -> Result<()> {
        if !matches!(self.ops(), InodeOps::Symlink(_)) || self.size() > 0 {
            return Err(CfsError::InvalidArgument(format!(
                "inode {} is not an empty symlink",
                self.ino().0
            )));
        }
        self.buffered_write(0, target, ExtentBits::empty())?;
        self.flush()
    }

    /// Reserve `bytes` of data space, reclaiming once on pressure.
    fn reserve_data(&self, bytes: u64) -> Result<()> {
        match self.fs.data_space().reserve(bytes) {
            Err(CfsError::NoSpace) => {
                self.fs.reclaim()?;
                self.fs.data_space().reserve(bytes)
            }
            res => res,
        }
    }

    fn reserve_meta(&self, bytes: u64) -> Result<()> {
        match self.acct.reserve_meta(bytes) {
            Err(CfsError::NoSpace) => {
                self.fs.reclaim()?;
                self.acct.reserve_meta(bytes)
            }
            res => res,
        }
    }

    /// Old contents of the partially overwritten first and last pages.
    fn seed_pages(self: &Arc<Self>, offset: u64, end: u64) -> Result<BTreeMap<u64, Vec<u8>>> {
        let ss = self.fs.sectorsize();
        let size = self.size();
        let page_len = usize::try_from(ss.bytes()).unwrap_or(usize::MAX);
        let mut seeds = BTreeMap::new();
        let first = ss.round_down(offset);
        let last = ss.round_down(end - 1);
        for page in [first, last] {
            let partial = offset > page || end < page + ss.bytes();
            if !partial || page >= size || seeds.contains_key(&page) || self.pages.get(page).is_some()
            {
                continue;
            }
            let mut old = match self.read_data(page, ss.bytes()) {
                Ok(data) => data,
                // A failed earlier write left nothing worth keeping.
                Err(CfsError::WriteFailed { .. }) => Vec::new(),
                Err(err) => return Err(err),
            };
            old.resize(page_len, 0);
            seeds.insert(page, old);
        }
        Ok(seeds)
    }

    /// Copy `data` into the page cache at `offset` and mark it delalloc.
    /// `extra` bits are set on the range along with `DELALLOC`.
    pub(crate) fn buffered_write(
        self: &Arc<Self>,
        offset: u64,
        data: &[u8],
        extra: ExtentBits,
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.fs.txn().check_writable()?;
        let ss = self.fs.sectorsize();
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| CfsError::InvalidArgument(format!("write at {offset} overflows")))?;
        let start_a = ss.round_down(offset);
        let end_a = ss.round_up(end);
        let len_a = end_a - start_a;
        let flags = self.flags();

        let mut noreserve = false;
        match self.fs.data_space().reserve(len_a) {
            Ok(()) => {}
            Err(CfsError::NoSpace) => {
                if flags.intersects(InodeFlags::NODATACOW | InodeFlags::PREALLOC)
                    && self.can_nocow_range(start_a, end_a)?
                {
                    debug!(
                        target: "cfs::write",
                        ino = self.ino().0,
                        start = start_a,
                        len = len_a,
                        "data space exhausted, writing in place without reservation"
                    );
                    noreserve = true;
                } else {
                    self.reserve_data(len_a)?;
                }
            }
            Err(err) => return Err(err),
        }
        let release_data = |inode: &Self| {
            if !noreserve {
                inode.fs.data_space().release(len_a);
            }
        };

        let per_extent = self.fs.config().metadata_reserve_per_extent;
        if let Err(err) = self.reserve_meta(per_extent * count_max_extents(len_a, MAX_EXTENT_SIZE)) {
            release_data(self);
            return Err(err);
        }

        let seeds = match self.seed_pages(offset, end) {
            Ok(seeds) => seeds,
            Err(err) => {
                release_data(self);
                self.acct.settle();
                return Err(err);
            }
        };

        self.lock_and_wait_ordered(start_a, end_a);
        let old_size = self.size();
        self.pages.write_bytes(offset, data, &seeds);
        self.io_tree.clear_bits(
            start_a,
            end_a,
            HANDOFF_CLEAR | ExtentBits::IOERR | ExtentBits::CLEAR_DATA_RESV,
        );
        let mut bits = ExtentBits::DELALLOC | ExtentBits::UPTODATE | extra;
        if noreserve {
            bits |= ExtentBits::NORESERVE;
        }
        if !self.datasum() {
            bits |= ExtentBits::NODATASUM;
        }
        self.io_tree.set_bits(start_a, end_a, bits);
        if !flags.contains(InodeFlags::PREALLOC) {
            let new_from = ss.round_up(old_size).max(start_a);
            if new_from < end_a {
                self.io_tree
                    .set_bits(new_from, end_a, ExtentBits::DELALLOC_NEW);
            }
        }
        if end > old_size {
            let gap = ss.round_up(old_size);
            if gap < start_a {
                // Bytes between the old EOF and the write read as a hole.
                self.settle_range(gap, start_a);
            }
            self.set_size(end);
        }
        self.io_tree.unlock_range(start_a, end_a);
        self.acct.settle();
        trace!(
            target: "cfs::write",
            ino = self.ino().0,
            offset,
            len = data.len(),
            noreserve,
            size = self.size(),
            "buffered write"
        );
        Ok(data.len())
    }
}
