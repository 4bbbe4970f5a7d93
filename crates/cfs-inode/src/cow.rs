//! Writeback of delalloc ranges: range selection, the COW allocator loop
//! and inline extents.
//!
//! A flush walks the `DELALLOC` runs of the IO tree, locks each one and
//! hands it to the No-COW path, the async compression path or plain COW.
//! Every path publishes a pinned extent map and an ordered extent before
//! clearing `DELALLOC` and before any IO is submitted, so readers and
//! completion always find the mapping.

use crate::file_extents::drop_file_extents;
use crate::inode::{Inode, InodeFlags};
use crate::ordered::{NewOrdered, OrderedExtent, OrderedKind};
use cfs_btree::fs_tree::file_extent_key;
use cfs_btree::items::{FileExtentItem, FileExtentKind};
use cfs_btree::TreeId;
use cfs_error::{CfsError, Result};
use cfs_extent::{BlockStart, ExtentBits, ExtentMap, ExtentMapFlags, StateRange};
use cfs_types::{CompressionType, MAX_EXTENT_SIZE, max_inline_data_size, u64_to_usize};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Bits a successful writeback hand-off clears.
pub(crate) const HANDOFF_CLEAR: ExtentBits = ExtentBits::DELALLOC
    .union(ExtentBits::DELALLOC_NEW)
    .union(ExtentBits::DEFRAG)
    .union(ExtentBits::NORESERVE);

/// Reservation release modifiers.
pub(crate) const RELEASE_ALL: ExtentBits =
    ExtentBits::CLEAR_DATA_RESV.union(ExtentBits::CLEAR_META_RESV);

impl Inode {
    // ── Flushing ────────────────────────────────────────────────────────────

    /// Write back every delalloc byte of the file.
    pub fn flush(self: &Arc<Self>) -> Result<()> {
        self.flush_range(0, u64::MAX)
    }

    /// Write back the delalloc bytes of `[start, end)`. Runs that fail are
    /// cleaned up and the first error is returned after the others ran.
    pub fn flush_range(self: &Arc<Self>, start: u64, end: u64) -> Result<()> {
        let mut pos = start;
        let mut first_err = None;
        let mut runs = 0_u32;
        while pos < end {
            let Some(found) = self.io_tree.find_first(pos, ExtentBits::DELALLOC) else {
                break;
            };
            if found.start >= end {
                break;
            }
            let s = found.start.max(pos);
            let e = found.end.min(end);
            self.io_tree.lock_range(s, e);
            for run in self.delalloc_runs(s, e) {
                runs += 1;
                if let Err(err) = self.run_delalloc_range(run.start, run.end) {
                    first_err.get_or_insert(err);
                }
            }
            self.io_tree.unlock_range(s, e);
            pos = e;
        }
        if runs > 0 {
            self.acct.settle();
            debug!(target: "cfs::delalloc", ino = self.ino().0, runs, "flushed");
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Maximal `DELALLOC` runs inside `[start, end)`, read under the range
    /// lock.
    fn delalloc_runs(&self, start: u64, end: u64) -> Vec<StateRange> {
        let mut runs: Vec<StateRange> = Vec::new();
        for (range, bits) in self.io_tree.ranges(start, end) {
            if !bits.contains(ExtentBits::DELALLOC) {
                continue;
            }
            match runs.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => runs.push(range),
            }
        }
        runs
    }

    /// Pick the writeback strategy for one locked delalloc run.
    pub(crate) fn run_delalloc_range(self: &Arc<Self>, start: u64, end: u64) -> Result<()> {
        let flags = self.flags();
        let nocow = flags.intersects(InodeFlags::NODATACOW | InodeFlags::PREALLOC)
            && !self.io_tree.test_range(start, end, ExtentBits::DEFRAG, false);
        trace!(
            target: "cfs::delalloc",
            ino = self.ino().0,
            start,
            end,
            nocow,
            "run delalloc"
        );
        if nocow {
            self.run_delalloc_nocow(start, end)
        } else if self.should_compress(start, end) {
            self.compress_range(start, end)
        } else {
            self.cow_file_range(start, end)
        }
    }

    // ── Shared helpers ──────────────────────────────────────────────────────

    /// Create and register an ordered extent; it holds one outstanding
    /// extent credit until it is removed.
    pub(crate) fn add_ordered(&self, params: NewOrdered) -> Result<Arc<OrderedExtent>> {
        let oe = OrderedExtent::new(params);
        self.ordered.add(&oe)?;
        self.acct.ordered_added();
        Ok(oe)
    }

    /// Give up on `[start, end)`: release its reservations, mark it failed
    /// and record the error for fsync.
    pub(crate) fn fail_delalloc(&self, start: u64, end: u64, err: &CfsError) {
        self.io_tree.clear_and_set(
            start,
            end,
            HANDOFF_CLEAR | RELEASE_ALL | ExtentBits::UPTODATE,
            ExtentBits::IOERR,
        );
        self.pages.drop_range(start, end);
        self.mapping_error.set(err.duplicate());
        error!(
            target: "cfs::delalloc",
            ino = self.ino().0,
            start,
            end,
            error = %err,
            "delalloc writeback failed"
        );
    }

    /// Physical address following the extent that maps the byte before
    /// `start`, to keep file data contiguous.
    pub(crate) fn alloc_hint(&self, start: u64) -> u64 {
        if start == 0 {
            return 0;
        }
        self.em_tree
            .search(start - 1)
            .filter(|em| em.start < start && !em.is_compressed())
            .and_then(|em| em.disk_bytenr_at(em.end().saturating_sub(1)))
            .map_or(0, |b| b + 1)
    }

    // ── COW ─────────────────────────────────────────────────────────────────

    /// Allocate new extents for `[start, end)` and submit their IO. The
    /// range is locked by the caller.
    pub(crate) fn cow_file_range(self: &Arc<Self>, start: u64, end: u64) -> Result<()> {
        if start == 0 {
            match self.try_inline(end) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => {
                    self.fail_delalloc(start, end, &err);
                    return Err(err);
                }
            }
        }
        let ss = self.fs.sectorsize();
        let alloc = Arc::clone(self.fs.alloc());
        let exact = self.flags().contains(InodeFlags::RELOC_TARGET);
        let mut hint = self.alloc_hint(start);
        let mut cur = start;
        while cur < end {
            let want = (end - cur).min(MAX_EXTENT_SIZE);
            let min = if exact { want } else { ss.bytes() };
            let ext = match alloc.reserve_extent(want, min, hint) {
                Ok(ext) => ext,
                Err(err) => {
                    self.fail_delalloc(cur, end, &err);
                    return Err(err);
                }
            };
            let len = ext.len.min(end - cur);
            if let Err(err) = self.start_cow_extent(cur, len, ext.start, ext.len) {
                alloc.dec_reservations(ext.start);
                if let Err(free_err) = alloc.free_reserved(ext.start, ext.len) {
                    error!(target: "cfs::alloc", start = ext.start, error = %free_err, "reservation leak");
                }
                self.fail_delalloc(cur, end, &err);
                return Err(err);
            }
            alloc.dec_reservations(ext.start);
            hint = ext.start + ext.len;
            cur += len;
        }
        Ok(())
    }

    fn start_cow_extent(
        self: &Arc<Self>,
        start: u64,
        len: u64,
        disk_bytenr: u64,
        disk_len: u64,
    ) -> Result<()> {
        let end = start + len;
        let em = ExtentMap {
            start,
            len,
            block_start: BlockStart::Disk(disk_bytenr),
            block_len: disk_len,
            orig_start: start,
            orig_block_len: disk_len,
            ram_bytes: len,
            compression: CompressionType::None,
            generation: 0,
            flags: ExtentMapFlags::PINNED,
        };
        self.em_tree.add_with_retry(em, true)?;
        let oe = match self.add_ordered(NewOrdered {
            file_offset: start,
            num_bytes: len,
            ram_bytes: len,
            disk_bytenr,
            disk_num_bytes: disk_len,
            compression: CompressionType::None,
            kind: OrderedKind::Regular,
        }) {
            Ok(oe) => oe,
            Err(err) => {
                self.em_tree.drop_range(start, end, false);
                return Err(err);
            }
        };
        self.hand_off_reservation(start, end);
        trace!(
            target: "cfs::cow",
            ino = self.ino().0,
            start,
            len,
            disk_bytenr,
            "cow extent"
        );
        let data = self.pages.capture_for_writeback(start, end);
        self.ops().submitter().submit(self, &oe, data);
        Ok(())
    }

    /// The device extent now backs `[start, end)`: drop the data
    /// reservation the write took and clear the delalloc bits without
    /// releasing it again.
    pub(crate) fn hand_off_reservation(&self, start: u64, end: u64) {
        let noreserve = self.io_tree.count_bytes(start, end, ExtentBits::NORESERVE);
        self.fs.data_space().release((end - start).saturating_sub(noreserve));
        self.io_tree.clear_bits(start, end, HANDOFF_CLEAR);
    }

    // ── Inline ──────────────────────────────────────────────────────────────

    /// Store a small file's data in its file extent item. Returns `false`
    /// when the file does not qualify.
    pub(crate) fn try_inline(self: &Arc<Self>, end: u64) -> Result<bool> {
        let ss = self.fs.sectorsize();
        let config = self.fs.config();
        let size = self.size();
        if size == 0
            || end < size
            || size > ss.bytes()
            || size > config.max_inline
            || size > max_inline_data_size(config.nodesize)
            || self.flags().contains(InodeFlags::NODATACOW)
        {
            return Ok(false);
        }
        let block_end = ss.round_up(size);
        let mut data = self.pages.capture_for_writeback(0, block_end);
        data.truncate(u64_to_usize(size, "inline size").map_err(|e| cfs_btree::parse_to_cfs_error(&e))?);
        let (payload, compression) = match self.inline_compression() {
            Some((kind, level)) => {
                let max_out = data.len().saturating_sub(1);
                match cfs_compress::compress(kind, level, &data, max_out)? {
                    Some(out) => (out, kind),
                    None => (data, CompressionType::None),
                }
            }
            None => (data, CompressionType::None),
        };
        let root = self.root.id();
        let ino = self.ino();
        let mut h = self.fs.txn().start()?;
        let transid = h.transid().0;
        let item = FileExtentItem {
            generation: transid,
            ram_bytes: size,
            compression,
            encryption: 0,
            other_encoding: 0,
            kind: FileExtentKind::Inline(payload),
        };
        let staged = (|| -> Result<Vec<(u64, u64)>> {
            let dropped = drop_file_extents(&mut h, root, ino, ss, 0, block_end)?;
            h.insert(TreeId::Fs(root), file_extent_key(ino, 0), item.encode())?;
            self.adjust_nbytes(size, dropped.removed_bytes);
            self.settle_range(0, block_end);
            self.update_inode_item(&mut h)?;
            Ok(dropped.freed)
        })();
        let freed = match staged {
            Ok(freed) => freed,
            Err(err) => return Err(h.abort(&format!("inline extent for inode {}: {err}", ino.0))),
        };
        h.end()?;
        self.fs.queue_pinned_frees(freed);

        self.em_tree.drop_range(0, block_end, false);
        let em = ExtentMap {
            start: 0,
            len: block_end,
            block_start: BlockStart::Inline,
            block_len: 0,
            orig_start: 0,
            orig_block_len: 0,
            ram_bytes: size,
            compression,
            generation: transid,
            flags: ExtentMapFlags::empty(),
        };
        self.em_tree.add_with_retry(em, true)?;
        self.io_tree
            .clear_bits(0, end, HANDOFF_CLEAR | RELEASE_ALL);
        self.pages.end_writeback(0, block_end, true);
        self.insert_flags(InodeFlags::FULL_SYNC);
        debug!(
            target: "cfs::cow",
            ino = ino.0,
            size,
            compressed = compression.is_compressed(),
            "inline extent written"
        );
        Ok(true)
    }
}
