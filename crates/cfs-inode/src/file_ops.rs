//! File-level operations built on the delalloc engine, and open file
//! handles.
//!
//! Truncation never waits for in-flight IO: ordered extents past the new
//! size are truncated so their completion commits only the surviving
//! prefix. Hole punching, preallocation and defragmentation flush and wait
//! for the affected range first.

use crate::cow::{HANDOFF_CLEAR, RELEASE_ALL};
use crate::file_extents::{drop_file_extents, trim_inline};
use crate::inode::{Inode, InodeFlags};
use cfs_btree::backref::add_extent_ref;
use cfs_btree::fs_tree::file_extent_key;
use cfs_btree::items::{DiskRef, FileExtentItem, FileExtentKind};
use cfs_btree::TreeId;
use cfs_error::{CfsError, Result};
use cfs_extent::{BlockStart, ExtentBits};
use cfs_types::{CompressionType, MAX_EXTENT_SIZE};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Extents at least this long are left alone by defragmentation.
pub const DEFAULT_DEFRAG_THRESH: u64 = 256 * 1024;

impl Inode {
    fn check_data_op(&self, what: &str) -> Result<()> {
        self.fs.txn().check_writable()?;
        if !self.is_regular() {
            return Err(CfsError::InvalidArgument(format!(
                "{what} on non-regular inode {}",
                self.ino().0
            )));
        }
        Ok(())
    }

    /// Write zeros over `[start, end)` through the page cache.
    fn zero_range(self: &Arc<Self>, start: u64, end: u64) -> Result<()> {
        if end > start {
            let zeros = vec![0_u8; usize::try_from(end - start).unwrap_or(0)];
            self.buffered_write(start, &zeros, ExtentBits::empty())?;
        }
        Ok(())
    }

    // ── Truncate ────────────────────────────────────────────────────────────

    /// Change the file size. Shrinking drops every extent past the new
    /// size and zeroes the tail of the last partial sector.
    pub fn truncate(self: &Arc<Self>, new_size: u64) -> Result<()> {
        self.check_data_op("truncate")?;
        let ss = self.fs.sectorsize();
        let old = self.size();
        if new_size == old {
            return Ok(());
        }
        if new_size > old {
            return self.extend_size(new_size);
        }
        let cut = ss.round_up(new_size);
        self.zero_range(new_size, cut.min(old))?;

        self.io_tree.lock_range(cut, u64::MAX);
        for oe in self.ordered.in_range(cut, u64::MAX) {
            oe.truncate(cut.saturating_sub(oe.file_offset));
        }
        self.io_tree.clear_bits(
            cut,
            u64::MAX,
            HANDOFF_CLEAR | RELEASE_ALL | ExtentBits::UPTODATE | ExtentBits::IOERR,
        );
        self.pages.drop_range(cut, u64::MAX);
        self.em_tree.drop_range(cut, u64::MAX, true);
        self.file_extent_tree
            .clear_bits(cut, u64::MAX, ExtentBits::DIRTY);

        let (root, ino) = (self.root.id(), self.ino());
        let committed = (|| -> Result<Vec<(u64, u64)>> {
            let mut h = self.fs.txn().start()?;
            let staged = (|| -> Result<Vec<(u64, u64)>> {
                let inline_removed = if new_size < ss.bytes() {
                    trim_inline(&mut h, root, ino, new_size)?
                } else {
                    0
                };
                let dropped = drop_file_extents(&mut h, root, ino, ss, cut, u64::MAX)?;
                self.adjust_nbytes(0, dropped.removed_bytes + inline_removed);
                self.set_size(new_size);
                self.update_disk_i_size();
                self.update_inode_item(&mut h)?;
                Ok(dropped.freed)
            })();
            match staged {
                Ok(freed) => {
                    h.end()?;
                    Ok(freed)
                }
                Err(err) => Err(h.abort(&format!("truncate of inode {}: {err}", ino.0))),
            }
        })();
        self.io_tree.unlock_range(cut, u64::MAX);
        self.acct.settle();
        let freed = committed?;
        self.fs.queue_pinned_frees(freed);
        self.insert_flags(InodeFlags::FULL_SYNC);
        debug!(target: "cfs::file", ino = ino.0, old, new_size, "truncated");
        Ok(())
    }

    /// Grow the file; the new bytes read as a hole.
    fn extend_size(self: &Arc<Self>, new_size: u64) -> Result<()> {
        let ss = self.fs.sectorsize();
        let old = self.size();
        let mut h = self.fs.txn().start()?;
        self.set_size(new_size);
        self.settle_range(ss.round_up(old), ss.round_up(new_size));
        if let Err(err) = self.update_inode_item(&mut h) {
            return Err(h.abort(&format!("extend of inode {}: {err}", self.ino().0)));
        }
        h.end()?;
        debug!(target: "cfs::file", ino = self.ino().0, old, new_size, "extended");
        Ok(())
    }

    // ── Preallocation ───────────────────────────────────────────────────────

    /// Preallocate `[offset, offset + len)` and extend the size to cover
    /// it. Holes get preallocated extents; existing data is untouched. When
    /// space runs out part way, the extents already allocated are kept and
    /// the size covers them.
    pub fn fallocate(self: &Arc<Self>, offset: u64, len: u64) -> Result<u64> {
        self.check_data_op("fallocate")?;
        if len == 0 {
            return Err(CfsError::InvalidArgument("fallocate of zero bytes".to_owned()));
        }
        let ss = self.fs.sectorsize();
        let req_end = offset
            .checked_add(len)
            .ok_or_else(|| CfsError::InvalidArgument("fallocate range overflows".to_owned()))?;
        let start = ss.round_down(offset);
        let end = ss.round_up(req_end);
        self.flush_range(start, end)?;
        self.wait_ordered(start, end - start);

        self.lock_and_wait_ordered(start, end);
        let mut allocated = 0_u64;
        let mut covered = start;
        let res = (|| -> Result<()> {
            let mut pos = start;
            while pos < end {
                let em = self.get_extent(pos)?;
                let run_end = em.end().min(end);
                if em.block_start == BlockStart::Hole {
                    let mut cur = pos;
                    while cur < run_end {
                        let len = self.insert_prealloc(cur, run_end - cur)?;
                        allocated += len;
                        cur += len;
                        covered = cur;
                    }
                }
                pos = run_end;
                covered = covered.max(pos);
            }
            Ok(())
        })();
        self.io_tree.unlock_range(start, end);

        let new_end = req_end.min(covered);
        if allocated > 0 {
            self.insert_flags(InodeFlags::PREALLOC);
        }
        if new_end > self.size() {
            self.extend_size(new_end)?;
        } else if allocated > 0 {
            self.persist_inode()?;
        }
        info!(
            target: "cfs::file",
            ino = self.ino().0,
            offset,
            len,
            allocated,
            partial = res.is_err(),
            "fallocate"
        );
        res.map(|()| allocated)
    }

    fn persist_inode(&self) -> Result<()> {
        let mut h = self.fs.txn().start()?;
        if let Err(err) = self.update_inode_item(&mut h) {
            return Err(h.abort(&format!("inode {} update: {err}", self.ino().0)));
        }
        h.end()
    }

    /// Allocate one preallocated extent at `start`, at most `len` bytes.
    /// Returns the bytes covered.
    fn insert_prealloc(self: &Arc<Self>, start: u64, len: u64) -> Result<u64> {
        let ss = self.fs.sectorsize();
        let alloc = Arc::clone(self.fs.alloc());
        let want = len.min(MAX_EXTENT_SIZE);
        let ext = alloc.reserve_extent(want, ss.bytes(), self.alloc_hint(start))?;
        alloc.dec_reservations(ext.start);
        let (root, ino) = (self.root.id(), self.ino());
        let end = start + ext.len;
        let mut h = match self.fs.txn().start() {
            Ok(h) => h,
            Err(err) => {
                if let Err(free_err) = alloc.free_reserved(ext.start, ext.len) {
                    error!(target: "cfs::alloc", start = ext.start, error = %free_err, "reservation leak");
                }
                return Err(err);
            }
        };
        let transid = h.transid().0;
        let item = FileExtentItem {
            generation: transid,
            ram_bytes: ext.len,
            compression: CompressionType::None,
            encryption: 0,
            other_encoding: 0,
            kind: FileExtentKind::Prealloc(DiskRef {
                disk_bytenr: ext.start,
                disk_num_bytes: ext.len,
                offset: 0,
                num_bytes: ext.len,
            }),
        };
        let staged = (|| -> Result<Vec<(u64, u64)>> {
            let dropped = drop_file_extents(&mut h, root, ino, ss, start, end)?;
            h.insert(TreeId::Fs(root), file_extent_key(ino, start), item.encode())?;
            add_extent_ref(&mut h, ext.start, ext.len, root.0, ino.0, start)?;
            self.adjust_nbytes(ext.len, dropped.removed_bytes);
            self.settle_range(start, end);
            self.update_inode_item(&mut h)?;
            Ok(dropped.freed)
        })();
        let freed = match staged {
            Ok(freed) => freed,
            Err(err) => {
                if let Err(free_err) = alloc.free_reserved(ext.start, ext.len) {
                    error!(target: "cfs::alloc", start = ext.start, error = %free_err, "reservation leak");
                }
                return Err(h.abort(&format!("prealloc for inode {}: {err}", ino.0)));
            }
        };
        h.end()?;
        alloc.convert_reserved_to_used(ext.len);
        self.fs.queue_pinned_frees(freed);
        self.em_tree.drop_range(start, end, false);
        self.pages.drop_range(start, end);
        trace!(
            target: "cfs::file",
            ino = ino.0,
            start,
            len = ext.len,
            disk_bytenr = ext.start,
            "prealloc extent"
        );
        Ok(ext.len)
    }

    // ── Hole punching ───────────────────────────────────────────────────────

    /// Deallocate `[offset, offset + len)`. Partial sectors at either end
    /// are zeroed; whole sectors lose their extents.
    pub fn punch_hole(self: &Arc<Self>, offset: u64, len: u64) -> Result<()> {
        self.check_data_op("punch_hole")?;
        let ss = self.fs.sectorsize();
        let size = self.size();
        let end = offset.saturating_add(len).min(size);
        if offset >= end {
            return Ok(());
        }
        let s = ss.round_up(offset);
        let e = ss.round_down(end);
        if s >= e {
            return self.zero_range(offset, end);
        }
        self.zero_range(offset, s)?;
        self.zero_range(e, end)?;

        self.flush_range(s, e)?;
        self.wait_ordered(s, e - s);
        self.lock_and_wait_ordered(s, e);
        self.io_tree
            .clear_bits(s, e, HANDOFF_CLEAR | RELEASE_ALL | ExtentBits::UPTODATE);
        self.pages.drop_range(s, e);
        self.em_tree.drop_range(s, e, false);
        let (root, ino) = (self.root.id(), self.ino());
        let committed = (|| -> Result<Vec<(u64, u64)>> {
            let mut h = self.fs.txn().start()?;
            let staged = (|| -> Result<Vec<(u64, u64)>> {
                let dropped = drop_file_extents(&mut h, root, ino, ss, s, e)?;
                self.adjust_nbytes(0, dropped.removed_bytes);
                self.settle_range(s, e);
                self.update_inode_item(&mut h)?;
                Ok(dropped.freed)
            })();
            match staged {
                Ok(freed) => {
                    h.end()?;
                    Ok(freed)
                }
                Err(err) => Err(h.abort(&format!("punch hole in inode {}: {err}", ino.0))),
            }
        })();
        self.io_tree.unlock_range(s, e);
        self.acct.settle();
        self.fs.queue_pinned_frees(committed?);
        self.insert_flags(InodeFlags::FULL_SYNC);
        debug!(target: "cfs::file", ino = ino.0, start = s, end = e, "hole punched");
        Ok(())
    }

    // ── Defragmentation ─────────────────────────────────────────────────────

    /// Rewrite runs of adjacent extents shorter than `extent_thresh` inside
    /// `[offset, offset + len)` so they are reallocated contiguously.
    /// Returns the number of runs rewritten. Shared extents are rewritten
    /// too; the copy becomes private to this inode.
    pub fn defrag_range(self: &Arc<Self>, offset: u64, len: u64, extent_thresh: u64) -> Result<usize> {
        self.check_data_op("defrag")?;
        let ss = self.fs.sectorsize();
        let end = ss.round_up(offset.saturating_add(len).min(self.size()));
        let start = ss.round_down(offset);
        if start >= end {
            return Ok(0);
        }
        self.flush_range(start, end)?;
        self.wait_ordered(start, end - start);

        let mut runs: Vec<(u64, u64, usize)> = Vec::new();
        let mut pos = start;
        while pos < end {
            let em = self.get_extent(pos)?;
            let run_end = em.end().min(end);
            let small = matches!(em.block_start, BlockStart::Disk(_))
                && !em.is_prealloc()
                && em.len < extent_thresh;
            if small {
                match runs.last_mut() {
                    Some((_, e, count)) if *e == pos => {
                        *e = run_end;
                        *count += 1;
                    }
                    _ => runs.push((pos, run_end, 1)),
                }
            }
            pos = run_end;
        }
        // A single extent gains nothing from being moved.
        runs.retain(|&(_, _, count)| count > 1);

        for &(s, e, _) in &runs {
            let data = self.read_data(s, e - s)?;
            self.buffered_write(s, &data, ExtentBits::DEFRAG)?;
        }
        if !runs.is_empty() {
            self.flush_range(start, end)?;
        }
        debug!(
            target: "cfs::file",
            ino = self.ino().0,
            start,
            end,
            runs = runs.len(),
            "defragmented"
        );
        Ok(runs.len())
    }

    // ── Durability ──────────────────────────────────────────────────────────

    /// Write back all dirty data, wait for it and commit. Reports the
    /// latest write error not yet seen through `since`.
    pub fn fsync(self: &Arc<Self>, since: &mut u64) -> Result<()> {
        if let Err(err) = self.flush() {
            debug!(target: "cfs::file", ino = self.ino().0, error = %err, "fsync flush failed");
        }
        self.wait_ordered(0, u64::MAX);
        self.fs.commit()?;
        self.remove_flags(InodeFlags::FULL_SYNC);
        self.mapping_error.check(since)
    }
}

// ── File handles ────────────────────────────────────────────────────────────

/// An open file. Each handle samples the inode's write-error sequence at
/// open, so every handle sees each write failure once.
#[derive(Debug)]
pub struct FileHandle {
    inode: Arc<Inode>,
    since: u64,
}

impl FileHandle {
    #[must_use]
    pub fn new(inode: Arc<Inode>) -> Self {
        let since = inode.mapping_error().sample();
        Self { inode, since }
    }

    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.inode.read(offset, len)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.inode.write(offset, data)
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.inode.truncate(size)
    }

    pub fn fallocate(&self, offset: u64, len: u64) -> Result<u64> {
        self.inode.fallocate(offset, len)
    }

    pub fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        self.inode.punch_hole(offset, len)
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.inode.fsync(&mut self.since)
    }

    /// Start writeback and wait for it without committing.
    pub fn flush(&mut self) -> Result<()> {
        if let Err(err) = self.inode.flush() {
            debug!(target: "cfs::file", ino = self.inode.ino().0, error = %err, "flush failed");
        }
        self.inode.wait_ordered(0, u64::MAX);
        self.inode.mapping_error().check(&mut self.since)
    }

    /// Flush and report any write error this handle has not seen.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}
