//! No-COW eligibility and the in-place write path.
//!
//! A delalloc range of a `NODATACOW` or `PREALLOC` inode may overwrite its
//! existing extent only when nothing else can observe the old bytes. Every
//! check below is conservative: when in doubt the range is COWed.

use crate::inode::{Inode, InodeFlags};
use crate::ordered::{NewOrdered, OrderedKind};
use cfs_btree::ItemReader;
use cfs_btree::backref::has_cross_refs;
use cfs_btree::csum::csum_exists;
use cfs_btree::fs_tree::{lookup_file_extent, next_file_extent};
use cfs_btree::items::{DiskRef, FileExtentKind};
use cfs_error::Result;
use cfs_extent::{BlockStart, ExtentBits, ExtentMap, ExtentMapFlags};
use cfs_types::{CompressionType, InodeNumber, RootId, SectorSize};
use std::sync::Arc;
use tracing::{debug, trace};

/// What the eligibility check needs to know about the inode and its root.
#[derive(Debug, Clone, Copy)]
pub struct NocowCtx {
    pub root: RootId,
    pub ino: InodeNumber,
    pub sectorsize: SectorSize,
    pub last_snapshot: u64,
    pub pending_snapshots: u32,
    /// Existing checksums do not force COW.
    pub csum_exempt: bool,
    pub inode_nodatacow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NocowVerdict {
    Safe,
    MustCow,
}

/// The extent a safe range would overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NocowExtent {
    pub key_offset: u64,
    pub disk: DiskRef,
    pub prealloc: bool,
    pub generation: u64,
}

impl NocowExtent {
    /// Physical address of file byte `offset`.
    #[must_use]
    pub fn bytenr_at(&self, offset: u64) -> u64 {
        self.disk.disk_bytenr + self.disk.offset + (offset - self.key_offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NocowCheck {
    pub verdict: NocowVerdict,
    /// Bytes from the queried offset the verdict covers.
    pub len: u64,
    pub extent: Option<NocowExtent>,
}

impl NocowCheck {
    fn must_cow(len: u64) -> Self {
        Self {
            verdict: NocowVerdict::MustCow,
            len,
            extent: None,
        }
    }
}

/// Decide whether the first part of `[offset, offset + len)` can be written
/// in place.
pub fn check_nocow<R: ItemReader + ?Sized>(
    reader: &R,
    ctx: &NocowCtx,
    offset: u64,
    len: u64,
    is_readonly: impl Fn(u64) -> bool,
) -> Result<NocowCheck> {
    let end = offset.saturating_add(len);
    let Some((key_offset, item)) = lookup_file_extent(reader, ctx.root, ctx.ino, offset)? else {
        let gap_end = next_file_extent(reader, ctx.root, ctx.ino, offset)?
            .map_or(end, |(next, _)| next.min(end));
        return Ok(NocowCheck::must_cow(gap_end - offset));
    };
    let item_end = key_offset + item.num_bytes();
    let covered = item_end.min(end) - offset;
    let (disk, prealloc) = match item.kind {
        FileExtentKind::Inline(_) => return Ok(NocowCheck::must_cow(covered)),
        FileExtentKind::Regular(d) => (d, false),
        FileExtentKind::Prealloc(d) => (d, true),
    };
    let extent = NocowExtent {
        key_offset,
        disk,
        prealloc,
        generation: item.generation,
    };
    let reason = if !prealloc && !ctx.inode_nodatacow {
        Some("regular extent without nodatacow")
    } else if disk.is_hole() {
        Some("hole")
    } else if item.is_encoded() {
        Some("encoded extent")
    } else if ctx.pending_snapshots > 0 {
        Some("snapshot pending")
    } else if is_readonly(disk.disk_bytenr) {
        Some("read-only block group")
    } else if has_cross_refs(
        reader,
        disk.disk_bytenr,
        ctx.root.0,
        ctx.ino.0,
        key_offset.wrapping_sub(disk.offset),
    )? {
        // An extent from before the last snapshot is shared with it only if
        // a back-reference says so.
        if extent.generation <= ctx.last_snapshot {
            Some("shared with snapshot")
        } else {
            Some("shared extent")
        }
    } else if !ctx.csum_exempt
        && csum_exists(reader, ctx.sectorsize, extent.bytenr_at(offset), covered)?
    {
        Some("checksums present")
    } else {
        None
    };
    if let Some(reason) = reason {
        trace!(target: "cfs::nocow", ino = ctx.ino.0, offset, len = covered, reason, "must cow");
        return Ok(NocowCheck::must_cow(covered));
    }
    Ok(NocowCheck {
        verdict: NocowVerdict::Safe,
        len: covered,
        extent: Some(extent),
    })
}

impl Inode {
    pub(crate) fn nocow_ctx(&self) -> NocowCtx {
        let flags = self.flags();
        NocowCtx {
            root: self.root.id(),
            ino: self.ino(),
            sectorsize: self.fs.sectorsize(),
            last_snapshot: self.root.last_snapshot(),
            pending_snapshots: self.root.pending_snapshots(),
            csum_exempt: flags.intersects(InodeFlags::NODATASUM | InodeFlags::NODATACOW),
            inode_nodatacow: flags.contains(InodeFlags::NODATACOW),
        }
    }

    /// Whether all of `[start, end)` could be written in place right now.
    pub(crate) fn can_nocow_range(&self, start: u64, end: u64) -> Result<bool> {
        let ctx = self.nocow_ctx();
        let store = self.fs.txn().store();
        let alloc = self.fs.alloc();
        let mut cur = start;
        while cur < end {
            let check = check_nocow(&**store, &ctx, cur, end - cur, |b| alloc.is_readonly(b))?;
            if check.verdict == NocowVerdict::MustCow || check.len == 0 {
                return Ok(false);
            }
            cur += check.len;
        }
        Ok(true)
    }

    /// Write back `[start, end)` in place where possible, COWing the rest.
    /// The range is locked by the caller.
    pub(crate) fn run_delalloc_nocow(self: &Arc<Self>, start: u64, end: u64) -> Result<()> {
        let ctx = self.nocow_ctx();
        let alloc = Arc::clone(self.fs.alloc());
        let mut cur = start;
        let mut cow_start: Option<u64> = None;
        while cur < end {
            let check = {
                let store = self.fs.txn().store();
                check_nocow(&**store, &ctx, cur, end - cur, |b| alloc.is_readonly(b))?
            };
            let extent = match (check.verdict, check.extent) {
                (NocowVerdict::Safe, Some(extent))
                    if alloc.inc_nocow_writers(extent.disk.disk_bytenr) =>
                {
                    extent
                }
                _ => {
                    cow_start.get_or_insert(cur);
                    cur += check.len.max(1);
                    continue;
                }
            };
            let len = check.len;
            if let Some(cs) = cow_start.take() {
                if let Err(err) = self.cow_file_range(cs, cur) {
                    alloc.dec_nocow_writers(extent.disk.disk_bytenr);
                    return Err(err);
                }
            }
            let res = self.start_nocow_extent(cur, len, &extent);
            alloc.dec_nocow_writers(extent.disk.disk_bytenr);
            res?;
            cur += len;
        }
        if let Some(cs) = cow_start {
            self.cow_file_range(cs, end)?;
        }
        Ok(())
    }

    fn start_nocow_extent(self: &Arc<Self>, start: u64, len: u64, extent: &NocowExtent) -> Result<()> {
        let end = start + len;
        let bytenr = extent.bytenr_at(start);
        let kind = if extent.prealloc {
            OrderedKind::Prealloc
        } else {
            OrderedKind::Nocow
        };
        if extent.prealloc {
            let em = ExtentMap {
                start,
                len,
                block_start: BlockStart::Disk(bytenr),
                block_len: len,
                orig_start: extent.key_offset.wrapping_sub(extent.disk.offset),
                orig_block_len: extent.disk.disk_num_bytes,
                ram_bytes: len,
                compression: CompressionType::None,
                generation: extent.generation,
                flags: ExtentMapFlags::PINNED | ExtentMapFlags::PREALLOC | ExtentMapFlags::FILLING,
            };
            self.em_tree.add_with_retry(em, true)?;
        }
        let oe = self.add_ordered(NewOrdered {
            file_offset: start,
            num_bytes: len,
            ram_bytes: len,
            disk_bytenr: bytenr,
            disk_num_bytes: len,
            compression: CompressionType::None,
            kind,
        })?;
        self.io_tree.clear_bits(
            start,
            end,
            ExtentBits::DELALLOC
                | ExtentBits::DELALLOC_NEW
                | ExtentBits::DEFRAG
                | ExtentBits::NORESERVE
                | ExtentBits::CLEAR_DATA_RESV,
        );
        debug!(
            target: "cfs::nocow",
            ino = self.ino().0,
            start,
            len,
            bytenr,
            prealloc = extent.prealloc,
            "in-place write"
        );
        let data = self.pages.capture_for_writeback(start, end);
        self.ops().submitter().submit(self, &oe, data);
        Ok(())
    }
}
