//! File extent item surgery inside a transaction.
//!
//! Items that straddle a dropped range are split; both kept pieces keep the
//! `(root, ino, key_offset - extent_offset)` back-reference tuple of the
//! original, so splitting bumps that tuple's count instead of adding a new
//! one. Extents whose last reference goes away lose their checksums and are
//! handed back to the caller to be freed once the transaction commits.

use cfs_btree::backref::{add_extent_ref, drop_extent_ref};
use cfs_btree::csum::delete_csums;
use cfs_btree::fs_tree::{file_extent_key, file_extents_in_range, lookup_file_extent};
use cfs_btree::items::{DiskRef, FileExtentItem, FileExtentKind};
use cfs_btree::{TransHandle, TreeId, parse_to_cfs_error};
use cfs_error::Result;
use cfs_types::{CompressionType, InodeNumber, RootId, SectorSize, u64_to_usize};
use tracing::trace;

/// Result of [`drop_file_extents`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DroppedExtents {
    /// `(bytenr, disk_len)` of extents that lost their last reference.
    pub freed: Vec<(u64, u64)>,
    /// File bytes of allocated (non-hole) extents no longer referenced.
    pub removed_bytes: u64,
}

fn with_disk(item: &FileExtentItem, disk: DiskRef) -> FileExtentItem {
    let kind = match item.kind {
        FileExtentKind::Prealloc(_) => FileExtentKind::Prealloc(disk),
        _ => FileExtentKind::Regular(disk),
    };
    FileExtentItem {
        kind,
        ..item.clone()
    }
}

fn ref_offset(key_offset: u64, disk: &DiskRef) -> u64 {
    key_offset.wrapping_sub(disk.offset)
}

/// Remove file extent coverage of `[start, end)` for `ino`.
pub fn drop_file_extents(
    h: &mut TransHandle,
    root: RootId,
    ino: InodeNumber,
    ss: SectorSize,
    start: u64,
    end: u64,
) -> Result<DroppedExtents> {
    let mut out = DroppedExtents::default();
    let tree = TreeId::Fs(root);
    for (key_offset, item) in file_extents_in_range(&*h, root, ino, start, end)? {
        let item_end = key_offset.saturating_add(item.num_bytes());
        match &item.kind {
            FileExtentKind::Inline(_) => {
                if start <= key_offset {
                    h.delete(tree, file_extent_key(ino, key_offset))?;
                    out.removed_bytes += item.ram_bytes;
                } else {
                    let kept = start - key_offset;
                    out.removed_bytes += trim_inline_item(h, root, ino, key_offset, &item, kept)?;
                }
            }
            FileExtentKind::Regular(d) | FileExtentKind::Prealloc(d) => {
                let d = *d;
                let tuple = ref_offset(key_offset, &d);
                h.delete(tree, file_extent_key(ino, key_offset))?;
                if key_offset < start {
                    let front = DiskRef {
                        num_bytes: start - key_offset,
                        ..d
                    };
                    h.insert(tree, file_extent_key(ino, key_offset), with_disk(&item, front).encode())?;
                    if !d.is_hole() {
                        add_extent_ref(h, d.disk_bytenr, d.disk_num_bytes, root.0, ino.0, tuple)?;
                    }
                }
                if item_end > end {
                    let back = DiskRef {
                        offset: d.offset + (end - key_offset),
                        num_bytes: item_end - end,
                        ..d
                    };
                    h.insert(tree, file_extent_key(ino, end), with_disk(&item, back).encode())?;
                    if !d.is_hole() {
                        add_extent_ref(h, d.disk_bytenr, d.disk_num_bytes, root.0, ino.0, tuple)?;
                    }
                }
                if d.is_hole() {
                    continue;
                }
                out.removed_bytes += item_end.min(end) - key_offset.max(start);
                if let Some(len) = drop_extent_ref(h, d.disk_bytenr, root.0, ino.0, tuple)? {
                    delete_csums(h, ss, d.disk_bytenr, len)?;
                    out.freed.push((d.disk_bytenr, len));
                }
            }
        }
    }
    trace!(
        target: "cfs::extent",
        ino = ino.0,
        start,
        end,
        freed = out.freed.len(),
        removed = out.removed_bytes,
        "file extents dropped"
    );
    Ok(out)
}

/// Shorten an inline item to its first `kept` bytes. Returns the bytes
/// removed.
fn trim_inline_item(
    h: &mut TransHandle,
    root: RootId,
    ino: InodeNumber,
    key_offset: u64,
    item: &FileExtentItem,
    kept: u64,
) -> Result<u64> {
    let FileExtentKind::Inline(payload) = &item.kind else {
        return Ok(0);
    };
    if kept >= item.ram_bytes {
        return Ok(0);
    }
    let mut data = if item.compression.is_compressed() {
        cfs_compress::decompress(
            item.compression,
            payload,
            u64_to_usize(item.ram_bytes, "inline ram_bytes").map_err(|e| parse_to_cfs_error(&e))?,
        )?
    } else {
        payload.clone()
    };
    data.truncate(u64_to_usize(kept, "inline length").map_err(|e| parse_to_cfs_error(&e))?);
    let trimmed = FileExtentItem {
        ram_bytes: kept,
        compression: CompressionType::None,
        kind: FileExtentKind::Inline(data),
        ..item.clone()
    };
    h.update(TreeId::Fs(root), file_extent_key(ino, key_offset), trimmed.encode())?;
    Ok(item.ram_bytes - kept)
}

/// Cut the inline item at offset 0 down to `new_size` bytes. Returns the
/// bytes removed.
pub fn trim_inline(
    h: &mut TransHandle,
    root: RootId,
    ino: InodeNumber,
    new_size: u64,
) -> Result<u64> {
    match lookup_file_extent(&*h, root, ino, 0)? {
        Some((0, item)) if matches!(item.kind, FileExtentKind::Inline(_)) => {
            if new_size == 0 {
                h.delete(TreeId::Fs(root), file_extent_key(ino, 0))?;
                return Ok(item.ram_bytes);
            }
            trim_inline_item(h, root, ino, 0, &item, new_size)
        }
        _ => Ok(0),
    }
}

/// Convert the preallocated coverage of `[start, end)` into regular
/// extents, splitting prealloc items at the boundaries.
pub fn mark_extent_written(
    h: &mut TransHandle,
    root: RootId,
    ino: InodeNumber,
    start: u64,
    end: u64,
    transid: u64,
) -> Result<()> {
    let tree = TreeId::Fs(root);
    for (key_offset, item) in file_extents_in_range(&*h, root, ino, start, end)? {
        let FileExtentKind::Prealloc(d) = item.kind else {
            continue;
        };
        let item_end = key_offset + d.num_bytes;
        let mid_start = key_offset.max(start);
        let mid_end = item_end.min(end);
        let tuple = ref_offset(key_offset, &d);
        h.delete(tree, file_extent_key(ino, key_offset))?;
        let mut pieces = 0_u32;
        if key_offset < mid_start {
            let front = DiskRef {
                num_bytes: mid_start - key_offset,
                ..d
            };
            h.insert(tree, file_extent_key(ino, key_offset), with_disk(&item, front).encode())?;
            pieces += 1;
        }
        let written = FileExtentItem {
            generation: transid,
            kind: FileExtentKind::Regular(DiskRef {
                offset: d.offset + (mid_start - key_offset),
                num_bytes: mid_end - mid_start,
                ..d
            }),
            ..item.clone()
        };
        h.insert(tree, file_extent_key(ino, mid_start), written.encode())?;
        pieces += 1;
        if mid_end < item_end {
            let back = DiskRef {
                offset: d.offset + (mid_end - key_offset),
                num_bytes: item_end - mid_end,
                ..d
            };
            h.insert(tree, file_extent_key(ino, mid_end), with_disk(&item, back).encode())?;
            pieces += 1;
        }
        for _ in 1..pieces {
            add_extent_ref(h, d.disk_bytenr, d.disk_num_bytes, root.0, ino.0, tuple)?;
        }
        trace!(
            target: "cfs::extent",
            ino = ino.0,
            start = mid_start,
            end = mid_end,
            pieces,
            "prealloc extent written"
        );
    }
    Ok(())
}
