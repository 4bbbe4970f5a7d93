//! Extent back-references.
//!
//! Every allocated data extent has one `ExtentItem` recording which
//! `(root, inode, file_pos - extent_offset)` tuples point at it. A file
//! extent item that is split in two keeps the same tuple, so the count for
//! that tuple goes up rather than a new entry appearing.

use crate::items::{ExtentItem, ExtentRef};
use crate::transaction::TransHandle;
use crate::{ItemReader, Key, TreeId, item_type, parse_to_cfs_error};
use cfs_error::{CfsError, Result};
use tracing::trace;

fn extent_key(bytenr: u64, disk_len: u64) -> Key {
    Key::new(bytenr, item_type::EXTENT_ITEM, disk_len)
}

/// The extent item starting at `bytenr` and its on-disk length.
pub fn lookup_extent<R: ItemReader + ?Sized>(
    reader: &R,
    bytenr: u64,
) -> Result<Option<(u64, ExtentItem)>> {
    let found = reader
        .range_items(
            TreeId::Extent,
            &extent_key(bytenr, 0),
            &extent_key(bytenr, u64::MAX),
        )
        .into_iter()
        .next();
    match found {
        Some((key, data)) => {
            let item = ExtentItem::parse(&data).map_err(|e| parse_to_cfs_error(&e))?;
            Ok(Some((key.offset, item)))
        }
        None => Ok(None),
    }
}

/// Add one reference from `(root, ino, offset)`, creating the extent item
/// on first use.
pub fn add_extent_ref(
    h: &mut TransHandle,
    bytenr: u64,
    disk_len: u64,
    root: u64,
    ino: u64,
    offset: u64,
) -> Result<()> {
    let (len, mut item) = lookup_extent(&*h, bytenr)?.unwrap_or_else(|| {
        (
            disk_len,
            ExtentItem {
                generation: h.transid().0,
                disk_num_bytes: disk_len,
                refs: Vec::new(),
            },
        )
    });
    if let Some(r) = item
        .refs
        .iter_mut()
        .find(|r| r.root == root && r.ino == ino && r.offset == offset)
    {
        r.count += 1;
    } else {
        item.refs.push(ExtentRef {
            root,
            ino,
            offset,
            count: 1,
        });
    }
    trace!(bytenr, root, ino, offset, refs = item.total_refs(), "extent ref added");
    h.update(TreeId::Extent, extent_key(bytenr, len), item.encode())
}

/// Drop one reference. Returns the extent's disk length when this was the
/// last reference and the extent item is gone.
pub fn drop_extent_ref(
    h: &mut TransHandle,
    bytenr: u64,
    root: u64,
    ino: u64,
    offset: u64,
) -> Result<Option<u64>> {
    let (len, mut item) = lookup_extent(&*h, bytenr)?
        .ok_or_else(|| CfsError::NotFound(format!("extent item {bytenr}")))?;
    let idx = item
        .refs
        .iter()
        .position(|r| r.root == root && r.ino == ino && r.offset == offset)
        .ok_or_else(|| {
            CfsError::NotFound(format!(
                "backref ({root}, {ino}, {offset}) on extent {bytenr}"
            ))
        })?;
    item.refs[idx].count -= 1;
    if item.refs[idx].count == 0 {
        item.refs.remove(idx);
    }
    if item.refs.is_empty() {
        h.delete(TreeId::Extent, extent_key(bytenr, len))?;
        trace!(bytenr, len, "last extent ref dropped");
        return Ok(Some(len));
    }
    h.update(TreeId::Extent, extent_key(bytenr, len), item.encode())?;
    Ok(None)
}

/// Whether anything other than `(root, ino, offset)` references the
/// extent at `bytenr`.
pub fn has_cross_refs<R: ItemReader + ?Sized>(
    reader: &R,
    bytenr: u64,
    root: u64,
    ino: u64,
    offset: u64,
) -> Result<bool> {
    Ok(lookup_extent(reader, bytenr)?.is_some_and(|(_, item)| {
        item.refs
            .iter()
            .any(|r| r.root != root || r.ino != ino || r.offset != offset)
    }))
}
