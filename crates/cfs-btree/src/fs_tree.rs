//! Inode, file extent and root item access.

use crate::items::{FileExtentItem, InodeItem, RootItem};
use crate::transaction::TransHandle;
use crate::{ItemReader, Key, TreeId, item_type, parse_to_cfs_error};
use cfs_error::Result;
use cfs_types::{InodeNumber, RootId};

#[must_use]
pub fn inode_key(ino: InodeNumber) -> Key {
    Key::new(ino.0, item_type::INODE_ITEM, 0)
}

#[must_use]
pub fn file_extent_key(ino: InodeNumber, offset: u64) -> Key {
    Key::new(ino.0, item_type::EXTENT_DATA, offset)
}

#[must_use]
pub fn root_key(root: RootId) -> Key {
    Key::new(root.0, item_type::ROOT_ITEM, 0)
}

pub fn read_inode<R: ItemReader + ?Sized>(
    reader: &R,
    root: RootId,
    ino: InodeNumber,
) -> Result<Option<InodeItem>> {
    reader
        .get_item(TreeId::Fs(root), &inode_key(ino))
        .map(|data| InodeItem::parse(&data).map_err(|e| parse_to_cfs_error(&e)))
        .transpose()
}

pub fn write_inode(
    h: &mut TransHandle,
    root: RootId,
    ino: InodeNumber,
    item: &InodeItem,
) -> Result<()> {
    h.update(TreeId::Fs(root), inode_key(ino), item.encode())
}

pub fn read_root<R: ItemReader + ?Sized>(reader: &R, root: RootId) -> Result<Option<RootItem>> {
    reader
        .get_item(TreeId::Root, &root_key(root))
        .map(|data| RootItem::parse(&data).map_err(|e| parse_to_cfs_error(&e)))
        .transpose()
}

pub fn write_root(h: &mut TransHandle, root: RootId, item: &RootItem) -> Result<()> {
    h.update(TreeId::Root, root_key(root), item.encode())
}

/// Every root item, in id order.
pub fn list_roots<R: ItemReader + ?Sized>(reader: &R) -> Result<Vec<(RootId, RootItem)>> {
    reader
        .range_items(TreeId::Root, &Key::MIN, &Key::MAX)
        .into_iter()
        .filter(|(k, _)| k.item_type == item_type::ROOT_ITEM)
        .map(|(k, data)| {
            RootItem::parse(&data)
                .map(|item| (RootId(k.objectid), item))
                .map_err(|e| parse_to_cfs_error(&e))
        })
        .collect()
}

/// Every inode item in a root, in inode order.
pub fn list_inodes<R: ItemReader + ?Sized>(
    reader: &R,
    root: RootId,
) -> Result<Vec<(InodeNumber, InodeItem)>> {
    reader
        .range_items(TreeId::Fs(root), &Key::MIN, &Key::MAX)
        .into_iter()
        .filter(|(k, _)| k.item_type == item_type::INODE_ITEM)
        .map(|(k, data)| {
            InodeItem::parse(&data)
                .map(|item| (InodeNumber(k.objectid), item))
                .map_err(|e| parse_to_cfs_error(&e))
        })
        .collect()
}

fn parse_extent(key: Key, data: &[u8]) -> Result<(u64, FileExtentItem)> {
    FileExtentItem::parse(data)
        .map(|item| (key.offset, item))
        .map_err(|e| parse_to_cfs_error(&e))
}

/// The file extent item covering `offset`, if any.
pub fn lookup_file_extent<R: ItemReader + ?Sized>(
    reader: &R,
    root: RootId,
    ino: InodeNumber,
    offset: u64,
) -> Result<Option<(u64, FileExtentItem)>> {
    let Some((key, data)) = reader.prev_item(TreeId::Fs(root), &file_extent_key(ino, offset))
    else {
        return Ok(None);
    };
    if key.objectid != ino.0 || key.item_type != item_type::EXTENT_DATA {
        return Ok(None);
    }
    let (start, item) = parse_extent(key, &data)?;
    if start.saturating_add(item.num_bytes()) > offset {
        Ok(Some((start, item)))
    } else {
        Ok(None)
    }
}

/// File extent items overlapping `[start, end)`, in offset order.
pub fn file_extents_in_range<R: ItemReader + ?Sized>(
    reader: &R,
    root: RootId,
    ino: InodeNumber,
    start: u64,
    end: u64,
) -> Result<Vec<(u64, FileExtentItem)>> {
    let mut out = Vec::new();
    if end <= start {
        return Ok(out);
    }
    if let Some(first) = lookup_file_extent(reader, root, ino, start)? {
        if first.0 < start {
            out.push(first);
        }
    }
    for (key, data) in reader.range_items(
        TreeId::Fs(root),
        &file_extent_key(ino, start),
        &file_extent_key(ino, end - 1),
    ) {
        out.push(parse_extent(key, &data)?);
    }
    Ok(out)
}

/// The first file extent item starting at or after `offset`.
pub fn next_file_extent<R: ItemReader + ?Sized>(
    reader: &R,
    root: RootId,
    ino: InodeNumber,
    offset: u64,
) -> Result<Option<(u64, FileExtentItem)>> {
    reader
        .range_items(
            TreeId::Fs(root),
            &file_extent_key(ino, offset),
            &file_extent_key(ino, u64::MAX),
        )
        .into_iter()
        .next()
        .map(|(key, data)| parse_extent(key, &data))
        .transpose()
}
