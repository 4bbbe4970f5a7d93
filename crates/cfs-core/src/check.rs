//! Offline cross-check of committed metadata.
//!
//! Every checksummed data extent a file extent item points at must have a
//! checksum for each of its sectors, and every stored checksum must fall
//! inside an allocated extent. File extent items must be backed by an
//! extent item carrying their back-reference. A commit that fails part way
//! leaves the previous image in place, so a crash never breaks these
//! rules.

use cfs_btree::backref::lookup_extent;
use cfs_btree::csum::lookup_csums;
use cfs_btree::fs_tree::{file_extents_in_range, list_inodes, list_roots};
use cfs_btree::items::{CsumItem, ExtentItem, FileExtentKind, inode_flags};
use cfs_btree::{ItemReader, Key, TreeId, item_type, parse_to_cfs_error};
use cfs_error::Result;
use cfs_types::{InodeNumber, RootId, SectorSize};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    /// A checksummed data sector has no checksum.
    MissingCsum {
        root: u64,
        ino: u64,
        file_offset: u64,
        bytenr: u64,
    },
    /// A checksum lies outside every allocated extent.
    OrphanCsum { bytenr: u64 },
    /// A file extent item has no matching back-reference.
    MissingBackref {
        root: u64,
        ino: u64,
        file_offset: u64,
        bytenr: u64,
    },
    /// An extent item nothing refers to.
    UnreferencedExtent { bytenr: u64, len: u64 },
    /// Two extent items share bytes.
    OverlappingExtents { bytenr: u64, prev_end: u64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub roots: usize,
    pub inodes: usize,
    pub file_extents: usize,
    pub extents: usize,
    pub csum_sectors: u64,
    pub problems: Vec<Inconsistency>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Allocated extents as sorted `(start, len)` pairs.
fn load_extents<R: ItemReader + ?Sized>(
    reader: &R,
    report: &mut ConsistencyReport,
) -> Result<Vec<(u64, u64)>> {
    let mut extents: Vec<(u64, u64)> = Vec::new();
    for (key, data) in reader.range_items(TreeId::Extent, &Key::MIN, &Key::MAX) {
        if key.item_type != item_type::EXTENT_ITEM {
            continue;
        }
        let item = ExtentItem::parse(&data).map_err(|e| parse_to_cfs_error(&e))?;
        let (bytenr, len) = (key.objectid, key.offset);
        if item.total_refs() == 0 {
            report
                .problems
                .push(Inconsistency::UnreferencedExtent { bytenr, len });
        }
        if let Some(&(prev, prev_len)) = extents.last() {
            if prev + prev_len > bytenr {
                report.problems.push(Inconsistency::OverlappingExtents {
                    bytenr,
                    prev_end: prev + prev_len,
                });
            }
        }
        extents.push((bytenr, len));
    }
    report.extents = extents.len();
    Ok(extents)
}

fn inside_extent(extents: &[(u64, u64)], bytenr: u64) -> bool {
    let idx = extents.partition_point(|&(start, _)| start <= bytenr);
    idx > 0 && {
        let (start, len) = extents[idx - 1];
        bytenr < start + len
    }
}

fn check_inode<R: ItemReader + ?Sized>(
    reader: &R,
    ss: SectorSize,
    root: RootId,
    ino: InodeNumber,
    datasum: bool,
    report: &mut ConsistencyReport,
) -> Result<()> {
    for (file_offset, item) in file_extents_in_range(reader, root, ino, 0, u64::MAX)? {
        report.file_extents += 1;
        let (disk, regular) = match &item.kind {
            FileExtentKind::Inline(_) => continue,
            FileExtentKind::Regular(d) => (d, true),
            FileExtentKind::Prealloc(d) => (d, false),
        };
        if disk.is_hole() {
            continue;
        }
        let tuple = file_offset.wrapping_sub(disk.offset);
        let has_ref = lookup_extent(reader, disk.disk_bytenr)?.is_some_and(|(_, extent)| {
            extent
                .refs
                .iter()
                .any(|r| r.root == root.0 && r.ino == ino.0 && r.offset == tuple)
        });
        if !has_ref {
            report.problems.push(Inconsistency::MissingBackref {
                root: root.0,
                ino: ino.0,
                file_offset,
                bytenr: disk.disk_bytenr,
            });
        }
        if !regular || !datasum {
            continue;
        }
        let (bytenr, len) = if item.compression.is_compressed() {
            (disk.disk_bytenr, disk.disk_num_bytes)
        } else {
            (disk.disk_bytenr + disk.offset, ss.round_up(disk.num_bytes))
        };
        let sums = lookup_csums(reader, ss, bytenr, len)?;
        if let Some(missing) = sums.iter().position(Option::is_none) {
            report.problems.push(Inconsistency::MissingCsum {
                root: root.0,
                ino: ino.0,
                file_offset,
                bytenr: bytenr + (missing as u64) * ss.bytes(),
            });
        }
    }
    Ok(())
}

/// Cross-check the file extent, extent and checksum trees.
pub fn check_metadata<R: ItemReader + ?Sized>(
    reader: &R,
    ss: SectorSize,
) -> Result<ConsistencyReport> {
    let mut report = ConsistencyReport::default();
    let extents = load_extents(reader, &mut report)?;

    for (root, _) in list_roots(reader)? {
        report.roots += 1;
        for (ino, item) in list_inodes(reader, root)? {
            report.inodes += 1;
            let datasum = item.flags & inode_flags::NODATASUM == 0;
            check_inode(reader, ss, root, ino, datasum, &mut report)?;
        }
    }

    for (key, data) in reader.range_items(TreeId::Csum, &Key::MIN, &Key::MAX) {
        if key.item_type != item_type::EXTENT_CSUM {
            continue;
        }
        let item = CsumItem::parse(&data).map_err(|e| parse_to_cfs_error(&e))?;
        report.csum_sectors += item.sums.len() as u64;
        let orphan = (0..item.sums.len() as u64)
            .map(|i| key.offset + i * ss.bytes())
            .find(|&sector| !inside_extent(&extents, sector));
        if let Some(bytenr) = orphan {
            report.problems.push(Inconsistency::OrphanCsum { bytenr });
        }
    }

    if report.is_clean() {
        debug!(
            target: "cfs::check",
            roots = report.roots,
            inodes = report.inodes,
            extents = report.extents,
            "metadata consistent"
        );
    } else {
        warn!(target: "cfs::check", problems = report.problems.len(), "metadata inconsistent");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inside_extent_uses_half_open_ranges() {
        let extents = [(4096, 8192), (65536, 4096)];
        assert!(!inside_extent(&extents, 0));
        assert!(inside_extent(&extents, 4096));
        assert!(inside_extent(&extents, 8192));
        assert!(!inside_extent(&extents, 12288));
        assert!(inside_extent(&extents, 65536));
        assert!(!inside_extent(&extents, 69632));
    }
}
