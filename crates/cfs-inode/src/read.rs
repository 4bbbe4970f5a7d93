//! Buffered reads with checksum verification and mirror repair.
//!
//! Up-to-date pages come from the page cache. Everything else is resolved
//! through the extent map cache, falling back to the file extent items of
//! the live metadata. Data sectors are verified against their stored
//! checksums; a mismatch is retried on every other copy and the first good
//! copy is written back over the bad one.

use crate::diagnostics::CorruptionRecord;
use crate::inode::Inode;
use cfs_btree::csum::lookup_csums;
use cfs_btree::fs_tree::{lookup_file_extent, next_file_extent};
use cfs_btree::items::{FileExtentItem, FileExtentKind};
use cfs_error::{CfsError, Result};
use cfs_extent::{BlockStart, ExtentBits, ExtentMap, ExtentMapError, ExtentMapFlags};
use cfs_types::{CompressionType, SectorSize};
use std::sync::Arc;
use tracing::{trace, warn};

/// The extent map describing a file extent item at `key_offset`.
#[must_use]
pub fn em_from_item(key_offset: u64, item: &FileExtentItem, ss: SectorSize) -> ExtentMap {
    let disk = match &item.kind {
        FileExtentKind::Inline(_) => {
            return ExtentMap {
                start: key_offset,
                len: ss.round_up(item.ram_bytes),
                block_start: BlockStart::Inline,
                block_len: 0,
                orig_start: key_offset,
                orig_block_len: 0,
                ram_bytes: item.ram_bytes,
                compression: item.compression,
                generation: item.generation,
                flags: ExtentMapFlags::empty(),
            };
        }
        FileExtentKind::Regular(d) | FileExtentKind::Prealloc(d) => d,
    };
    if disk.is_hole() {
        let mut em = ExtentMap::hole(key_offset, disk.num_bytes);
        em.generation = item.generation;
        return em;
    }
    let orig_start = key_offset.wrapping_sub(disk.offset);
    let mut em = ExtentMap {
        start: key_offset,
        len: disk.num_bytes,
        block_start: BlockStart::Disk(disk.disk_bytenr + disk.offset),
        block_len: disk.num_bytes,
        orig_start,
        orig_block_len: disk.disk_num_bytes,
        ram_bytes: item.ram_bytes,
        compression: item.compression,
        generation: item.generation,
        flags: ExtentMapFlags::empty(),
    };
    if item.compression.is_compressed() {
        em.block_start = BlockStart::Disk(disk.disk_bytenr);
        em.block_len = disk.disk_num_bytes;
        em.flags |= ExtentMapFlags::COMPRESSED;
    }
    if matches!(item.kind, FileExtentKind::Prealloc(_)) {
        em.flags |= ExtentMapFlags::PREALLOC;
    }
    em
}

impl Inode {
    /// The mapping of the byte at `offset`, from the cache or from the
    /// file extent items.
    pub fn get_extent(&self, offset: u64) -> Result<Arc<ExtentMap>> {
        let cached = self.em_tree.search(offset);
        if let Some(em) = &cached {
            if em.start <= offset {
                return Ok(Arc::clone(em));
            }
        }
        let store = self.fs.txn().store();
        let (root, ino) = (self.root.id(), self.ino());
        let em = match lookup_file_extent(&**store, root, ino, offset)? {
            Some((key_offset, item)) => em_from_item(key_offset, &item, self.fs.sectorsize()),
            None => {
                let next = next_file_extent(&**store, root, ino, offset)?
                    .map_or(u64::MAX, |(key_offset, _)| key_offset);
                let next = cached.map_or(next, |em| next.min(em.start));
                ExtentMap::hole(offset, next - offset)
            }
        };
        match self.em_tree.insert(em.clone(), false) {
            Ok(added) => Ok(added),
            // A racing writer published a mapping; serve this one uncached.
            Err(ExtentMapError::Exists { .. }) => Ok(Arc::new(em)),
            Err(err) => Err(err.into()),
        }
    }

    /// Read up to `len` bytes at `offset`, clipped to the file size.
    pub(crate) fn read_data(self: &Arc<Self>, offset: u64, len: u64) -> Result<Vec<u8>> {
        let size = self.size();
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(len).min(size);
        if self.io_tree.test_range(offset, end, ExtentBits::IOERR, false) {
            return Err(CfsError::WriteFailed {
                ino: self.ino().0,
                start: offset,
                end,
            });
        }
        let ss = self.fs.sectorsize();
        let first = ss.round_down(offset);
        let stop = ss.round_up(end);
        let mut buf = Vec::with_capacity(usize::try_from(stop - first).unwrap_or(0));
        let mut pos = first;
        while pos < stop {
            if let Some(page) = self.pages.get(pos) {
                buf.extend_from_slice(&page);
                pos += ss.bytes();
                continue;
            }
            let em = self.get_extent(pos)?;
            let mut run_end = em.end().min(stop);
            let mut p = pos + ss.bytes();
            while p < run_end {
                if self.pages.get(p).is_some() {
                    run_end = p;
                    break;
                }
                p += ss.bytes();
            }
            let data = self.read_run(&em, pos, run_end)?;
            for (i, page) in data.chunks(usize::try_from(ss.bytes()).unwrap_or(usize::MAX)).enumerate() {
                self.pages.insert_clean(pos + i as u64 * ss.bytes(), page.to_vec());
            }
            buf.extend_from_slice(&data);
            pos = run_end;
        }
        let skip = usize::try_from(offset - first).unwrap_or(0);
        let take = usize::try_from(end - offset).unwrap_or(usize::MAX);
        Ok(buf.into_iter().skip(skip).take(take).collect())
    }

    /// Bytes of `[start, end)` inside the single mapping `em`.
    fn read_run(&self, em: &ExtentMap, start: u64, end: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(end - start).unwrap_or(usize::MAX);
        let mut out = match em.block_start {
            BlockStart::Hole | BlockStart::Delalloc => vec![0_u8; len],
            _ if em.is_prealloc() => vec![0_u8; len],
            BlockStart::Inline => self.read_inline(em, start)?,
            BlockStart::Disk(bytenr) if em.is_compressed() => {
                let disk = self.read_verified(bytenr, em.block_len, em.orig_start)?;
                let ram = usize::try_from(em.ram_bytes).unwrap_or(usize::MAX);
                let plain = cfs_compress::decompress(em.compression, &disk, ram)?;
                let from = usize::try_from(start - em.orig_start).unwrap_or(usize::MAX);
                plain.get(from..).map(<[u8]>::to_vec).unwrap_or_default()
            }
            BlockStart::Disk(_) => {
                let bytenr = em.disk_bytenr_at(start).unwrap_or_default();
                self.read_verified(bytenr, end - start, start)?
            }
        };
        out.resize(len, 0);
        trace!(
            target: "cfs::read",
            ino = self.ino().0,
            start,
            end,
            block = ?em.block_start,
            "extent read"
        );
        Ok(out)
    }

    fn read_inline(&self, em: &ExtentMap, start: u64) -> Result<Vec<u8>> {
        let store = self.fs.txn().store();
        let Some((_, item)) = lookup_file_extent(&**store, self.root.id(), self.ino(), em.start)?
        else {
            return Ok(Vec::new());
        };
        let FileExtentKind::Inline(payload) = &item.kind else {
            return Ok(Vec::new());
        };
        let ram = usize::try_from(item.ram_bytes).unwrap_or(usize::MAX);
        let plain = match item.compression {
            CompressionType::None => payload.clone(),
            kind => cfs_compress::decompress(kind, payload, ram)?,
        };
        let from = usize::try_from(start - em.start).unwrap_or(usize::MAX);
        Ok(plain.get(from..).map(<[u8]>::to_vec).unwrap_or_default())
    }

    /// Read `len` bytes at `bytenr` and verify every checksummed sector,
    /// repairing from other copies on mismatch.
    pub(crate) fn read_verified(&self, bytenr: u64, len: u64, file_offset: u64) -> Result<Vec<u8>> {
        let ss = self.fs.sectorsize();
        let engine = self.fs.engine();
        let mut data = engine.read(bytenr, usize::try_from(len).unwrap_or(usize::MAX), 0)?;
        if !self.datasum() {
            return Ok(data);
        }
        let sums = lookup_csums(&**self.fs.txn().store(), ss, bytenr, len)?;
        let sector = usize::try_from(ss.bytes()).unwrap_or(usize::MAX);
        for (i, expected) in sums.into_iter().enumerate() {
            let Some(expected) = expected else {
                continue;
            };
            let lo = i * sector;
            let hi = (lo + sector).min(data.len());
            let actual = crc32c::crc32c(&data[lo..hi]);
            if actual == expected {
                continue;
            }
            let logical = bytenr + (i as u64) * ss.bytes();
            warn!(
                target: "cfs::read",
                ino = self.ino().0,
                logical,
                expected,
                actual,
                "checksum mismatch"
            );
            if let Some(good) = self.repair_sector(logical, hi - lo, expected)? {
                data[lo..hi].copy_from_slice(&good);
                continue;
            }
            let offset = file_offset + (i as u64) * ss.bytes();
            self.fs.diagnostics().record_corruption(CorruptionRecord {
                root: self.root.id().0,
                ino: self.ino().0,
                file_offset: offset,
                logical,
                mirror: engine.num_copies(),
                expected,
                actual,
            });
            return Err(CfsError::DataCorruption {
                ino: self.ino().0,
                offset,
                logical,
                expected,
                actual,
            });
        }
        Ok(data)
    }

    /// Find a copy of the sector at `logical` matching `expected` and write
    /// it over the first copy.
    fn repair_sector(&self, logical: u64, len: usize, expected: u32) -> Result<Option<Vec<u8>>> {
        let engine = self.fs.engine();
        for mirror in 2..=engine.num_copies() {
            let candidate = match engine.read(logical, len, mirror) {
                Ok(candidate) => candidate,
                Err(err) => {
                    warn!(target: "cfs::read", logical, mirror, error = %err, "mirror read failed");
                    continue;
                }
            };
            if crc32c::crc32c(&candidate) != expected {
                continue;
            }
            match engine.write_mirror(logical, &candidate, 1) {
                Ok(()) => self.fs.diagnostics().record_repair(logical, 1, mirror),
                Err(err) => warn!(target: "cfs::read", logical, error = %err, "repair write failed"),
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_btree::items::DiskRef;

    fn item(kind: FileExtentKind, compression: CompressionType, ram_bytes: u64) -> FileExtentItem {
        FileExtentItem {
            generation: 7,
            ram_bytes,
            compression,
            encryption: 0,
            other_encoding: 0,
            kind,
        }
    }

    #[test]
    fn split_regular_item_maps_into_its_extent() {
        let disk = DiskRef {
            disk_bytenr: 1 << 20,
            disk_num_bytes: 64 * 1024,
            offset: 16 * 1024,
            num_bytes: 8192,
        };
        let em = em_from_item(
            40 * 1024,
            &item(FileExtentKind::Regular(disk), CompressionType::None, 64 * 1024),
            SectorSize::default(),
        );
        assert_eq!(em.block_start, BlockStart::Disk((1 << 20) + 16 * 1024));
        assert_eq!(em.orig_start, 24 * 1024);
        assert_eq!(em.disk_bytenr_at(44 * 1024), Some((1 << 20) + 20 * 1024));
        assert_eq!(em.generation, 7);
    }

    #[test]
    fn compressed_and_prealloc_flags() {
        let disk = DiskRef {
            disk_bytenr: 1 << 20,
            disk_num_bytes: 8192,
            offset: 4096,
            num_bytes: 4096,
        };
        let em = em_from_item(
            4096,
            &item(FileExtentKind::Regular(disk), CompressionType::Zstd, 128 * 1024),
            SectorSize::default(),
        );
        assert!(em.is_compressed());
        assert_eq!(em.block_start, BlockStart::Disk(1 << 20));
        assert_eq!(em.block_len, 8192);
        assert_eq!(em.orig_start, 0);

        let pre = em_from_item(
            0,
            &item(FileExtentKind::Prealloc(disk), CompressionType::None, 8192),
            SectorSize::default(),
        );
        assert!(pre.is_prealloc());
        let hole = em_from_item(
            0,
            &item(
                FileExtentKind::Regular(DiskRef {
                    disk_bytenr: 0,
                    ..disk
                }),
                CompressionType::None,
                4096,
            ),
            SectorSize::default(),
        );
        assert_eq!(hole.block_start, BlockStart::Hole);
    }

    #[test]
    fn inline_item_covers_its_sector() {
        let em = em_from_item(
            0,
            &item(FileExtentKind::Inline(vec![1; 50]), CompressionType::None, 50),
            SectorSize::default(),
        );
        assert_eq!(em.block_start, BlockStart::Inline);
        assert_eq!(em.len, 4096);
        assert_eq!(em.ram_bytes, 50);
    }
}
