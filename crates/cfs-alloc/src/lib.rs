#![forbid(unsafe_code)]
//! Device space allocation for file data.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation, one bit per sector.
//! 2. **BlockGroup**: a fixed slice of the data address space with its own
//!    bitmap, read-only flag, in-flight reservation count and No-COW writer
//!    count.
//! 3. **DataAllocator**: hint-directed extent reservation across groups,
//!    halving the request on `NoSpace` down to the caller's minimum.
//!
//! Byte offset 0 is never handed out; a disk bytenr of 0 means "hole" in
//! file extent items.

pub mod space_info;

pub use space_info::{SpaceInfo, SpaceKind, SpaceSnapshot};

use cfs_error::{CfsError, Result};
use cfs_types::SectorSize;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| !bitmap_get(bitmap, idx)).count() as u32
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`,
/// preferring runs at or after `start` and wrapping to the beginning.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32, start: u32) -> Option<u32> {
    if n == 0 || n > count {
        return None;
    }
    let scan = |from: u32, to: u32| {
        let mut run_start = from;
        let mut run_len = 0_u32;
        for idx in from..to {
            if bitmap_get(bitmap, idx) {
                run_start = idx + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= n {
                    return Some(run_start);
                }
            }
        }
        None
    };
    scan(start.min(count), count).or_else(|| scan(0, count))
}

// ── Block groups ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct BlockGroup {
    start: u64,
    sectors: u32,
    bitmap: Vec<u8>,
    free_sectors: u32,
    readonly: bool,
    /// Reservations handed out but not yet turned into ordered extents.
    reservations: u64,
    nocow_writers: u64,
}

impl BlockGroup {
    fn new(start: u64, sectors: u32) -> Self {
        Self {
            start,
            sectors,
            bitmap: vec![0_u8; sectors.div_ceil(8) as usize],
            free_sectors: sectors,
            readonly: false,
            reservations: 0,
            nocow_writers: 0,
        }
    }

    fn end(&self, sectorsize: SectorSize) -> u64 {
        self.start + u64::from(self.sectors) * sectorsize.bytes()
    }
}

/// Read-only view of one block group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGroupInfo {
    pub start: u64,
    pub len: u64,
    pub free_bytes: u64,
    pub readonly: bool,
    pub reservations: u64,
    pub nocow_writers: u64,
}

/// Layout of the data address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorGeometry {
    pub sectorsize: SectorSize,
    /// First usable byte; must be non-zero and sector aligned.
    pub data_start: u64,
    /// Usable bytes from `data_start`.
    pub data_len: u64,
    pub block_group_size: u64,
}

/// A device range handed out by [`DataAllocator::reserve_extent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedExtent {
    pub start: u64,
    pub len: u64,
}

/// Block-group based allocator for the data address space.
#[derive(Debug)]
pub struct DataAllocator {
    sectorsize: SectorSize,
    groups: Mutex<Vec<BlockGroup>>,
    space: Arc<SpaceInfo>,
}

impl DataAllocator {
    pub fn new(geo: AllocatorGeometry) -> Result<Self> {
        let ss = geo.sectorsize;
        if geo.data_start == 0 || !ss.is_aligned(geo.data_start) {
            return Err(CfsError::InvalidArgument(format!(
                "data_start {} must be non-zero and sector aligned",
                geo.data_start
            )));
        }
        if geo.block_group_size < ss.bytes() || !ss.is_aligned(geo.block_group_size) {
            return Err(CfsError::InvalidArgument(format!(
                "block_group_size {} must be a sector multiple",
                geo.block_group_size
            )));
        }
        let mut groups = Vec::new();
        let end = geo.data_start.saturating_add(ss.round_down(geo.data_len));
        let mut start = geo.data_start;
        while start < end {
            let len = geo.block_group_size.min(end - start);
            let sectors = u32::try_from(len >> ss.shift()).map_err(|_| {
                CfsError::InvalidArgument("block group has too many sectors".to_owned())
            })?;
            groups.push(BlockGroup::new(start, sectors));
            start += len;
        }
        if groups.is_empty() {
            return Err(CfsError::InvalidArgument("no data space".to_owned()));
        }
        let total = end - geo.data_start;
        debug!(
            target: "cfs::alloc",
            groups = groups.len(),
            total_bytes = total,
            "data allocator ready"
        );
        Ok(Self {
            sectorsize: ss,
            groups: Mutex::new(groups),
            space: Arc::new(SpaceInfo::new(SpaceKind::Data, total)),
        })
    }

    /// Data space counters shared with the delalloc reservation path.
    #[must_use]
    pub fn space_info(&self) -> &Arc<SpaceInfo> {
        &self.space
    }

    #[must_use]
    pub fn sectorsize(&self) -> SectorSize {
        self.sectorsize
    }

    fn group_index(groups: &[BlockGroup], ss: SectorSize, bytenr: u64) -> Option<usize> {
        groups
            .iter()
            .position(|g| g.start <= bytenr && bytenr < g.end(ss))
    }

    /// Reserve a contiguous extent of `num_bytes`, halving the request on
    /// failure until `min_bytes` (both rounded to sectors).
    ///
    /// Passing `min_bytes == num_bytes` asks for an exact-size extent.
    pub fn reserve_extent(
        &self,
        num_bytes: u64,
        min_bytes: u64,
        hint: u64,
    ) -> Result<ReservedExtent> {
        let ss = self.sectorsize;
        let mut want = ss.round_up(num_bytes);
        let min = ss.round_up(min_bytes.max(1)).min(want);
        if want == 0 {
            return Err(CfsError::InvalidArgument(
                "cannot reserve an empty extent".to_owned(),
            ));
        }
        loop {
            if let Some(ext) = self.try_reserve(want, hint) {
                trace!(
                    target: "cfs::alloc",
                    start = ext.start,
                    len = ext.len,
                    requested = num_bytes,
                    "extent reserved"
                );
                return Ok(ext);
            }
            if want <= min {
                debug!(target: "cfs::alloc", num_bytes, min_bytes, "no contiguous space");
                return Err(CfsError::NoSpace);
            }
            let next = ss.round_down(want / 2).max(min);
            warn!(
                target: "cfs::alloc",
                from = want,
                to = next,
                "reservation failed, retrying smaller"
            );
            want = next;
        }
    }

    fn try_reserve(&self, len: u64, hint: u64) -> Option<ReservedExtent> {
        let ss = self.sectorsize;
        let n = u32::try_from(len >> ss.shift()).ok()?;
        let mut groups = self.groups.lock();
        let first = Self::group_index(&groups, ss, hint).unwrap_or(0);
        let count = groups.len();
        for step in 0..count {
            let gidx = (first + step) % count;
            let group = &mut groups[gidx];
            if group.readonly || group.free_sectors < n {
                continue;
            }
            let start_bit = if step == 0 && hint >= group.start {
                u32::try_from((hint - group.start) >> ss.shift()).unwrap_or(0)
            } else {
                0
            };
            if let Some(rel) = bitmap_find_contiguous(&group.bitmap, group.sectors, n, start_bit) {
                for bit in rel..rel + n {
                    bitmap_set(&mut group.bitmap, bit);
                }
                group.free_sectors -= n;
                group.reservations += 1;
                let start = group.start + (u64::from(rel) << ss.shift());
                drop(groups);
                self.space.add_reserved(len);
                return Some(ReservedExtent { start, len });
            }
        }
        None
    }

    /// Drop the in-flight reservation count taken by `reserve_extent`.
    ///
    /// Called once the ordered extent for the reservation exists.
    pub fn dec_reservations(&self, bytenr: u64) {
        let mut groups = self.groups.lock();
        if let Some(idx) = Self::group_index(&groups, self.sectorsize, bytenr) {
            groups[idx].reservations = groups[idx].reservations.saturating_sub(1);
        }
    }

    fn clear_range(&self, start: u64, len: u64) -> Result<()> {
        let ss = self.sectorsize;
        let mut groups = self.groups.lock();
        let idx = Self::group_index(&groups, ss, start)
            .ok_or_else(|| CfsError::NotFound(format!("extent {start} outside data space")))?;
        let group = &mut groups[idx];
        if start.saturating_add(len) > group.end(ss) || !ss.is_aligned(start) {
            return Err(CfsError::InvalidArgument(format!(
                "extent [{start}, +{len}) crosses a block group or is unaligned"
            )));
        }
        let first = u32::try_from((start - group.start) >> ss.shift())
            .map_err(|_| CfsError::InvalidArgument("bit index overflow".to_owned()))?;
        let n = u32::try_from(ss.sectors(len))
            .map_err(|_| CfsError::InvalidArgument("extent too long".to_owned()))?;
        if let Some(bit) = (first..first + n).find(|&b| !bitmap_get(&group.bitmap, b)) {
            return Err(CfsError::NotFound(format!(
                "sector {} of extent {start} is not allocated",
                bit - first
            )));
        }
        for bit in first..first + n {
            bitmap_clear(&mut group.bitmap, bit);
        }
        group.free_sectors += n;
        Ok(())
    }

    /// Give back a reservation whose metadata was never committed.
    pub fn free_reserved(&self, start: u64, len: u64) -> Result<()> {
        self.clear_range(start, len)?;
        self.space.sub_reserved(len);
        trace!(target: "cfs::alloc", start, len, "reserved extent freed");
        Ok(())
    }

    /// The extent's file extent item was committed.
    pub fn convert_reserved_to_used(&self, len: u64) {
        self.space.sub_reserved(len);
        self.space.add_used(len);
    }

    /// Mark an extent found in committed metadata as in use (mount time).
    pub fn mark_used(&self, start: u64, len: u64) -> Result<()> {
        let ss = self.sectorsize;
        let mut groups = self.groups.lock();
        let idx = Self::group_index(&groups, ss, start)
            .ok_or_else(|| CfsError::Corruption {
                location: start,
                detail: "extent outside data space".to_owned(),
            })?;
        let group = &mut groups[idx];
        if start.saturating_add(len) > group.end(ss) || !ss.is_aligned(start) {
            return Err(CfsError::Corruption {
                location: start,
                detail: format!("extent of {len} bytes crosses a block group or is unaligned"),
            });
        }
        let first = u32::try_from((start - group.start) >> ss.shift())
            .map_err(|_| CfsError::InvalidArgument("bit index overflow".to_owned()))?;
        let n = u32::try_from(ss.sectors(len))
            .map_err(|_| CfsError::InvalidArgument("extent too long".to_owned()))?;
        for bit in first..first + n {
            if !bitmap_get(&group.bitmap, bit) {
                bitmap_set(&mut group.bitmap, bit);
                group.free_sectors -= 1;
            }
        }
        drop(groups);
        self.space.add_used(ss.round_up(len));
        Ok(())
    }

    /// Free an extent whose last reference was dropped.
    pub fn free_used(&self, start: u64, len: u64) -> Result<()> {
        self.clear_range(start, len)?;
        self.space.sub_used(len);
        trace!(target: "cfs::alloc", start, len, "extent freed");
        Ok(())
    }

    /// Whether the block group holding `bytenr` refuses new writes.
    #[must_use]
    pub fn is_readonly(&self, bytenr: u64) -> bool {
        let groups = self.groups.lock();
        Self::group_index(&groups, self.sectorsize, bytenr).is_none_or(|idx| groups[idx].readonly)
    }

    /// Mark the block group holding `bytenr` read-only (e.g. during
    /// relocation). Fails while No-COW writers are active in it.
    pub fn set_readonly(&self, bytenr: u64, readonly: bool) -> Result<()> {
        let mut groups = self.groups.lock();
        let idx = Self::group_index(&groups, self.sectorsize, bytenr)
            .ok_or_else(|| CfsError::NotFound(format!("no block group at {bytenr}")))?;
        if readonly && groups[idx].nocow_writers > 0 {
            return Err(CfsError::InvalidArgument(format!(
                "block group {} has active nocow writers",
                groups[idx].start
            )));
        }
        groups[idx].readonly = readonly;
        Ok(())
    }

    /// Register a No-COW writer in the block group holding `bytenr`.
    /// Returns `false` when the group is read-only and the write must COW.
    #[must_use]
    pub fn inc_nocow_writers(&self, bytenr: u64) -> bool {
        let mut groups = self.groups.lock();
        match Self::group_index(&groups, self.sectorsize, bytenr) {
            Some(idx) if !groups[idx].readonly => {
                groups[idx].nocow_writers += 1;
                true
            }
            _ => false,
        }
    }

    pub fn dec_nocow_writers(&self, bytenr: u64) {
        let mut groups = self.groups.lock();
        if let Some(idx) = Self::group_index(&groups, self.sectorsize, bytenr) {
            groups[idx].nocow_writers = groups[idx].nocow_writers.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn block_groups(&self) -> Vec<BlockGroupInfo> {
        let ss = self.sectorsize;
        self.groups
            .lock()
            .iter()
            .map(|g| BlockGroupInfo {
                start: g.start,
                len: u64::from(g.sectors) * ss.bytes(),
                free_bytes: u64::from(bitmap_count_free(&g.bitmap, g.sectors)) * ss.bytes(),
                readonly: g.readonly,
                reservations: g.reservations,
                nocow_writers: g.nocow_writers,
            })
            .collect()
    }

    /// Free bytes across writable groups.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        let ss = self.sectorsize;
        self.groups
            .lock()
            .iter()
            .filter(|g| !g.readonly)
            .map(|g| u64::from(g.free_sectors) * ss.bytes())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SS: u64 = 4096;

    fn allocator(groups: u64, group_size: u64) -> DataAllocator {
        DataAllocator::new(AllocatorGeometry {
            sectorsize: SectorSize::default(),
            data_start: 1 << 20,
            data_len: groups * group_size,
            block_group_size: group_size,
        })
        .expect("allocator")
    }

    #[test]
    fn bitmap_basics() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 3);
        assert!(bitmap_get(&bm, 3));
        assert_eq!(bitmap_count_free(&bm, 16), 15);
        bitmap_clear(&mut bm, 3);
        assert!(!bitmap_get(&bm, 3));
        assert!(!bitmap_get(&bm, 100));
    }

    #[test]
    fn find_contiguous_prefers_hint_and_wraps() {
        let mut bm = vec![0_u8; 2];
        for i in 4..8 {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(bitmap_find_contiguous(&bm, 16, 4, 0), Some(0));
        assert_eq!(bitmap_find_contiguous(&bm, 16, 4, 5), Some(8));
        assert_eq!(bitmap_find_contiguous(&bm, 16, 8, 14), Some(8));
        assert_eq!(bitmap_find_contiguous(&bm, 16, 9, 0), None);
    }

    #[test]
    fn reserve_and_free_update_counters() {
        let alloc = allocator(2, 64 * SS);
        let ext = alloc.reserve_extent(3 * SS, SS, 0).expect("reserve");
        assert_eq!(ext.len, 3 * SS);
        assert_ne!(ext.start, 0);
        assert_eq!(alloc.space_info().bytes_reserved(), 3 * SS);
        assert_eq!(alloc.block_groups()[0].reservations, 1);
        alloc.dec_reservations(ext.start);
        assert_eq!(alloc.block_groups()[0].reservations, 0);

        alloc.convert_reserved_to_used(ext.len);
        assert_eq!(alloc.space_info().bytes_used(), 3 * SS);
        alloc.free_used(ext.start, ext.len).expect("free");
        assert_eq!(alloc.space_info().bytes_used(), 0);
        assert_eq!(alloc.free_bytes(), 128 * SS);
    }

    #[test]
    fn reservation_halves_down_to_min() {
        let alloc = allocator(1, 8 * SS);
        // Fragment: take sectors 0..8, free every other one.
        let mut exts = Vec::new();
        for _ in 0..8 {
            exts.push(alloc.reserve_extent(SS, SS, 0).expect("single"));
        }
        for ext in exts.iter().step_by(2) {
            alloc.free_reserved(ext.start, ext.len).expect("free");
        }
        let got = alloc.reserve_extent(4 * SS, SS, 0).expect("halved");
        assert_eq!(got.len, SS);
        assert!(matches!(
            alloc.reserve_extent(2 * SS, 2 * SS, 0),
            Err(CfsError::NoSpace)
        ));
    }

    #[test]
    fn exact_reservation_never_splits() {
        let alloc = allocator(1, 4 * SS);
        let a = alloc.reserve_extent(SS, SS, 0).expect("a");
        let _b = alloc.reserve_extent(SS, SS, 0).expect("b");
        alloc.free_reserved(a.start, a.len).expect("free a");
        assert!(alloc.reserve_extent(3 * SS, 3 * SS, 0).is_err());
        assert_eq!(alloc.reserve_extent(2 * SS, 2 * SS, 0).expect("exact").len, 2 * SS);
    }

    #[test]
    fn free_reserved_rejects_unknown_ranges() {
        let alloc = allocator(1, 16 * SS);
        assert!(alloc.free_reserved(1 << 20, SS).is_err());
        assert!(alloc.free_reserved(0, SS).is_err());
        let ext = alloc.reserve_extent(SS, SS, 0).expect("reserve");
        alloc.free_reserved(ext.start, ext.len).expect("first free");
        assert!(alloc.free_reserved(ext.start, ext.len).is_err());
    }

    #[test]
    fn mark_used_rebuilds_usage() {
        let alloc = allocator(1, 16 * SS);
        let start = (1 << 20) + 4 * SS;
        alloc.mark_used(start, 2 * SS).expect("mark");
        assert_eq!(alloc.space_info().bytes_used(), 2 * SS);
        assert_eq!(alloc.free_bytes(), 14 * SS);
        let got = alloc.reserve_extent(2 * SS, 2 * SS, start).expect("reserve");
        assert!(got.start >= start + 2 * SS || got.start + got.len <= start);
        assert!(alloc.mark_used(0, SS).is_err());
        alloc.free_used(start, 2 * SS).expect("free");
        assert_eq!(alloc.space_info().bytes_used(), 0);
    }

    #[test]
    fn readonly_groups_are_skipped_and_block_nocow() {
        let alloc = allocator(2, 16 * SS);
        let first = alloc.block_groups()[0].start;
        alloc.set_readonly(first, true).expect("ro");
        let ext = alloc.reserve_extent(SS, SS, first).expect("reserve");
        assert!(ext.start >= first + 16 * SS);
        assert!(alloc.is_readonly(first));
        assert!(!alloc.inc_nocow_writers(first));
        assert!(alloc.inc_nocow_writers(ext.start));
        assert!(alloc.set_readonly(ext.start, true).is_err());
        alloc.dec_nocow_writers(ext.start);
        alloc.set_readonly(ext.start, true).expect("now ro");
    }

    #[test]
    fn rejects_bad_geometry() {
        let bad = AllocatorGeometry {
            sectorsize: SectorSize::default(),
            data_start: 0,
            data_len: 1 << 20,
            block_group_size: 1 << 20,
        };
        assert!(DataAllocator::new(bad).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn reserved_extents_never_overlap(sizes in proptest::collection::vec(1_u64..6, 1..40)) {
            let alloc = allocator(2, 64 * SS);
            let mut got: Vec<ReservedExtent> = Vec::new();
            for s in sizes {
                if let Ok(ext) = alloc.reserve_extent(s * SS, SS, 0) {
                    got.push(ext);
                }
            }
            got.sort_by_key(|e| e.start);
            for pair in got.windows(2) {
                prop_assert!(pair[0].start + pair[0].len <= pair[1].start);
            }
            let total: u64 = got.iter().map(|e| e.len).sum();
            prop_assert_eq!(alloc.space_info().bytes_reserved(), total);
            prop_assert_eq!(alloc.free_bytes() + total, 128 * SS);
        }
    }
}
