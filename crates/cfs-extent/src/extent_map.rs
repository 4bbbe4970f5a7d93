//! Extent map cache.
//!
//! A per-inode cache of `file range -> where the bytes are` mappings. Entries
//! never overlap. Entries are shared as `Arc<ExtentMap>` and never mutated in
//! place: every change replaces the entry, so readers holding an `Arc` keep
//! a consistent snapshot.
//!
//! `PINNED` entries describe ranges whose IO is in flight. They survive
//! [`ExtentMapTree::drop_range`] with `skip_pinned` and never merge with
//! their neighbours until [`ExtentMapTree::unpin`].

use bitflags::bitflags;
use cfs_error::CfsError;
use cfs_types::CompressionType;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Where the bytes of an extent map live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStart {
    /// Physical byte address of the mapping's first byte (for compressed
    /// extents, of the whole on-disk extent).
    Disk(u64),
    Hole,
    Inline,
    Delalloc,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExtentMapFlags: u32 {
        /// IO in flight; do not drop or merge.
        const PINNED     = 1 << 0;
        const COMPRESSED = 1 << 1;
        const PREALLOC   = 1 << 2;
        /// Prealloc range being written; becomes regular at completion.
        const FILLING    = 1 << 3;
        /// Being copied into an fsync log.
        const LOGGING    = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentMap {
    pub start: u64,
    pub len: u64,
    pub block_start: BlockStart,
    /// Bytes on disk backing this mapping; the whole extent when compressed.
    pub block_len: u64,
    /// File offset at which the full on-disk extent begins.
    pub orig_start: u64,
    /// Length of the full on-disk extent.
    pub orig_block_len: u64,
    /// Decompressed length of the full extent.
    pub ram_bytes: u64,
    pub compression: CompressionType,
    pub generation: u64,
    pub flags: ExtentMapFlags,
}

impl ExtentMap {
    /// A hole covering `[start, start + len)`.
    #[must_use]
    pub fn hole(start: u64, len: u64) -> Self {
        Self {
            start,
            len,
            block_start: BlockStart::Hole,
            block_len: 0,
            orig_start: start,
            orig_block_len: 0,
            ram_bytes: len,
            compression: CompressionType::None,
            generation: 0,
            flags: ExtentMapFlags::empty(),
        }
    }

    /// Exclusive end, saturating at `u64::MAX`.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(ExtentMapFlags::PINNED)
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(ExtentMapFlags::COMPRESSED)
    }

    #[must_use]
    pub fn is_prealloc(&self) -> bool {
        self.flags.contains(ExtentMapFlags::PREALLOC)
    }

    /// Physical address of file byte `offset` for an uncompressed disk
    /// mapping.
    #[must_use]
    pub fn disk_bytenr_at(&self, offset: u64) -> Option<u64> {
        match self.block_start {
            BlockStart::Disk(b) if !self.is_compressed() && offset >= self.start => {
                Some(b + (offset - self.start))
            }
            _ => None,
        }
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end()
    }

    /// The part of `self` in `[from, to)`, with the physical side adjusted.
    fn slice(&self, from: u64, to: u64) -> Self {
        let mut out = self.clone();
        out.start = from;
        out.len = to - from;
        if self.is_compressed() {
            return out;
        }
        if let BlockStart::Disk(b) = self.block_start {
            out.block_start = BlockStart::Disk(b + (from - self.start));
            out.block_len = out.len;
        }
        if !matches!(self.block_start, BlockStart::Inline) {
            out.ram_bytes = out.len;
        }
        out
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtentMapError {
    #[error("extent map [{start}, +{len}) overlaps an existing entry")]
    Exists { start: u64, len: u64 },
    #[error("extent map has zero length at {start}")]
    Empty { start: u64 },
}

impl From<ExtentMapError> for CfsError {
    fn from(e: ExtentMapError) -> Self {
        match e {
            ExtentMapError::Exists { .. } => Self::Exists,
            ExtentMapError::Empty { .. } => Self::InvalidArgument(e.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct MapInner {
    maps: BTreeMap<u64, Arc<ExtentMap>>,
    /// Starts of entries changed since the last fsync log pass.
    modified: BTreeSet<u64>,
}

impl MapInner {
    fn overlapping(&self, start: u64, end: u64) -> Vec<Arc<ExtentMap>> {
        let mut out = Vec::new();
        if end <= start {
            return out;
        }
        if let Some((_, em)) = self.maps.range(..start).next_back() {
            if em.overlaps(start, end) {
                out.push(Arc::clone(em));
            }
        }
        out.extend(self.maps.range(start..end).map(|(_, em)| Arc::clone(em)));
        out
    }

    fn remove(&mut self, start: u64) -> Option<Arc<ExtentMap>> {
        self.modified.remove(&start);
        self.maps.remove(&start)
    }

    fn put(&mut self, em: ExtentMap, modified: bool) -> Arc<ExtentMap> {
        let start = em.start;
        if modified {
            self.modified.insert(start);
        }
        let em = Arc::new(em);
        self.maps.insert(start, Arc::clone(&em));
        em
    }

    fn mergeable(a: &ExtentMap, b: &ExtentMap) -> bool {
        let flags_ok = !(a.flags | b.flags).intersects(
            ExtentMapFlags::PINNED | ExtentMapFlags::COMPRESSED | ExtentMapFlags::LOGGING,
        ) && a.flags == b.flags;
        if !flags_ok || a.end() != b.start || a.len == 0 || b.len == 0 {
            return false;
        }
        match (a.block_start, b.block_start) {
            (BlockStart::Disk(x), BlockStart::Disk(y)) => x + a.block_len == y,
            (BlockStart::Hole, BlockStart::Hole) | (BlockStart::Delalloc, BlockStart::Delalloc) => {
                true
            }
            _ => false,
        }
    }

    /// Merge the entry at `start` with mergeable neighbours.
    fn try_merge(&mut self, start: u64) {
        let Some(mut cur) = self.maps.get(&start).map(|em| (**em).clone()) else {
            return;
        };
        let mut modified = self.modified.contains(&start);
        if let Some(prev) = self.maps.range(..start).next_back().map(|(_, e)| Arc::clone(e)) {
            if Self::mergeable(&prev, &cur) {
                modified |= self.modified.contains(&prev.start);
                self.remove(prev.start);
                self.remove(cur.start);
                cur = Self::join(&prev, &cur);
            }
        }
        if let Some(next) = self.maps.get(&cur.end()).map(Arc::clone) {
            if Self::mergeable(&cur, &next) {
                modified |= self.modified.contains(&next.start);
                self.remove(next.start);
                self.remove(cur.start);
                cur = Self::join(&cur, &next);
            }
        }
        self.remove(cur.start);
        self.put(cur, modified);
    }

    fn join(a: &ExtentMap, b: &ExtentMap) -> ExtentMap {
        let mut out = a.clone();
        out.len = a.len + b.len;
        out.block_len = a.block_len + b.block_len;
        out.orig_block_len = out.block_len;
        out.ram_bytes = out.len;
        out.generation = a.generation.max(b.generation);
        out
    }
}

/// Non-overlapping cache of extent maps for one inode.
#[derive(Debug, Default)]
pub struct ExtentMapTree {
    inner: RwLock<MapInner>,
}

impl ExtentMapTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().maps.is_empty()
    }

    /// First entry overlapping `[start, start + len)`; `len == u64::MAX`
    /// means to the end of the file.
    #[must_use]
    pub fn lookup(&self, start: u64, len: u64) -> Option<Arc<ExtentMap>> {
        let end = start.saturating_add(len);
        self.inner.read().overlapping(start, end).into_iter().next()
    }

    /// The entry containing `offset`, or the first one after it.
    #[must_use]
    pub fn search(&self, offset: u64) -> Option<Arc<ExtentMap>> {
        let inner = self.inner.read();
        if let Some((_, em)) = inner.maps.range(..=offset).next_back() {
            if em.end() > offset {
                return Some(Arc::clone(em));
            }
        }
        inner
            .maps
            .range(offset..)
            .next()
            .map(|(_, em)| Arc::clone(em))
    }

    /// Every entry overlapping `[start, end)`, in offset order.
    #[must_use]
    pub fn entries_in(&self, start: u64, end: u64) -> Vec<Arc<ExtentMap>> {
        self.inner.read().overlapping(start, end)
    }

    /// Insert a new entry; fails with `Exists` if any entry overlaps.
    pub fn insert(&self, em: ExtentMap, modified: bool) -> Result<Arc<ExtentMap>, ExtentMapError> {
        if em.len == 0 {
            return Err(ExtentMapError::Empty { start: em.start });
        }
        let mut inner = self.inner.write();
        if !inner.overlapping(em.start, em.end()).is_empty() {
            return Err(ExtentMapError::Exists {
                start: em.start,
                len: em.len,
            });
        }
        let start = em.start;
        let pinned = em.is_pinned();
        let added = inner.put(em, modified);
        if !pinned {
            inner.try_merge(start);
        }
        Ok(added)
    }

    /// Drop whatever overlaps `em` and insert it, retrying if a racing
    /// insert lands between the two steps.
    pub fn add_with_retry(
        &self,
        em: ExtentMap,
        modified: bool,
    ) -> Result<Arc<ExtentMap>, ExtentMapError> {
        let mut attempts = 0_u32;
        loop {
            self.drop_range(em.start, em.end(), false);
            match self.insert(em.clone(), modified) {
                Ok(added) => return Ok(added),
                Err(ExtentMapError::Exists { .. }) => {
                    attempts += 1;
                    trace!(start = em.start, attempts, "extent map insert raced, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove cached state for `[start, end)`, trimming entries that straddle
    /// the boundaries. With `skip_pinned`, pinned entries are left whole.
    /// Returns the number of entries removed or trimmed.
    pub fn drop_range(&self, start: u64, end: u64, skip_pinned: bool) -> usize {
        let mut inner = self.inner.write();
        let mut touched = 0;
        for em in inner.overlapping(start, end) {
            if skip_pinned && em.is_pinned() {
                continue;
            }
            let modified = inner.modified.contains(&em.start);
            inner.remove(em.start);
            touched += 1;
            if em.start < start {
                inner.put(em.slice(em.start, start), modified);
            }
            if em.end() > end {
                inner.put(em.slice(end, em.end()), modified);
            }
        }
        touched
    }

    /// IO for `[start, start + len)` committed in `generation`: clear
    /// `PINNED`/`FILLING`, stamp the generation and merge. Returns whether
    /// any entry was found.
    pub fn unpin(&self, start: u64, len: u64, generation: u64) -> bool {
        let end = start.saturating_add(len);
        let mut inner = self.inner.write();
        let found = inner.overlapping(start, end);
        for em in &found {
            let mut next = (**em).clone();
            next.flags
                .remove(ExtentMapFlags::PINNED | ExtentMapFlags::FILLING);
            if next.flags.contains(ExtentMapFlags::PREALLOC)
                && em.flags.contains(ExtentMapFlags::FILLING)
            {
                next.flags.remove(ExtentMapFlags::PREALLOC);
            }
            next.generation = generation;
            let modified = inner.modified.contains(&em.start);
            inner.remove(em.start);
            inner.put(next, modified);
        }
        for em in &found {
            inner.try_merge(em.start);
        }
        !found.is_empty()
    }

    /// Entries changed since the last call; they are flagged `LOGGING` until
    /// [`ExtentMapTree::clear_logging`].
    pub fn take_modified(&self) -> Vec<Arc<ExtentMap>> {
        let mut inner = self.inner.write();
        let starts: Vec<u64> = std::mem::take(&mut inner.modified).into_iter().collect();
        let mut out = Vec::new();
        for start in starts {
            if let Some(em) = inner.maps.get(&start).map(Arc::clone) {
                let mut logged = (*em).clone();
                logged.flags.insert(ExtentMapFlags::LOGGING);
                inner.maps.remove(&start);
                out.push(inner.put(logged, false));
            }
        }
        out
    }

    /// Drop `LOGGING` from every entry and merge again.
    pub fn clear_logging(&self) {
        let mut inner = self.inner.write();
        let logged: Vec<u64> = inner
            .maps
            .values()
            .filter(|em| em.flags.contains(ExtentMapFlags::LOGGING))
            .map(|em| em.start)
            .collect();
        for start in &logged {
            if let Some(em) = inner.maps.get(start).map(Arc::clone) {
                let mut next = (*em).clone();
                next.flags.remove(ExtentMapFlags::LOGGING);
                inner.maps.insert(*start, Arc::new(next));
            }
        }
        for start in logged {
            inner.try_merge(start);
        }
    }

    /// All entries, in offset order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ExtentMap>> {
        self.inner.read().maps.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn disk(start: u64, len: u64, bytenr: u64) -> ExtentMap {
        ExtentMap {
            start,
            len,
            block_start: BlockStart::Disk(bytenr),
            block_len: len,
            orig_start: start,
            orig_block_len: len,
            ram_bytes: len,
            compression: CompressionType::None,
            generation: 1,
            flags: ExtentMapFlags::empty(),
        }
    }

    fn assert_no_overlap(tree: &ExtentMapTree) {
        let all = tree.snapshot();
        for pair in all.windows(2) {
            assert!(pair[0].end() <= pair[1].start, "{pair:?}");
        }
    }

    #[test]
    fn insert_rejects_overlap() {
        let tree = ExtentMapTree::new();
        tree.insert(disk(0, 8192, 1 << 20), false).expect("first");
        let err = tree.insert(disk(4096, 4096, 2 << 20), false);
        assert!(matches!(err, Err(ExtentMapError::Exists { .. })));
        assert!(tree.insert(disk(0, 0, 0), false).is_err());
        assert_eq!(CfsError::from(ExtentMapError::Exists { start: 0, len: 1 }).to_errno(), CfsError::Exists.to_errno());
    }

    #[test]
    fn adjacent_contiguous_entries_merge() {
        let tree = ExtentMapTree::new();
        tree.insert(disk(0, 4096, 1 << 20), false).expect("a");
        tree.insert(disk(4096, 4096, (1 << 20) + 4096), false).expect("b");
        assert_eq!(tree.len(), 1);
        let em = tree.lookup(0, u64::MAX).expect("merged");
        assert_eq!(em.len, 8192);
        // Physically discontiguous: no merge.
        tree.insert(disk(8192, 4096, 5 << 20), false).expect("c");
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn drop_range_splits_and_adjusts_block_start() {
        let tree = ExtentMapTree::new();
        tree.insert(disk(0, 16384, 1 << 20), false).expect("insert");
        assert_eq!(tree.drop_range(4096, 8192, false), 1);
        let all = tree.snapshot();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].len, 4096);
        assert_eq!(all[1].start, 8192);
        assert_eq!(all[1].block_start, BlockStart::Disk((1 << 20) + 8192));
        assert_eq!(all[1].len, 8192);
    }

    #[test]
    fn compressed_split_keeps_whole_disk_extent() {
        let tree = ExtentMapTree::new();
        let mut em = disk(0, 131_072, 1 << 20);
        em.flags = ExtentMapFlags::COMPRESSED;
        em.compression = CompressionType::Zstd;
        em.block_len = 8192;
        em.orig_block_len = 8192;
        tree.insert(em, false).expect("insert");
        tree.drop_range(65536, 65536 + 4096, false);
        for part in tree.snapshot() {
            assert_eq!(part.block_start, BlockStart::Disk(1 << 20));
            assert_eq!(part.block_len, 8192);
            assert_eq!(part.ram_bytes, 131_072);
            assert_eq!(part.orig_start, 0);
        }
    }

    #[test]
    fn pinned_entries_survive_skip_pinned_drop() {
        let tree = ExtentMapTree::new();
        let mut em = disk(0, 4096, 1 << 20);
        em.flags = ExtentMapFlags::PINNED;
        tree.insert(em, true).expect("pinned");
        assert_eq!(tree.drop_range(0, u64::MAX, true), 0);
        assert_eq!(tree.len(), 1);
        assert!(tree.unpin(0, 4096, 9));
        let em = tree.lookup(0, 1).expect("present");
        assert!(!em.is_pinned());
        assert_eq!(em.generation, 9);
        assert_eq!(tree.drop_range(0, u64::MAX, true), 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn unpin_merges_with_neighbours() {
        let tree = ExtentMapTree::new();
        tree.insert(disk(0, 4096, 1 << 20), false).expect("a");
        let mut b = disk(4096, 4096, (1 << 20) + 4096);
        b.flags = ExtentMapFlags::PINNED;
        tree.insert(b, false).expect("b");
        assert_eq!(tree.len(), 2);
        tree.unpin(4096, 4096, 1);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn prealloc_fill_becomes_regular_on_unpin() {
        let tree = ExtentMapTree::new();
        let mut em = disk(0, 4096, 1 << 20);
        em.flags = ExtentMapFlags::PINNED | ExtentMapFlags::PREALLOC | ExtentMapFlags::FILLING;
        tree.insert(em, false).expect("insert");
        tree.unpin(0, 4096, 2);
        let em = tree.lookup(0, 1).expect("present");
        assert!(em.flags.is_empty());
    }

    #[test]
    fn search_finds_next_entry_for_gaps() {
        let tree = ExtentMapTree::new();
        tree.insert(disk(8192, 4096, 1 << 20), false).expect("insert");
        assert_eq!(tree.search(0).map(|e| e.start), Some(8192));
        assert_eq!(tree.search(9000).map(|e| e.start), Some(8192));
        assert!(tree.search(12288).is_none());
        assert!(tree.lookup(0, 8192).is_none());
    }

    #[test]
    fn add_with_retry_replaces_overlaps() {
        let tree = ExtentMapTree::new();
        tree.insert(disk(0, 16384, 1 << 20), false).expect("insert");
        let mut delalloc = ExtentMap::hole(4096, 4096);
        delalloc.block_start = BlockStart::Delalloc;
        tree.add_with_retry(delalloc, true).expect("replace");
        let all = tree.snapshot();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].block_start, BlockStart::Delalloc);
        assert_no_overlap(&tree);
    }

    #[test]
    fn modified_entries_are_logged_once() {
        let tree = ExtentMapTree::new();
        tree.insert(disk(0, 4096, 1 << 20), true).expect("a");
        tree.insert(disk(65536, 4096, 2 << 20), false).expect("b");
        let logged = tree.take_modified();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].flags.contains(ExtentMapFlags::LOGGING));
        assert!(tree.take_modified().is_empty());
        tree.clear_logging();
        assert!(tree
            .snapshot()
            .iter()
            .all(|e| !e.flags.contains(ExtentMapFlags::LOGGING)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn entries_never_overlap(ops in proptest::collection::vec((0_u64..64, 1_u64..16, any::<bool>(), any::<bool>()), 1..60)) {
            let tree = ExtentMapTree::new();
            for (start, len, drop_first, pinned) in ops {
                let (start, len) = (start * 4096, len * 4096);
                let mut em = disk(start, len, (1 << 30) + start);
                if pinned {
                    em.flags = ExtentMapFlags::PINNED;
                }
                if drop_first {
                    let _ = tree.add_with_retry(em, true);
                } else {
                    let _ = tree.insert(em, false);
                }
                if start % 3 == 0 {
                    tree.drop_range(start, start + len / 2 + 1, true);
                }
                if start % 5 == 0 {
                    tree.unpin(start, len, 7);
                }
                let all = tree.snapshot();
                for pair in all.windows(2) {
                    prop_assert!(pair[0].end() <= pair[1].start);
                }
            }
        }
    }
}
