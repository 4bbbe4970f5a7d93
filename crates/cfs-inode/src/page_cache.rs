//! Per-inode cache of sector-sized pages.
//!
//! Dirty pages hold written data until writeback captures it for an
//! ordered extent. Pages stay cached (clean, up to date) after their IO
//! completes; a failed write drops them so the next read sees the error
//! state in the IO tree instead of stale bytes.

use bitflags::bitflags;
use cfs_types::SectorSize;
use parking_lot::Mutex;
use std::collections::BTreeMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        const DIRTY     = 1 << 0;
        const UPTODATE  = 1 << 1;
        const WRITEBACK = 1 << 2;
        const ERROR     = 1 << 3;
    }
}

#[derive(Debug, Clone)]
struct Page {
    data: Vec<u8>,
    flags: PageFlags,
}

#[derive(Debug)]
pub struct PageCache {
    pagesize: SectorSize,
    /// Keyed by page start offset.
    pages: Mutex<BTreeMap<u64, Page>>,
}

impl PageCache {
    #[must_use]
    pub fn new(pagesize: SectorSize) -> Self {
        Self {
            pagesize,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    #[must_use]
    pub fn flags(&self, page_start: u64) -> Option<PageFlags> {
        self.pages.lock().get(&page_start).map(|p| p.flags)
    }

    /// Copy of an up-to-date page.
    #[must_use]
    pub fn get(&self, page_start: u64) -> Option<Vec<u8>> {
        self.pages
            .lock()
            .get(&page_start)
            .filter(|p| p.flags.contains(PageFlags::UPTODATE))
            .map(|p| p.data.clone())
    }

    /// Cache a page read from disk unless a newer copy is already present.
    pub fn insert_clean(&self, page_start: u64, data: Vec<u8>) {
        self.pages.lock().entry(page_start).or_insert(Page {
            data,
            flags: PageFlags::UPTODATE,
        });
    }

    /// Copy `data` into the pages covering `[offset, offset + data.len())`
    /// and mark them dirty. Pages not cached start from `seeds` (partial
    /// pages read by the caller) or zeros.
    pub fn write_bytes(&self, offset: u64, data: &[u8], seeds: &BTreeMap<u64, Vec<u8>>) {
        let ps = self.pagesize.bytes();
        let page_len = usize::try_from(ps).unwrap_or(usize::MAX);
        let end = offset + data.len() as u64;
        let mut pages = self.pages.lock();
        let mut pos = offset;
        while pos < end {
            let page_start = self.pagesize.round_down(pos);
            let in_page = usize::try_from(pos - page_start).unwrap_or(0);
            let n = usize::try_from((page_start + ps).min(end) - pos).unwrap_or(0);
            let src = usize::try_from(pos - offset).unwrap_or(0);
            let page = pages.entry(page_start).or_insert_with(|| Page {
                data: seeds
                    .get(&page_start)
                    .cloned()
                    .unwrap_or_else(|| vec![0_u8; page_len]),
                flags: PageFlags::empty(),
            });
            page.data.resize(page_len, 0);
            page.data[in_page..in_page + n].copy_from_slice(&data[src..src + n]);
            page.flags.insert(PageFlags::DIRTY | PageFlags::UPTODATE);
            page.flags.remove(PageFlags::ERROR);
            pos += n as u64;
        }
    }

    /// Concatenate the pages of `[start, end)` for submission, moving them
    /// from dirty to writeback. Missing pages read as zeros.
    pub fn capture_for_writeback(&self, start: u64, end: u64) -> Vec<u8> {
        let ps = self.pagesize.bytes();
        let page_len = usize::try_from(ps).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(usize::try_from(end - start).unwrap_or(0));
        let mut pages = self.pages.lock();
        let mut pos = start;
        while pos < end {
            match pages.get_mut(&pos) {
                Some(page) => {
                    out.extend_from_slice(&page.data);
                    page.flags.remove(PageFlags::DIRTY);
                    page.flags.insert(PageFlags::WRITEBACK);
                }
                None => out.resize(out.len() + page_len, 0),
            }
            pos += ps;
        }
        out
    }

    /// Writeback of `[start, end)` finished. Failed pages are dropped.
    pub fn end_writeback(&self, start: u64, end: u64, ok: bool) {
        let mut pages = self.pages.lock();
        let keys: Vec<u64> = pages.range(start..end).map(|(&k, _)| k).collect();
        for key in keys {
            if ok {
                if let Some(page) = pages.get_mut(&key) {
                    page.flags.remove(PageFlags::WRITEBACK);
                }
            } else {
                pages.remove(&key);
            }
        }
    }

    /// Forget every page overlapping `[start, end)`.
    pub fn drop_range(&self, start: u64, end: u64) -> usize {
        let first = self.pagesize.round_down(start);
        let mut pages = self.pages.lock();
        let keys: Vec<u64> = pages.range(first..end).map(|(&k, _)| k).collect();
        for key in &keys {
            pages.remove(key);
        }
        keys.len()
    }

    /// Evict clean pages; dirty and writeback pages stay.
    pub fn drop_clean(&self) -> usize {
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|_, p| p.flags.intersects(PageFlags::DIRTY | PageFlags::WRITEBACK));
        before - pages.len()
    }
}
