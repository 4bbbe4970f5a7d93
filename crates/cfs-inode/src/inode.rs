//! In-memory inode.
//!
//! Each inode owns the per-file trees the engine works on: the extent IO
//! tree (range lock plus delalloc and state bits, with accounting hooks),
//! a file-extent tree whose `DIRTY` bits mark ranges whose metadata is
//! settled, the extent map cache, the ordered extent tree and the page
//! cache.
//!
//! `disk_i_size` is the size persisted in the inode item. It only moves
//! past a range once that range is settled, so a crash never exposes a
//! size covering bytes whose file extent item was never committed.

use crate::accounting::InodeAccounting;
use crate::fs_info::FsInfo;
use crate::ops::InodeOps;
use crate::ordered::OrderedTree;
use crate::page_cache::PageCache;
use crate::root::Root;
use bitflags::bitflags;
use cfs_btree::TransHandle;
use cfs_btree::fs_tree::write_inode;
use cfs_btree::items::{InodeItem, inode_flags, mode};
use cfs_error::{CfsError, Result};
use cfs_extent::{ExtentBits, ExtentIoTree, ExtentMapTree, NoHooks};
use cfs_types::{InodeNumber, MAX_EXTENT_SIZE, RootId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

bitflags! {
    /// Inode flags. The low 32 bits are persisted in the inode item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InodeFlags: u64 {
        const NODATASUM    = inode_flags::NODATASUM;
        const NODATACOW    = inode_flags::NODATACOW;
        const COMPRESS     = inode_flags::COMPRESS;
        const NOCOMPRESS   = inode_flags::NOCOMPRESS;
        const PREALLOC     = inode_flags::PREALLOC;
        /// Next fsync must log the whole inode.
        const FULL_SYNC    = 1 << 32;
        /// Relocation target: extents are reserved at their exact size.
        const RELOC_TARGET = 1 << 33;
    }
}

impl InodeFlags {
    pub const PERSISTENT: Self = Self::from_bits_truncate(0xffff_ffff);
}

/// Mutable inode attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeState {
    pub size: u64,
    pub disk_i_size: u64,
    pub flags: InodeFlags,
    pub generation: u64,
    pub mode: u32,
    pub nbytes: u64,
}

/// Write-error indicator with per-observer sequence sampling.
///
/// Each error bumps the sequence. An observer that sampled an older
/// sequence sees the latest error exactly once.
#[derive(Debug, Default)]
pub struct ErrSeq {
    inner: Mutex<(u64, Option<CfsError>)>,
}

impl ErrSeq {
    pub fn set(&self, err: CfsError) {
        let mut inner = self.inner.lock();
        inner.0 += 1;
        inner.1 = Some(err);
    }

    #[must_use]
    pub fn sample(&self) -> u64 {
        self.inner.lock().0
    }

    /// Report the current error if it is newer than `since`, then advance
    /// `since`.
    pub fn check(&self, since: &mut u64) -> Result<()> {
        let inner = self.inner.lock();
        if inner.0 == *since {
            return Ok(());
        }
        *since = inner.0;
        inner.1.as_ref().map_or(Ok(()), |err| Err(err.duplicate()))
    }
}

pub struct Inode {
    pub(crate) fs: Arc<FsInfo>,
    pub(crate) root: Arc<Root>,
    ino: InodeNumber,
    ops: InodeOps,
    pub(crate) io_tree: ExtentIoTree,
    pub(crate) file_extent_tree: ExtentIoTree,
    pub(crate) em_tree: ExtentMapTree,
    pub(crate) ordered: OrderedTree,
    pub(crate) pages: PageCache,
    pub(crate) acct: Arc<InodeAccounting>,
    pub(crate) state: Mutex<InodeState>,
    pub(crate) mapping_error: ErrSeq,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("root", &self.root.id())
            .field("ino", &self.ino)
            .field("ops", &self.ops)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Inode {
    /// Build the in-memory inode from its item.
    #[must_use]
    pub fn new(fs: &Arc<FsInfo>, root: &Arc<Root>, ino: InodeNumber, item: &InodeItem) -> Arc<Self> {
        let config = fs.config();
        let acct = Arc::new(InodeAccounting::new(
            ino.0,
            Arc::clone(fs.data_space()),
            Arc::clone(fs.meta_space()),
            config.metadata_reserve_per_extent,
            MAX_EXTENT_SIZE,
            Arc::clone(root.delalloc()),
        ));
        let file_extent_tree = ExtentIoTree::new(Arc::new(NoHooks));
        let ss = config.sectorsize;
        if item.size > 0 {
            file_extent_tree.set_bits(0, ss.round_up(item.size), ExtentBits::DIRTY);
        }
        Arc::new(Self {
            fs: Arc::clone(fs),
            root: Arc::clone(root),
            ino,
            ops: InodeOps::for_mode(item.mode),
            io_tree: ExtentIoTree::new(Arc::clone(&acct) as Arc<_>),
            file_extent_tree,
            em_tree: ExtentMapTree::new(),
            ordered: OrderedTree::new(),
            pages: PageCache::new(ss),
            acct,
            state: Mutex::new(InodeState {
                size: item.size,
                disk_i_size: item.size,
                flags: InodeFlags::from_bits_truncate(item.flags),
                generation: item.generation,
                mode: item.mode,
                nbytes: item.nbytes,
            }),
            mapping_error: ErrSeq::default(),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn root_id(&self) -> RootId {
        self.root.id()
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<FsInfo> {
        &self.fs
    }

    #[must_use]
    pub fn ops(&self) -> &InodeOps {
        &self.ops
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    #[must_use]
    pub fn disk_i_size(&self) -> u64 {
        self.state.lock().disk_i_size
    }

    #[must_use]
    pub fn nbytes(&self) -> u64 {
        self.state.lock().nbytes
    }

    #[must_use]
    pub fn flags(&self) -> InodeFlags {
        self.state.lock().flags
    }

    #[must_use]
    pub fn mode(&self) -> u32 {
        self.state.lock().mode
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode() & mode::S_IFMT == mode::S_IFREG
    }

    #[must_use]
    pub fn state(&self) -> InodeState {
        *self.state.lock()
    }

    #[must_use]
    pub fn accounting(&self) -> &InodeAccounting {
        &self.acct
    }

    #[must_use]
    pub fn io_tree(&self) -> &ExtentIoTree {
        &self.io_tree
    }

    #[must_use]
    pub fn extent_maps(&self) -> &ExtentMapTree {
        &self.em_tree
    }

    #[must_use]
    pub fn ordered_extents(&self) -> &OrderedTree {
        &self.ordered
    }

    #[must_use]
    pub fn page_cache(&self) -> &PageCache {
        &self.pages
    }

    #[must_use]
    pub fn mapping_error(&self) -> &ErrSeq {
        &self.mapping_error
    }

    /// Whether data written to this inode is checksummed.
    #[must_use]
    pub fn datasum(&self) -> bool {
        !self.flags().contains(InodeFlags::NODATASUM)
    }

    // ── Flags ───────────────────────────────────────────────────────────────

    pub(crate) fn insert_flags(&self, flags: InodeFlags) {
        self.state.lock().flags.insert(flags);
    }

    pub(crate) fn remove_flags(&self, flags: InodeFlags) {
        self.state.lock().flags.remove(flags);
    }

    /// Change the persistent inode flags. `NODATACOW` can only be toggled
    /// while the file is empty.
    pub fn set_flags(&self, flags: InodeFlags) -> Result<()> {
        self.fs.txn().check_writable()?;
        let flags = flags & InodeFlags::PERSISTENT;
        {
            let mut state = self.state.lock();
            let toggled = (state.flags ^ flags) & InodeFlags::NODATACOW;
            if !toggled.is_empty() && (state.size > 0 || state.nbytes > 0) {
                return Err(CfsError::InvalidArgument(
                    "NODATACOW can only change on an empty file".to_owned(),
                ));
            }
            let volatile = state.flags - InodeFlags::PERSISTENT;
            state.flags = flags | volatile;
        }
        let mut h = self.fs.txn().start()?;
        if let Err(err) = self.update_inode_item(&mut h) {
            return Err(h.abort(&format!("inode {} flag update: {err}", self.ino.0)));
        }
        h.end()?;
        debug!(target: "cfs::inode", ino = self.ino.0, ?flags, "inode flags changed");
        Ok(())
    }

    // ── Size tracking ───────────────────────────────────────────────────────

    pub(crate) fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    pub(crate) fn adjust_nbytes(&self, added: u64, removed: u64) {
        let mut state = self.state.lock();
        state.nbytes = state.nbytes.saturating_sub(removed) + added;
    }

    /// Mark `[start, end)` as having settled metadata and move
    /// `disk_i_size` as far as the settled prefix allows.
    pub(crate) fn settle_range(&self, start: u64, end: u64) -> u64 {
        if end > start {
            self.file_extent_tree.set_bits(start, end, ExtentBits::DIRTY);
        }
        self.update_disk_i_size()
    }

    /// Recompute `disk_i_size` from the settled prefix of the file.
    pub(crate) fn update_disk_i_size(&self) -> u64 {
        let settled = self
            .file_extent_tree
            .find_first(0, ExtentBits::DIRTY)
            .filter(|r| r.start == 0)
            .map_or(0, |r| r.end);
        let mut state = self.state.lock();
        state.disk_i_size = state.size.min(settled);
        trace!(
            target: "cfs::inode",
            ino = self.ino.0,
            size = state.size,
            disk_i_size = state.disk_i_size,
            "disk_i_size updated"
        );
        state.disk_i_size
    }

    /// The inode item as it should be persisted.
    #[must_use]
    pub fn to_item(&self, transid: u64) -> InodeItem {
        let state = self.state.lock();
        InodeItem {
            generation: state.generation,
            transid,
            size: state.disk_i_size,
            nbytes: state.nbytes,
            flags: (state.flags & InodeFlags::PERSISTENT).bits(),
            mode: state.mode,
        }
    }

    pub(crate) fn update_inode_item(&self, h: &mut TransHandle) -> Result<()> {
        let item = self.to_item(h.transid().0);
        write_inode(h, self.root.id(), self.ino, &item)
    }

    // ── Ordered extents ─────────────────────────────────────────────────────

    /// Block until no ordered extent overlaps `[start, start + len)`.
    pub fn wait_ordered(&self, start: u64, len: u64) {
        self.ordered.wait_range(start, len);
    }

    /// Lock `[start, end)` in the IO tree once no ordered extent overlaps
    /// it. Returns with the range locked.
    pub(crate) fn lock_and_wait_ordered(&self, start: u64, end: u64) {
        loop {
            self.io_tree.lock_range(start, end);
            match self.ordered.lookup_first_in_range(start, end - start) {
                None => return,
                Some(oe) => {
                    self.io_tree.unlock_range(start, end);
                    oe.wait();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errseq_reports_once_per_observer() {
        let seq = ErrSeq::default();
        let mut a = seq.sample();
        let mut b = seq.sample();
        seq.set(CfsError::WriteFailed {
            ino: 257,
            start: 0,
            end: 4096,
        });
        assert!(matches!(seq.check(&mut a), Err(CfsError::WriteFailed { .. })));
        assert!(seq.check(&mut a).is_ok());
        assert!(seq.check(&mut b).is_err());
        let mut late = seq.sample();
        assert!(seq.check(&mut late).is_ok());
    }

    #[test]
    fn persistent_flags_fit_the_item() {
        let flags = InodeFlags::NODATACOW | InodeFlags::FULL_SYNC | InodeFlags::RELOC_TARGET;
        assert_eq!((flags & InodeFlags::PERSISTENT), InodeFlags::NODATACOW);
        assert_eq!(
            InodeFlags::from_bits_truncate(inode_flags::COMPRESS | inode_flags::PREALLOC),
            InodeFlags::COMPRESS | InodeFlags::PREALLOC
        );
    }
}
