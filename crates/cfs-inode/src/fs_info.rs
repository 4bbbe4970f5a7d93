//! Filesystem-wide context shared by every inode.
//!
//! Owns the transaction manager, the data allocator, space counters, the IO
//! engine, both worker pools, the delalloc registry and the root table. A
//! commit hook unpins extent maps whose ordered extents committed and frees
//! extents whose last reference was dropped once the dropping transaction
//! is durable.

use crate::diagnostics::DiagnosticsLog;
use crate::inode::{Inode, InodeFlags};
use crate::root::{DelallocRegistry, Root};
use crate::workers::WorkerPool;
use cfs_alloc::{DataAllocator, SpaceInfo, SpaceKind};
use cfs_block::BioEngine;
use cfs_btree::backref::add_extent_ref;
use cfs_btree::fs_tree::{
    inode_key, list_roots, read_inode, read_root, write_root,
};
use cfs_btree::items::{FileExtentItem, InodeItem, RootItem, mode};
use cfs_btree::{ItemReader, Key, TransactionManager, TreeId, item_type, parse_to_cfs_error};
use cfs_error::{CfsError, Result};
use cfs_types::{
    CompressionType, DEFAULT_MAX_INLINE, DEFAULT_NODESIZE, Generation, InodeNumber, RootId,
    SectorSize,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Minimum metadata pool size.
const MIN_METADATA_SPACE: u64 = 16 * 1024 * 1024;

/// Engine tunables, resolved from mount options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsConfig {
    pub sectorsize: SectorSize,
    pub nodesize: u32,
    pub max_inline: u64,
    pub compression: CompressionType,
    pub compress_level: u32,
    pub compress_force: bool,
    pub datacow: bool,
    pub datasum: bool,
    /// Compression workers; 0 means one per CPU.
    pub thread_pool: usize,
    pub endio_threads: usize,
    pub max_bio_size: u64,
    pub metadata_reserve_per_extent: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            sectorsize: SectorSize::default(),
            nodesize: DEFAULT_NODESIZE,
            max_inline: DEFAULT_MAX_INLINE,
            compression: CompressionType::None,
            compress_level: cfs_compress::DEFAULT_LEVEL,
            compress_force: false,
            datacow: true,
            datasum: true,
            thread_pool: 0,
            endio_threads: 2,
            max_bio_size: 64 * 1024,
            metadata_reserve_per_extent: 2 * u64::from(DEFAULT_NODESIZE),
        }
    }
}

impl FsConfig {
    /// Inode flags a newly created regular file starts with.
    #[must_use]
    pub fn default_inode_flags(&self) -> InodeFlags {
        let mut flags = InodeFlags::empty();
        if !self.datacow {
            flags |= InodeFlags::NODATACOW | InodeFlags::NODATASUM;
        }
        if !self.datasum {
            flags |= InodeFlags::NODATASUM;
        }
        flags
    }
}

#[derive(Debug)]
struct PendingUnpin {
    inode: Weak<Inode>,
    start: u64,
    len: u64,
}

pub struct FsInfo {
    config: FsConfig,
    txn: TransactionManager,
    alloc: Arc<DataAllocator>,
    meta_space: Arc<SpaceInfo>,
    engine: Arc<dyn BioEngine>,
    compress_pool: WorkerPool,
    endio_pool: WorkerPool,
    registry: Arc<DelallocRegistry>,
    roots: RwLock<BTreeMap<RootId, Arc<Root>>>,
    pending_unpins: Mutex<Vec<PendingUnpin>>,
    pinned_frees: Mutex<Vec<(u64, u64)>>,
    diagnostics: DiagnosticsLog,
    reclaim_lock: Mutex<()>,
}

impl std::fmt::Debug for FsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsInfo")
            .field("config", &self.config)
            .field("txn", &self.txn)
            .field("engine", &self.engine.name())
            .field("roots", &self.roots.read().len())
            .finish_non_exhaustive()
    }
}

impl FsInfo {
    pub fn new(
        config: FsConfig,
        txn: TransactionManager,
        alloc: Arc<DataAllocator>,
        engine: Arc<dyn BioEngine>,
    ) -> Result<Arc<Self>> {
        let meta_total = (alloc.space_info().total_bytes() / 8).max(MIN_METADATA_SPACE);
        let fs = Arc::new(Self {
            compress_pool: WorkerPool::new("compress", config.thread_pool)?,
            endio_pool: WorkerPool::new("endio", config.endio_threads.max(1))?,
            config,
            txn,
            alloc,
            meta_space: Arc::new(SpaceInfo::new(SpaceKind::Metadata, meta_total)),
            engine,
            registry: Arc::new(DelallocRegistry::new()),
            roots: RwLock::new(BTreeMap::new()),
            pending_unpins: Mutex::new(Vec::new()),
            pinned_frees: Mutex::new(Vec::new()),
            diagnostics: DiagnosticsLog::new(),
            reclaim_lock: Mutex::new(()),
        });
        let weak = Arc::downgrade(&fs);
        fs.txn.register_commit_hook(Arc::new(move |generation| {
            if let Some(fs) = weak.upgrade() {
                fs.after_commit(generation);
            }
        }));
        debug!(
            target: "cfs::fs",
            engine = fs.engine.name(),
            compress_threads = fs.compress_pool.threads(),
            meta_total,
            "filesystem context ready"
        );
        Ok(fs)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    #[must_use]
    pub fn sectorsize(&self) -> SectorSize {
        self.config.sectorsize
    }

    #[must_use]
    pub fn txn(&self) -> &TransactionManager {
        &self.txn
    }

    #[must_use]
    pub fn alloc(&self) -> &Arc<DataAllocator> {
        &self.alloc
    }

    #[must_use]
    pub fn data_space(&self) -> &Arc<SpaceInfo> {
        self.alloc.space_info()
    }

    #[must_use]
    pub fn meta_space(&self) -> &Arc<SpaceInfo> {
        &self.meta_space
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn BioEngine> {
        &self.engine
    }

    #[must_use]
    pub fn compress_pool(&self) -> &WorkerPool {
        &self.compress_pool
    }

    #[must_use]
    pub fn endio_pool(&self) -> &WorkerPool {
        &self.endio_pool
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DelallocRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticsLog {
        &self.diagnostics
    }

    // ── Commit integration ─────────────────────────────────────────────────

    /// Unpin `[start, start + len)` of `inode`'s extent maps at the next
    /// commit.
    pub fn queue_unpin(&self, inode: &Arc<Inode>, start: u64, len: u64) {
        self.pending_unpins.lock().push(PendingUnpin {
            inode: Arc::downgrade(inode),
            start,
            len,
        });
    }

    /// Free extents whose last reference was dropped once the dropping
    /// transaction is durable.
    pub fn queue_pinned_frees(&self, freed: impl IntoIterator<Item = (u64, u64)>) {
        self.pinned_frees.lock().extend(freed);
    }

    fn after_commit(&self, generation: Generation) {
        let unpins = std::mem::take(&mut *self.pending_unpins.lock());
        for p in &unpins {
            if let Some(inode) = p.inode.upgrade() {
                inode.extent_maps().unpin(p.start, p.len, generation.0);
            }
        }
        let frees = std::mem::take(&mut *self.pinned_frees.lock());
        for &(start, len) in &frees {
            if let Err(err) = self.alloc.free_used(start, len) {
                warn!(target: "cfs::fs", start, len, error = %err, "pinned extent free failed");
            }
        }
        debug!(
            target: "cfs::fs",
            generation = generation.0,
            unpinned = unpins.len(),
            freed = frees.len(),
            "post-commit work done"
        );
    }

    pub fn commit(&self) -> Result<Generation> {
        self.txn.commit()
    }

    // ── Roots ───────────────────────────────────────────────────────────────

    /// The in-memory root for `id`, loading it from its root item.
    pub fn open_root(&self, id: RootId) -> Result<Arc<Root>> {
        if let Some(root) = self.roots.read().get(&id) {
            return Ok(Arc::clone(root));
        }
        let item = read_root(&**self.txn.store(), id)?
            .ok_or_else(|| CfsError::NotFound(format!("root {}", id.0)))?;
        let root = Arc::new(Root::new(
            id,
            Arc::clone(&self.registry),
            item.last_snapshot,
            item.highest_objectid,
        ));
        Ok(Arc::clone(self.roots.write().entry(id).or_insert(root)))
    }

    #[must_use]
    pub fn root_ids(&self) -> Vec<RootId> {
        list_roots(&**self.txn.store())
            .map(|roots| roots.into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default()
    }

    fn next_root_id(&self) -> Result<RootId> {
        let highest = list_roots(&**self.txn.store())?
            .last()
            .map_or(0, |(id, _)| id.0);
        Ok(RootId(highest.max(RootId::FIRST_FREE.0 - 1) + 1))
    }

    /// Create the default tree if it does not exist yet.
    pub fn ensure_root(&self, id: RootId) -> Result<Arc<Root>> {
        if read_root(&**self.txn.store(), id)?.is_none() {
            let mut h = self.txn.start()?;
            let transid = h.transid().0;
            write_root(
                &mut h,
                id,
                &RootItem {
                    generation: transid,
                    last_snapshot: 0,
                    highest_objectid: InodeNumber::FIRST_FREE.0,
                },
            )?;
            h.end()?;
            info!(target: "cfs::fs", root = id.0, "root created");
        }
        self.open_root(id)
    }

    pub fn create_subvolume(&self) -> Result<RootId> {
        self.txn.check_writable()?;
        let id = self.next_root_id()?;
        self.ensure_root(id)?;
        Ok(id)
    }

    // ── Inodes ──────────────────────────────────────────────────────────────

    /// Create an inode with `mode` in `root`. Flags outside
    /// `InodeFlags::PERSISTENT` only live on the in-memory inode.
    pub fn create_inode(
        self: &Arc<Self>,
        root: &Arc<Root>,
        mode_bits: u32,
        flags: InodeFlags,
    ) -> Result<Arc<Inode>> {
        self.txn.check_writable()?;
        let ino = root.alloc_ino();
        let mut h = self.txn.start()?;
        let transid = h.transid().0;
        let item = InodeItem {
            generation: transid,
            transid,
            size: 0,
            nbytes: 0,
            flags: (flags & InodeFlags::PERSISTENT).bits(),
            mode: mode_bits,
        };
        h.insert(TreeId::Fs(root.id()), inode_key(ino), item.encode())?;
        let mut root_item = read_root(&h, root.id())?.unwrap_or_default();
        root_item.highest_objectid = root_item.highest_objectid.max(root.next_ino());
        write_root(&mut h, root.id(), &root_item)?;
        h.end()?;
        debug!(target: "cfs::fs", root = root.id().0, ino = ino.0, mode = mode_bits, "inode created");
        let inode = Inode::new(self, root, ino, &item);
        inode.insert_flags(flags - InodeFlags::PERSISTENT);
        Ok(root.cache_inode(inode))
    }

    /// The in-memory inode for `ino`, loading it on first use.
    pub fn iget(self: &Arc<Self>, root: &Arc<Root>, ino: InodeNumber) -> Result<Arc<Inode>> {
        if let Some(inode) = root.cached_inode(ino.0) {
            return Ok(inode);
        }
        let item = read_inode(&**self.txn.store(), root.id(), ino)?
            .ok_or_else(|| CfsError::NotFound(format!("inode {} in root {}", ino.0, root.id().0)))?;
        Ok(root.cache_inode(Inode::new(self, root, ino, &item)))
    }

    /// Regular file inode numbers of a root.
    pub fn list_files(&self, root: RootId) -> Result<Vec<InodeNumber>> {
        Ok(cfs_btree::fs_tree::list_inodes(&**self.txn.store(), root)?
            .into_iter()
            .filter(|(_, item)| item.mode & mode::S_IFMT == mode::S_IFREG)
            .map(|(ino, _)| ino)
            .collect())
    }

    // ── Delalloc flushing ──────────────────────────────────────────────────

    /// Start writeback of every delalloc inode in `root`. Returns how many
    /// inodes were flushed.
    pub fn flush_root(&self, root: &Root) -> Result<usize> {
        let inos = root.delalloc().splice();
        let mut first_err = None;
        let mut still_dirty = Vec::new();
        for &ino in &inos {
            let Some(inode) = root.cached_inode(ino) else {
                continue;
            };
            if let Err(err) = inode.flush() {
                first_err.get_or_insert(err);
            }
            if inode.accounting().delalloc_bytes() > 0 {
                still_dirty.push(ino);
            }
        }
        root.delalloc().restore(still_dirty);
        debug!(target: "cfs::delalloc", root = root.id().0, inodes = inos.len(), "root flushed");
        first_err.map_or(Ok(inos.len()), Err)
    }

    /// Block until no ordered extent of `root` is in flight.
    pub fn wait_root(&self, root: &Root) {
        for inode in root.cached_inodes() {
            inode.wait_ordered(0, u64::MAX);
        }
    }

    /// Start writeback of every delalloc inode in every root.
    pub fn start_delalloc_roots(&self) -> Result<usize> {
        let ids = self.registry.splice();
        let mut flushed = 0;
        let mut first_err = None;
        for id in ids {
            let root = match self.open_root(id) {
                Ok(root) => root,
                Err(err) => {
                    first_err.get_or_insert(err);
                    continue;
                }
            };
            match self.flush_root(&root) {
                Ok(n) => flushed += n,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
            if !root.delalloc().is_empty() {
                self.registry.link(id);
            }
        }
        first_err.map_or(Ok(flushed), Err)
    }

    /// Flush everything, wait for it and commit.
    pub fn sync(&self) -> Result<Generation> {
        let flushed = self.start_delalloc_roots();
        let roots: Vec<Arc<Root>> = self.roots.read().values().cloned().collect();
        for root in &roots {
            self.wait_root(root);
        }
        flushed?;
        self.commit()
    }

    /// Space reclaim: flush delalloc and commit so pinned extents are freed
    /// and reservations released. One pass at a time.
    pub fn reclaim(&self) -> Result<()> {
        let _guard = self.reclaim_lock.lock();
        warn!(target: "cfs::alloc", "space pressure, reclaiming");
        self.sync().map(|_| ())
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    /// Snapshot `src` into a new root. Returns the new root id.
    pub fn snapshot(&self, src_id: RootId) -> Result<RootId> {
        self.txn.check_writable()?;
        let src = self.open_root(src_id)?;
        let _pending = src.begin_snapshot();
        self.flush_root(&src)?;
        self.wait_root(&src);
        self.commit()?;

        let new_id = self.next_root_id()?;
        let mut h = self.txn.start()?;
        let transid = h.transid().0;
        let cloned = (|| -> Result<usize> {
            let items =
                self.txn
                    .store()
                    .range_items(TreeId::Fs(src_id), &Key::MIN, &Key::MAX);
            for (key, data) in &items {
                h.insert(TreeId::Fs(new_id), *key, data.clone())?;
                if key.item_type != item_type::EXTENT_DATA {
                    continue;
                }
                let item = FileExtentItem::parse(data).map_err(|e| parse_to_cfs_error(&e))?;
                if let Some(d) = item.kind.disk().filter(|d| !d.is_hole()) {
                    add_extent_ref(
                        &mut h,
                        d.disk_bytenr,
                        d.disk_num_bytes,
                        new_id.0,
                        key.objectid,
                        key.offset.wrapping_sub(d.offset),
                    )?;
                }
            }
            let mut src_item = read_root(&h, src_id)?.unwrap_or_default();
            src_item.last_snapshot = transid;
            write_root(&mut h, src_id, &src_item)?;
            write_root(
                &mut h,
                new_id,
                &RootItem {
                    generation: transid,
                    last_snapshot: transid,
                    highest_objectid: src_item.highest_objectid.max(src.next_ino()),
                },
            )?;
            Ok(items.len())
        })();
        let items = match cloned {
            Ok(n) => n,
            Err(err) => return Err(h.abort(&format!("snapshot of root {}: {err}", src_id.0))),
        };
        h.end()?;
        src.set_last_snapshot(transid);
        self.commit()?;
        info!(
            target: "cfs::fs",
            src = src_id.0,
            snapshot = new_id.0,
            generation = transid,
            items,
            "snapshot created"
        );
        Ok(new_id)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Drop every cached root and inode and stop the worker pools.
    pub fn shutdown(&self) {
        let roots: Vec<Arc<Root>> = std::mem::take(&mut *self.roots.write())
            .into_values()
            .collect();
        for root in &roots {
            self.wait_root(root);
        }
        self.compress_pool.shutdown();
        self.endio_pool.shutdown();
        for root in &roots {
            root.clear_inodes();
        }
        self.pending_unpins.lock().clear();
        info!(target: "cfs::fs", roots = roots.len(), "filesystem context shut down");
    }
}
