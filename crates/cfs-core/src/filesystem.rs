//! Mounted filesystem.
//!
//! [`Filesystem`] ties the pieces together: the metadata store and its
//! transaction manager, the data allocator, the write engine over the
//! mirrored devices, and the [`FsInfo`] context the data engine runs on.
//! Mounting an existing [`MetadataImage`] rebuilds allocator state from the
//! committed extent tree.

use crate::check::{ConsistencyReport, check_metadata};
use crate::options::{EngineKind, MountOptions};
use cfs_alloc::{AllocatorGeometry, DataAllocator, SpaceSnapshot};
use cfs_block::{BioEngine, ByteDevice, InlineEngine, IoEngineStats, MirrorSet, ThreadedEngine};
use cfs_btree::items::mode;
use cfs_btree::{ItemReader, Key, MetadataImage, MetadataStore, TransactionManager, TreeId, item_type};
use cfs_error::{CfsError, Result};
use cfs_inode::{DiagnosticsLog, FileHandle, FsInfo, Inode, InodeFlags};
use cfs_types::{Generation, InodeNumber, RootId};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// First byte of the data address space. Everything below is reserved.
pub const DATA_START: u64 = 1024 * 1024;

/// Space and IO counters at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub generation: u64,
    pub data: SpaceSnapshot,
    pub metadata: SpaceSnapshot,
    pub free_data_bytes: u64,
    pub block_groups: usize,
    pub engine: &'static str,
    pub reads: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub repaired_sectors: u64,
    pub corruptions: usize,
}

pub struct Filesystem {
    options: MountOptions,
    store: Arc<MetadataStore>,
    fs: Arc<FsInfo>,
    device_len: u64,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("options", &self.options)
            .field("device_len", &self.device_len)
            .field("generation", &self.store.durable_generation())
            .finish_non_exhaustive()
    }
}

fn build_engine(
    devices: Vec<Arc<dyn ByteDevice>>,
    options: &MountOptions,
) -> Result<(Arc<dyn BioEngine>, u64)> {
    let mirrors = MirrorSet::new(devices)?;
    let len = mirrors.len_bytes();
    let engine: Arc<dyn BioEngine> = match options.engine {
        EngineKind::Inline => Arc::new(InlineEngine::new(mirrors)),
        EngineKind::Threaded => Arc::new(ThreadedEngine::new(mirrors, options.endio_threads)?),
    };
    Ok((engine, len))
}

impl Filesystem {
    /// Create a fresh filesystem on `devices`, one device per copy.
    pub fn mount(devices: Vec<Arc<dyn ByteDevice>>, options: MountOptions) -> Result<Self> {
        let (engine, len) = build_engine(devices, &options)?;
        Self::mount_with_engine(engine, len, options, None)
    }

    /// Mount `devices` with committed metadata from an earlier session.
    pub fn mount_image(
        devices: Vec<Arc<dyn ByteDevice>>,
        options: MountOptions,
        image: MetadataImage,
    ) -> Result<Self> {
        let (engine, len) = build_engine(devices, &options)?;
        Self::mount_with_engine(engine, len, options, Some(image))
    }

    /// Mount on a caller-built engine covering `device_len` bytes.
    pub fn mount_with_engine(
        engine: Arc<dyn BioEngine>,
        device_len: u64,
        options: MountOptions,
        image: Option<MetadataImage>,
    ) -> Result<Self> {
        let config = options.to_fs_config()?;
        if engine.num_copies() != options.mirrors {
            return Err(CfsError::InvalidArgument(format!(
                "mirrors={} but {} device copies were given",
                options.mirrors,
                engine.num_copies()
            )));
        }
        if device_len <= DATA_START {
            return Err(CfsError::InvalidArgument(format!(
                "device of {device_len} bytes has no room for data"
            )));
        }

        let store = Arc::new(image.map_or_else(MetadataStore::new, MetadataStore::from_image));
        let alloc = Arc::new(DataAllocator::new(AllocatorGeometry {
            sectorsize: config.sectorsize,
            data_start: DATA_START,
            data_len: device_len - DATA_START,
            block_group_size: options.block_group_size,
        })?);
        let mut extents = 0_usize;
        for (key, _) in store.range_items(TreeId::Extent, &Key::MIN, &Key::MAX) {
            if key.item_type == item_type::EXTENT_ITEM {
                alloc.mark_used(key.objectid, key.offset)?;
                extents += 1;
            }
        }

        let txn = TransactionManager::new(Arc::clone(&store));
        let fs = FsInfo::new(config, txn, alloc, engine)?;
        fs.ensure_root(RootId::FS_TREE)?;
        if store.durable_generation() == 0 {
            fs.commit()?;
        }
        info!(
            target: "cfs::mount",
            device_len,
            mirrors = options.mirrors,
            engine = fs.engine().name(),
            generation = store.durable_generation(),
            extents,
            "filesystem mounted"
        );
        Ok(Self {
            options,
            store,
            fs,
            device_len,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn fs_info(&self) -> &Arc<FsInfo> {
        &self.fs
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.device_len
    }

    /// Last durably committed generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation(self.store.durable_generation())
    }

    #[must_use]
    pub fn diagnostics(&self) -> &DiagnosticsLog {
        self.fs.diagnostics()
    }

    // ── Namespace ───────────────────────────────────────────────────────────

    pub fn create_subvolume(&self) -> Result<RootId> {
        self.fs.create_subvolume()
    }

    #[must_use]
    pub fn roots(&self) -> Vec<RootId> {
        self.fs.root_ids()
    }

    /// Create an empty regular file in `root`.
    pub fn create_file(&self, root: RootId) -> Result<InodeNumber> {
        let root = self.fs.open_root(root)?;
        let flags = self.fs.config().default_inode_flags();
        let inode = self
            .fs
            .create_inode(&root, mode::S_IFREG | 0o644, flags)?;
        Ok(inode.ino())
    }

    /// Create a symlink in `root` pointing at `target`.
    pub fn create_symlink(&self, root: RootId, target: &str) -> Result<InodeNumber> {
        let root = self.fs.open_root(root)?;
        let inode = self
            .fs
            .create_inode(&root, mode::S_IFLNK | 0o777, InodeFlags::empty())?;
        inode.set_symlink_target(target.as_bytes())?;
        Ok(inode.ino())
    }

    pub fn inode(&self, root: RootId, ino: InodeNumber) -> Result<Arc<Inode>> {
        let root = self.fs.open_root(root)?;
        self.fs.iget(&root, ino)
    }

    /// Open a regular file for IO.
    pub fn open(&self, root: RootId, ino: InodeNumber) -> Result<FileHandle> {
        let inode = self.inode(root, ino)?;
        if !inode.is_regular() {
            return Err(CfsError::InvalidArgument(format!(
                "inode {} in root {} is not a regular file",
                ino.0, root.0
            )));
        }
        Ok(FileHandle::new(inode))
    }

    pub fn list_files(&self, root: RootId) -> Result<Vec<InodeNumber>> {
        self.fs.list_files(root)
    }

    pub fn snapshot(&self, root: RootId) -> Result<RootId> {
        self.fs.snapshot(root)
    }

    // ── Writeback ───────────────────────────────────────────────────────────

    /// Start writeback of every dirty inode. Returns how many were flushed.
    pub fn start_delalloc_roots(&self) -> Result<usize> {
        self.fs.start_delalloc_roots()
    }

    /// Flush, wait and commit.
    pub fn sync(&self) -> Result<Generation> {
        self.fs.sync()
    }

    /// Commit whatever completed IO has staged so far.
    pub fn commit(&self) -> Result<Generation> {
        self.fs.commit()
    }

    // ── Reports ─────────────────────────────────────────────────────────────

    /// Cross-check the committed metadata.
    pub fn check(&self) -> Result<ConsistencyReport> {
        check_metadata(&*self.store, self.fs.sectorsize())
    }

    #[must_use]
    pub fn usage(&self) -> UsageReport {
        let IoEngineStats {
            reads,
            writes,
            write_errors,
            ..
        } = self.fs.engine().stats();
        let alloc = self.fs.alloc();
        UsageReport {
            generation: self.store.durable_generation(),
            data: self.fs.data_space().snapshot(),
            metadata: self.fs.meta_space().snapshot(),
            free_data_bytes: alloc.free_bytes(),
            block_groups: alloc.block_groups().len(),
            engine: self.fs.engine().name(),
            reads,
            writes,
            write_errors,
            repaired_sectors: self.fs.diagnostics().repaired_sectors(),
            corruptions: self.fs.diagnostics().corruptions().len(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Flush everything, commit and return the committed metadata.
    pub fn unmount(self) -> Result<MetadataImage> {
        let synced = self.fs.sync();
        self.fs.shutdown();
        let generation = synced?;
        info!(target: "cfs::mount", generation = generation.0, "filesystem unmounted");
        Ok(self.store.image())
    }

    /// Power loss: keep only what is durably committed. In-flight IO is
    /// abandoned, not waited for.
    #[must_use]
    pub fn crash(self) -> MetadataImage {
        warn!(
            target: "cfs::mount",
            generation = self.store.durable_generation(),
            "simulated crash, uncommitted state dropped"
        );
        self.store.image()
    }
}
