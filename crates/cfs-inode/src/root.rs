//! Roots and the delalloc registry.
//!
//! The registry holds every root that has at least one inode with dirty
//! delalloc bytes; each root holds the set of such inodes. Both sets are
//! maintained by the accounting hooks. Flushers enumerate them with
//! splice-and-restore: take the whole set under the lock, work without it,
//! then put back whatever is still dirty.

use crate::inode::Inode;
use cfs_types::{InodeNumber, RootId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::trace;

/// Filesystem-wide set of roots with delalloc inodes.
#[derive(Debug, Default)]
pub struct DelallocRegistry {
    roots: Mutex<BTreeSet<RootId>>,
}

impl DelallocRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, root: RootId) {
        if self.roots.lock().insert(root) {
            trace!(target: "cfs::delalloc", root = root.0, "root linked");
        }
    }

    pub fn unlink(&self, root: RootId) {
        if self.roots.lock().remove(&root) {
            trace!(target: "cfs::delalloc", root = root.0, "root unlinked");
        }
    }

    #[must_use]
    pub fn contains(&self, root: RootId) -> bool {
        self.roots.lock().contains(&root)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }

    /// Move every linked root out of the registry.
    #[must_use]
    pub fn splice(&self) -> Vec<RootId> {
        std::mem::take(&mut *self.roots.lock()).into_iter().collect()
    }
}

/// Per-root set of inodes with delalloc bytes.
#[derive(Debug)]
pub struct RootDelalloc {
    root: RootId,
    inodes: Mutex<BTreeSet<u64>>,
    registry: Arc<DelallocRegistry>,
}

impl RootDelalloc {
    #[must_use]
    pub fn new(root: RootId, registry: Arc<DelallocRegistry>) -> Self {
        Self {
            root,
            inodes: Mutex::new(BTreeSet::new()),
            registry,
        }
    }

    pub fn link(&self, ino: u64) {
        let mut inodes = self.inodes.lock();
        if inodes.insert(ino) && inodes.len() == 1 {
            self.registry.link(self.root);
        }
    }

    pub fn unlink(&self, ino: u64) {
        let mut inodes = self.inodes.lock();
        if inodes.remove(&ino) && inodes.is_empty() {
            self.registry.unlink(self.root);
        }
    }

    #[must_use]
    pub fn contains(&self, ino: u64) -> bool {
        self.inodes.lock().contains(&ino)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.lock().is_empty()
    }

    /// Move the inode set aside.
    #[must_use]
    pub fn splice(&self) -> Vec<u64> {
        std::mem::take(&mut *self.inodes.lock()).into_iter().collect()
    }

    /// Put back inodes that are still dirty after a splice.
    pub fn restore(&self, inos: impl IntoIterator<Item = u64>) {
        let mut inodes = self.inodes.lock();
        inodes.extend(inos);
        if !inodes.is_empty() {
            self.registry.link(self.root);
        }
    }
}

/// One subvolume or snapshot tree and its in-memory inodes.
pub struct Root {
    id: RootId,
    delalloc: Arc<RootDelalloc>,
    /// Inodes in use. Cleared at unmount.
    inodes: Mutex<HashMap<u64, Arc<Inode>>>,
    pending_snapshots: AtomicU32,
    last_snapshot: AtomicU64,
    next_ino: AtomicU64,
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("id", &self.id)
            .field("inodes", &self.inodes.lock().len())
            .field("last_snapshot", &self.last_snapshot())
            .finish_non_exhaustive()
    }
}

/// Holds a root's pending-snapshot count up while a snapshot is taken.
#[derive(Debug)]
pub struct PendingSnapshot<'a> {
    root: &'a Root,
}

impl Drop for PendingSnapshot<'_> {
    fn drop(&mut self) {
        self.root.pending_snapshots.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Root {
    #[must_use]
    pub fn new(
        id: RootId,
        registry: Arc<DelallocRegistry>,
        last_snapshot: u64,
        next_ino: u64,
    ) -> Self {
        Self {
            id,
            delalloc: Arc::new(RootDelalloc::new(id, registry)),
            inodes: Mutex::new(HashMap::new()),
            pending_snapshots: AtomicU32::new(0),
            last_snapshot: AtomicU64::new(last_snapshot),
            next_ino: AtomicU64::new(next_ino.max(InodeNumber::FIRST_FREE.0)),
        }
    }

    #[must_use]
    pub fn id(&self) -> RootId {
        self.id
    }

    #[must_use]
    pub fn delalloc(&self) -> &Arc<RootDelalloc> {
        &self.delalloc
    }

    #[must_use]
    pub fn last_snapshot(&self) -> u64 {
        self.last_snapshot.load(Ordering::Acquire)
    }

    pub fn set_last_snapshot(&self, generation: u64) {
        self.last_snapshot.fetch_max(generation, Ordering::AcqRel);
    }

    #[must_use]
    pub fn pending_snapshots(&self) -> u32 {
        self.pending_snapshots.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn begin_snapshot(&self) -> PendingSnapshot<'_> {
        self.pending_snapshots.fetch_add(1, Ordering::AcqRel);
        PendingSnapshot { root: self }
    }

    /// Hand out the next free inode number.
    pub fn alloc_ino(&self) -> InodeNumber {
        InodeNumber(self.next_ino.fetch_add(1, Ordering::AcqRel))
    }

    #[must_use]
    pub fn next_ino(&self) -> u64 {
        self.next_ino.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cached_inode(&self, ino: u64) -> Option<Arc<Inode>> {
        self.inodes.lock().get(&ino).cloned()
    }

    /// Cache `inode`, or return the copy another thread cached first.
    pub fn cache_inode(&self, inode: Arc<Inode>) -> Arc<Inode> {
        Arc::clone(
            self.inodes
                .lock()
                .entry(inode.ino().0)
                .or_insert(inode),
        )
    }

    #[must_use]
    pub fn cached_inodes(&self) -> Vec<Arc<Inode>> {
        let mut all: Vec<Arc<Inode>> = self.inodes.lock().values().cloned().collect();
        all.sort_by_key(|i| i.ino());
        all
    }

    /// Forget every cached inode.
    pub fn clear_inodes(&self) {
        self.inodes.lock().clear();
    }
}
