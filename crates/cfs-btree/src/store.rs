//! In-memory tree storage with a durable image.
//!
//! `live` holds every update applied by ended transaction handles. The
//! durable image is replaced wholesale at commit; a crash is modelled by
//! remounting from [`MetadataStore::image`], which drops everything not
//! yet committed.

use crate::{ItemReader, Key, TreeId};
use cfs_error::{CfsError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub type Tree = BTreeMap<Key, Vec<u8>>;

/// Staged updates: `None` deletes the key.
pub type Overlay = BTreeMap<(TreeId, Key), Option<Vec<u8>>>;

/// Coarse tree class used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    Root,
    Extent,
    Csum,
    Fs,
}

/// Committed metadata as it would be found after a crash.
#[derive(Debug, Clone, Default)]
pub struct MetadataImage {
    pub generation: u64,
    trees: BTreeMap<TreeId, Tree>,
}

impl MetadataImage {
    #[must_use]
    pub fn item_count(&self, tree: TreeId) -> usize {
        self.trees.get(&tree).map_or(0, BTreeMap::len)
    }
}

#[derive(Debug, Clone, Copy)]
struct WriteFault {
    tree: Option<TreeKind>,
    /// Matching writes to let through before failing.
    skip: u32,
}

/// Failure injection for metadata writes and commits.
#[derive(Debug, Default)]
pub struct MetadataFaults {
    writes: Mutex<Vec<WriteFault>>,
    fail_commit: Mutex<bool>,
}

impl MetadataFaults {
    /// Fail the `(skip + 1)`-th staged write into `tree` (any tree when
    /// `None`). Each rule fires once.
    pub fn fail_write(&self, tree: Option<TreeKind>, skip: u32) {
        self.writes.lock().push(WriteFault { tree, skip });
    }

    /// Make the next commit fail before the durable image is replaced.
    pub fn fail_next_commit(&self) {
        *self.fail_commit.lock() = true;
    }

    pub fn clear(&self) {
        self.writes.lock().clear();
        *self.fail_commit.lock() = false;
    }

    pub(crate) fn check_write(&self, tree: TreeId) -> Result<()> {
        let mut rules = self.writes.lock();
        let kind = tree.kind();
        let Some(idx) = rules
            .iter()
            .position(|r| r.tree.is_none_or(|t| t == kind))
        else {
            return Ok(());
        };
        if rules[idx].skip > 0 {
            rules[idx].skip -= 1;
            return Ok(());
        }
        rules.remove(idx);
        drop(rules);
        warn!(?tree, "injected metadata write failure");
        Err(CfsError::Io(std::io::Error::other(format!(
            "injected metadata write failure in {tree:?}"
        ))))
    }

    fn take_commit_failure(&self) -> bool {
        std::mem::take(&mut *self.fail_commit.lock())
    }
}

#[derive(Debug, Default)]
pub struct MetadataStore {
    live: RwLock<BTreeMap<TreeId, Tree>>,
    durable: Mutex<MetadataImage>,
    faults: MetadataFaults,
}

impl MetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reopen from a durable image.
    #[must_use]
    pub fn from_image(image: MetadataImage) -> Self {
        debug!(generation = image.generation, "metadata store loaded");
        Self {
            live: RwLock::new(image.trees.clone()),
            durable: Mutex::new(image),
            faults: MetadataFaults::default(),
        }
    }

    /// Copy of the last committed state.
    #[must_use]
    pub fn image(&self) -> MetadataImage {
        self.durable.lock().clone()
    }

    #[must_use]
    pub fn durable_generation(&self) -> u64 {
        self.durable.lock().generation
    }

    #[must_use]
    pub fn faults(&self) -> &MetadataFaults {
        &self.faults
    }

    #[must_use]
    pub fn item_count(&self, tree: TreeId) -> usize {
        self.live.read().get(&tree).map_or(0, BTreeMap::len)
    }

    /// Trees that currently hold at least one item.
    #[must_use]
    pub fn trees(&self) -> Vec<TreeId> {
        self.live
            .read()
            .iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Apply a handle's staged updates in one step.
    pub(crate) fn apply(&self, overlay: Overlay) {
        let mut live = self.live.write();
        for ((tree, key), value) in overlay {
            let t = live.entry(tree).or_default();
            match value {
                Some(data) => {
                    t.insert(key, data);
                }
                None => {
                    t.remove(&key);
                }
            }
        }
    }

    /// Replace the durable image with the live trees.
    pub(crate) fn persist(&self, generation: u64) -> Result<()> {
        if self.faults.take_commit_failure() {
            return Err(CfsError::Io(std::io::Error::other(
                "injected commit failure",
            )));
        }
        let trees = self.live.read().clone();
        *self.durable.lock() = MetadataImage { generation, trees };
        Ok(())
    }

    /// Largest key `<= key` in `tree` for which `skip` is false.
    pub(crate) fn prev_matching(
        &self,
        tree: TreeId,
        key: &Key,
        skip: impl Fn(&Key) -> bool,
    ) -> Option<(Key, Vec<u8>)> {
        let live = self.live.read();
        live.get(&tree)?
            .range(..=*key)
            .rev()
            .find(|(k, _)| !skip(k))
            .map(|(k, v)| (*k, v.clone()))
    }
}

impl ItemReader for MetadataStore {
    fn get_item(&self, tree: TreeId, key: &Key) -> Option<Vec<u8>> {
        self.live.read().get(&tree)?.get(key).cloned()
    }

    fn range_items(&self, tree: TreeId, lo: &Key, hi: &Key) -> Vec<(Key, Vec<u8>)> {
        if lo > hi {
            return Vec::new();
        }
        self.live.read().get(&tree).map_or_else(Vec::new, |t| {
            t.range(*lo..=*hi).map(|(k, v)| (*k, v.clone())).collect()
        })
    }

    fn prev_item(&self, tree: TreeId, key: &Key) -> Option<(Key, Vec<u8>)> {
        self.prev_matching(tree, key, |_| false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(o: u64) -> Key {
        Key::new(257, 108, o)
    }

    #[test]
    fn apply_and_read_back() {
        let store = MetadataStore::new();
        let mut ov = Overlay::new();
        ov.insert((TreeId::Extent, k(0)), Some(vec![1]));
        ov.insert((TreeId::Extent, k(10)), Some(vec![2]));
        store.apply(ov);
        assert_eq!(store.get_item(TreeId::Extent, &k(10)), Some(vec![2]));
        assert_eq!(store.range_items(TreeId::Extent, &k(0), &k(5)).len(), 1);
        assert_eq!(store.prev_item(TreeId::Extent, &k(9)).map(|(k, _)| k.offset), Some(0));
        assert!(store.prev_item(TreeId::Csum, &k(9)).is_none());

        let mut del = Overlay::new();
        del.insert((TreeId::Extent, k(0)), None);
        store.apply(del);
        assert!(store.prev_item(TreeId::Extent, &k(9)).is_none());
    }

    #[test]
    fn image_only_reflects_persisted_state() {
        let store = MetadataStore::new();
        let mut ov = Overlay::new();
        ov.insert((TreeId::Root, Key::new(5, 132, 0)), Some(vec![0; 24]));
        store.apply(ov);
        assert_eq!(store.image().item_count(TreeId::Root), 0);
        store.persist(1).expect("persist");
        let image = store.image();
        assert_eq!(image.generation, 1);
        assert_eq!(image.item_count(TreeId::Root), 1);

        store.faults().fail_next_commit();
        assert!(store.persist(2).is_err());
        assert_eq!(store.durable_generation(), 1);
        let reopened = MetadataStore::from_image(image);
        assert_eq!(reopened.item_count(TreeId::Root), 1);
    }

    #[test]
    fn write_faults_fire_once_after_skip() {
        let faults = MetadataFaults::default();
        faults.fail_write(Some(TreeKind::Csum), 1);
        assert!(faults.check_write(TreeId::Extent).is_ok());
        assert!(faults.check_write(TreeId::Csum).is_ok());
        assert!(faults.check_write(TreeId::Csum).is_err());
        assert!(faults.check_write(TreeId::Csum).is_ok());
    }
}
