//! Transaction manager and handles.
//!
//! Many handles may be open against the running transaction at once. Each
//! handle stages its updates privately and applies them to the live trees
//! in one step at [`TransHandle::end`]; an aborted handle applies nothing
//! and flips the whole filesystem read-only.
//!
//! [`TransactionManager::commit`] waits for open handles to end, blocks new
//! ones while it runs, writes the durable image and advances the
//! generation. Commit hooks run after the new generation is visible.

use crate::store::{MetadataStore, Overlay};
use crate::{ItemReader, Key, TreeId};
use cfs_error::{CfsError, Result};
use cfs_types::Generation;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Callback run after every successful commit with the committed generation.
pub type CommitHook = Arc<dyn Fn(Generation) + Send + Sync>;

#[derive(Debug, Default)]
struct TxnState {
    /// Last committed generation.
    generation: u64,
    writers: usize,
    committing: bool,
    aborted: Option<(u64, String)>,
}

struct TxnShared {
    store: Arc<MetadataStore>,
    state: Mutex<TxnState>,
    cond: Condvar,
    hooks: Mutex<Vec<CommitHook>>,
}

impl TxnShared {
    fn aborted_error(state: &TxnState) -> Option<CfsError> {
        state
            .aborted
            .as_ref()
            .map(|(transid, reason)| CfsError::TransactionAborted {
                transid: *transid,
                reason: reason.clone(),
            })
    }

    fn release_writer(&self) {
        let mut state = self.state.lock();
        state.writers = state.writers.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }
}

#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<TxnShared>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TransactionManager")
            .field("generation", &state.generation)
            .field("writers", &state.writers)
            .field("aborted", &state.aborted.is_some())
            .finish()
    }
}

impl TransactionManager {
    #[must_use]
    pub fn new(store: Arc<MetadataStore>) -> Self {
        let generation = store.durable_generation();
        Self {
            shared: Arc::new(TxnShared {
                store,
                state: Mutex::new(TxnState {
                    generation,
                    ..TxnState::default()
                }),
                cond: Condvar::new(),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.shared.store
    }

    /// Last committed generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation(self.shared.state.lock().generation)
    }

    /// Generation the next commit will produce.
    #[must_use]
    pub fn running_transid(&self) -> Generation {
        Generation(self.shared.state.lock().generation + 1)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted.is_some()
    }

    /// Fail with `TransactionAborted` once any handle aborted.
    pub fn check_writable(&self) -> Result<()> {
        let state = self.shared.state.lock();
        TxnShared::aborted_error(&state).map_or(Ok(()), Err)
    }

    pub fn register_commit_hook(&self, hook: CommitHook) {
        self.shared.hooks.lock().push(hook);
    }

    /// Join the running transaction.
    pub fn start(&self) -> Result<TransHandle> {
        let mut state = self.shared.state.lock();
        while state.committing {
            self.shared.cond.wait(&mut state);
        }
        if let Some(err) = TxnShared::aborted_error(&state) {
            return Err(err);
        }
        state.writers += 1;
        let transid = state.generation + 1;
        drop(state);
        Ok(TransHandle {
            shared: Arc::clone(&self.shared),
            transid,
            overlay: Overlay::new(),
            finished: false,
        })
    }

    /// Commit the running transaction and return its generation.
    ///
    /// Must not be called while the calling thread holds a handle.
    pub fn commit(&self) -> Result<Generation> {
        let mut state = self.shared.state.lock();
        while state.committing {
            self.shared.cond.wait(&mut state);
        }
        if let Some(err) = TxnShared::aborted_error(&state) {
            return Err(err);
        }
        state.committing = true;
        while state.writers > 0 {
            self.shared.cond.wait(&mut state);
        }
        let transid = state.generation + 1;
        if let Err(err) = self.shared.store.persist(transid) {
            error!(transid, error = %err, "commit failed, aborting");
            state.aborted = Some((transid, format!("commit failed: {err}")));
            state.committing = false;
            drop(state);
            self.shared.cond.notify_all();
            return Err(CfsError::TransactionAborted {
                transid,
                reason: err.to_string(),
            });
        }
        state.generation = transid;
        state.committing = false;
        drop(state);
        self.shared.cond.notify_all();
        info!(generation = transid, "transaction committed");

        let hooks: Vec<CommitHook> = self.shared.hooks.lock().clone();
        for hook in hooks {
            hook(Generation(transid));
        }
        Ok(Generation(transid))
    }
}

/// A writer's view of the running transaction.
pub struct TransHandle {
    shared: Arc<TxnShared>,
    transid: u64,
    overlay: Overlay,
    finished: bool,
}

impl std::fmt::Debug for TransHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransHandle")
            .field("transid", &self.transid)
            .field("staged", &self.overlay.len())
            .finish()
    }
}

impl TransHandle {
    #[must_use]
    pub fn transid(&self) -> Generation {
        Generation(self.transid)
    }

    /// Number of staged updates.
    #[must_use]
    pub fn staged(&self) -> usize {
        self.overlay.len()
    }

    /// Insert a new item; `Exists` if the key is present.
    pub fn insert(&mut self, tree: TreeId, key: Key, data: Vec<u8>) -> Result<()> {
        self.shared.store.faults().check_write(tree)?;
        if self.get_item(tree, &key).is_some() {
            return Err(CfsError::Exists);
        }
        self.overlay.insert((tree, key), Some(data));
        Ok(())
    }

    /// Insert or overwrite an item.
    pub fn update(&mut self, tree: TreeId, key: Key, data: Vec<u8>) -> Result<()> {
        self.shared.store.faults().check_write(tree)?;
        self.overlay.insert((tree, key), Some(data));
        Ok(())
    }

    /// Delete an item; `NotFound` if absent.
    pub fn delete(&mut self, tree: TreeId, key: Key) -> Result<()> {
        self.shared.store.faults().check_write(tree)?;
        if self.get_item(tree, &key).is_none() {
            return Err(CfsError::NotFound(format!("{tree:?} {key:?}")));
        }
        self.overlay.insert((tree, key), None);
        Ok(())
    }

    /// Apply every staged update atomically and leave the transaction.
    pub fn end(mut self) -> Result<()> {
        self.finished = true;
        let overlay = std::mem::take(&mut self.overlay);
        let res = {
            let state = self.shared.state.lock();
            TxnShared::aborted_error(&state).map_or(Ok(()), Err)
        };
        if res.is_ok() {
            let n = overlay.len();
            self.shared.store.apply(overlay);
            debug!(transid = self.transid, items = n, "transaction handle ended");
        }
        self.shared.release_writer();
        res
    }

    /// Discard staged updates and abort the transaction. The filesystem is
    /// read-only afterwards. Returns the error to propagate.
    pub fn abort(mut self, reason: &str) -> CfsError {
        self.finished = true;
        self.overlay.clear();
        let mut state = self.shared.state.lock();
        if state.aborted.is_none() {
            state.aborted = Some((self.transid, reason.to_owned()));
        }
        drop(state);
        error!(transid = self.transid, reason, "transaction aborted");
        self.shared.release_writer();
        CfsError::TransactionAborted {
            transid: self.transid,
            reason: reason.to_owned(),
        }
    }
}

impl Drop for TransHandle {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                transid = self.transid,
                staged = self.overlay.len(),
                "transaction handle dropped without end, discarding"
            );
            self.shared.release_writer();
        }
    }
}

impl ItemReader for TransHandle {
    fn get_item(&self, tree: TreeId, key: &Key) -> Option<Vec<u8>> {
        match self.overlay.get(&(tree, *key)) {
            Some(staged) => staged.clone(),
            None => self.shared.store.get_item(tree, key),
        }
    }

    fn range_items(&self, tree: TreeId, lo: &Key, hi: &Key) -> Vec<(Key, Vec<u8>)> {
        if lo > hi {
            return Vec::new();
        }
        let mut merged: std::collections::BTreeMap<Key, Vec<u8>> = self
            .shared
            .store
            .range_items(tree, lo, hi)
            .into_iter()
            .collect();
        for ((_, key), staged) in self.overlay.range((tree, *lo)..=(tree, *hi)) {
            match staged {
                Some(data) => {
                    merged.insert(*key, data.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    fn prev_item(&self, tree: TreeId, key: &Key) -> Option<(Key, Vec<u8>)> {
        let committed = self
            .shared
            .store
            .prev_matching(tree, key, |k| self.overlay.contains_key(&(tree, *k)));
        let staged = self
            .overlay
            .range((tree, Key::MIN)..=(tree, *key))
            .rev()
            .find_map(|((_, k), v)| v.as_ref().map(|d| (*k, d.clone())));
        match (committed, staged) {
            (Some(c), Some(s)) => Some(if s.0 >= c.0 { s } else { c }),
            (c, s) => c.or(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TreeKind;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn key(o: u64) -> Key {
        Key::new(257, crate::item_type::EXTENT_DATA, o)
    }

    fn fs() -> TreeId {
        TreeId::Fs(cfs_types::RootId::FS_TREE)
    }

    #[test]
    fn staged_writes_invisible_until_end() {
        let mgr = TransactionManager::new(Arc::new(MetadataStore::new()));
        let mut h = mgr.start().expect("start");
        h.insert(fs(), key(0), vec![1]).expect("insert");
        assert_eq!(h.get_item(fs(), &key(0)), Some(vec![1]));
        assert!(mgr.store().get_item(fs(), &key(0)).is_none());
        h.end().expect("end");
        assert_eq!(mgr.store().get_item(fs(), &key(0)), Some(vec![1]));
    }

    #[test]
    fn insert_conflicts_and_delete_missing() {
        let mgr = TransactionManager::new(Arc::new(MetadataStore::new()));
        let mut h = mgr.start().expect("start");
        h.insert(fs(), key(0), vec![1]).expect("insert");
        assert!(matches!(h.insert(fs(), key(0), vec![2]), Err(CfsError::Exists)));
        assert!(matches!(h.delete(fs(), key(8)), Err(CfsError::NotFound(_))));
        h.delete(fs(), key(0)).expect("delete staged");
        assert!(h.get_item(fs(), &key(0)).is_none());
        h.end().expect("end");
    }

    #[test]
    fn overlay_merges_with_committed_items() {
        let mgr = TransactionManager::new(Arc::new(MetadataStore::new()));
        let mut h = mgr.start().expect("start");
        for o in [0, 4096, 8192] {
            h.insert(fs(), key(o), vec![0]).expect("insert");
        }
        h.end().expect("end");

        let mut h = mgr.start().expect("start");
        h.delete(fs(), key(4096)).expect("delete");
        h.insert(fs(), key(6000), vec![9]).expect("insert");
        let offs: Vec<u64> = h
            .range_items(fs(), &key(0), &key(u64::MAX))
            .iter()
            .map(|(k, _)| k.offset)
            .collect();
        assert_eq!(offs, vec![0, 6000, 8192]);
        assert_eq!(h.prev_item(fs(), &key(5000)).map(|(k, _)| k.offset), Some(0));
        assert_eq!(h.prev_item(fs(), &key(7000)).map(|(k, _)| k.offset), Some(6000));
        assert_eq!(h.prev_item(fs(), &key(9000)).map(|(k, _)| k.offset), Some(8192));
        h.end().expect("end");
    }

    #[test]
    fn abort_discards_and_blocks_new_handles() {
        let mgr = TransactionManager::new(Arc::new(MetadataStore::new()));
        let mut h = mgr.start().expect("start");
        h.insert(fs(), key(0), vec![1]).expect("insert");
        let err = h.abort("csum insert failed");
        assert!(matches!(err, CfsError::TransactionAborted { .. }));
        assert!(mgr.store().get_item(fs(), &key(0)).is_none());
        assert!(mgr.is_aborted());
        assert!(mgr.start().is_err());
        assert!(mgr.commit().is_err());
        assert_eq!(err.to_errno(), CfsError::ReadOnly.to_errno());
    }

    #[test]
    fn commit_advances_generation_and_runs_hooks() {
        let mgr = TransactionManager::new(Arc::new(MetadataStore::new()));
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        mgr.register_commit_hook(Arc::new(move |g| s.store(g.0, Ordering::SeqCst)));
        let h = mgr.start().expect("start");
        assert_eq!(h.transid(), Generation(1));
        h.end().expect("end");
        assert_eq!(mgr.commit().expect("commit"), Generation(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.running_transid(), Generation(2));
        assert_eq!(mgr.store().durable_generation(), 1);
    }

    #[test]
    fn injected_write_failure_surfaces_from_handle() {
        let store = Arc::new(MetadataStore::new());
        store.faults().fail_write(Some(TreeKind::Csum), 0);
        let mgr = TransactionManager::new(Arc::clone(&store));
        let mut h = mgr.start().expect("start");
        h.insert(fs(), key(0), vec![1]).expect("fs insert");
        assert!(h.insert(TreeId::Csum, key(0), vec![1]).is_err());
        let _ = h.abort("injected");
        assert!(store.get_item(fs(), &key(0)).is_none());
    }

    #[test]
    fn dropped_handle_releases_commit() {
        let mgr = TransactionManager::new(Arc::new(MetadataStore::new()));
        {
            let mut h = mgr.start().expect("start");
            h.update(fs(), key(0), vec![1]).expect("update");
        }
        assert_eq!(mgr.commit().expect("commit"), Generation(1));
        assert!(mgr.store().get_item(fs(), &key(0)).is_none());
    }

    #[test]
    fn commit_waits_for_open_handles() {
        let mgr = TransactionManager::new(Arc::new(MetadataStore::new()));
        let mut h = mgr.start().expect("start");
        let m2 = mgr.clone();
        let committer = std::thread::spawn(move || m2.commit());
        std::thread::sleep(std::time::Duration::from_millis(20));
        h.insert(fs(), key(0), vec![7]).expect("insert");
        h.end().expect("end");
        let generation = committer.join().expect("join").expect("commit");
        assert_eq!(generation, Generation(1));
        assert_eq!(mgr.store().image().item_count(fs()), 1);
    }
}
