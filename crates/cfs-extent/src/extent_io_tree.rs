//! Range-tagged state tree.
//!
//! Stores non-overlapping `[start, end)` ranges, each carrying a set of
//! [`ExtentBits`]. Setting or clearing bits on a sub-range splits the
//! affected states at the boundaries; adjacent states with identical bits
//! are merged again afterwards. Every transition is reported to an
//! [`ExtentIoHooks`] implementation while the tree lock is held, which is
//! how delalloc accounting stays exact across splits and merges.
//!
//! `LOCKED` doubles as a per-file range lock: [`ExtentIoTree::lock_range`]
//! blocks on a condition variable until no part of the range is locked.

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExtentBits: u32 {
        const LOCKED          = 1 << 0;
        const DIRTY           = 1 << 1;
        const UPTODATE        = 1 << 2;
        const DELALLOC        = 1 << 3;
        const DELALLOC_NEW    = 1 << 4;
        const DEFRAG          = 1 << 5;
        /// Written without a data space reservation (No-COW).
        const NORESERVE       = 1 << 6;
        const NODATASUM       = 1 << 7;
        const IOERR           = 1 << 8;
        /// Clear-only: release the data reservation for cleared delalloc.
        const CLEAR_DATA_RESV = 1 << 16;
        /// Clear-only: release metadata reserved for cleared delalloc.
        const CLEAR_META_RESV = 1 << 17;
        /// Clear-only: the caller owns the outstanding-extent accounting.
        const DO_ACCOUNTING   = 1 << 18;
    }
}

impl ExtentBits {
    /// Bits that are actually stored on states.
    pub const STORED: Self = Self::from_bits_truncate(0xffff);

    /// Bits that modify how a clear is accounted.
    pub const MODIFIERS: Self = Self::CLEAR_DATA_RESV
        .union(Self::CLEAR_META_RESV)
        .union(Self::DO_ACCOUNTING);
}

/// Half-open byte range of one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateRange {
    pub start: u64,
    pub end: u64,
}

impl StateRange {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Transition callbacks, invoked with the tree lock held. Implementations
/// must not call back into the tree.
pub trait ExtentIoHooks: Send + Sync {
    /// `bits` are being set on `range`, whose stored bits were `old`.
    fn on_set(&self, _range: StateRange, _old: ExtentBits, _bits: ExtentBits) {}

    /// `bits` (stored bits plus modifiers) are being cleared from `range`.
    fn on_clear(&self, _range: StateRange, _old: ExtentBits, _bits: ExtentBits) {}

    /// `orig` with `bits` is being split at `at`.
    fn on_split(&self, _orig: StateRange, _bits: ExtentBits, _at: u64) {}

    /// `left` and `right`, both carrying `bits`, are being merged.
    fn on_merge(&self, _left: StateRange, _right: StateRange, _bits: ExtentBits) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoHooks;

impl ExtentIoHooks for NoHooks {}

type States = BTreeMap<u64, (u64, ExtentBits)>;

pub struct ExtentIoTree {
    states: Mutex<States>,
    unlocked: Condvar,
    hooks: Arc<dyn ExtentIoHooks>,
}

impl std::fmt::Debug for ExtentIoTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentIoTree")
            .field("states", &self.states.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for ExtentIoTree {
    fn default() -> Self {
        Self::new(Arc::new(NoHooks))
    }
}

impl ExtentIoTree {
    #[must_use]
    pub fn new(hooks: Arc<dyn ExtentIoHooks>) -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            unlocked: Condvar::new(),
            hooks,
        }
    }

    /// Split the state containing `pos` (strictly inside) in two.
    fn split_at(&self, states: &mut States, pos: u64) {
        let Some((&start, &(end, bits))) = states.range(..pos).next_back() else {
            return;
        };
        if end <= pos {
            return;
        }
        self.hooks
            .on_split(StateRange { start, end }, bits, pos);
        states.insert(start, (pos, bits));
        states.insert(pos, (end, bits));
    }

    /// Merge states in `[start, end]` with identical neighbours.
    fn merge_around(&self, states: &mut States, start: u64, end: u64) {
        let first = states
            .range(..start)
            .next_back()
            .map_or(start, |(&s, _)| s);
        let keys: Vec<u64> = states.range(first..=end).map(|(&s, _)| s).collect();
        let mut cursor: Option<u64> = None;
        for key in keys {
            let Some(&(kend, kbits)) = states.get(&key) else {
                continue;
            };
            if let Some(prev) = cursor {
                if let Some(&(pend, pbits)) = states.get(&prev) {
                    if pend == key && pbits == kbits && !pbits.contains(ExtentBits::LOCKED) {
                        self.hooks.on_merge(
                            StateRange {
                                start: prev,
                                end: pend,
                            },
                            StateRange {
                                start: key,
                                end: kend,
                            },
                            pbits,
                        );
                        states.remove(&key);
                        states.insert(prev, (kend, pbits));
                        continue;
                    }
                }
            }
            cursor = Some(key);
        }
    }

    fn set_locked(&self, states: &mut States, start: u64, end: u64, bits: ExtentBits) -> u64 {
        let bits = bits & ExtentBits::STORED;
        if bits.is_empty() || end <= start {
            return 0;
        }
        self.split_at(states, start);
        self.split_at(states, end);
        let mut newly = 0;
        let mut pos = start;
        let existing: Vec<(u64, u64, ExtentBits)> = states
            .range(start..end)
            .map(|(&s, &(e, b))| (s, e, b))
            .collect();
        let mut fill = Vec::new();
        for (s, e, old) in existing {
            if pos < s {
                fill.push((pos, s));
            }
            let range = StateRange { start: s, end: e };
            self.hooks.on_set(range, old, bits);
            if !old.contains(bits) {
                newly += range.len();
            }
            states.insert(s, (e, old | bits));
            pos = e;
        }
        if pos < end {
            fill.push((pos, end));
        }
        for (s, e) in fill {
            let range = StateRange { start: s, end: e };
            self.hooks.on_set(range, ExtentBits::empty(), bits);
            newly += range.len();
            states.insert(s, (e, bits));
        }
        self.merge_around(states, start, end);
        newly
    }

    fn clear_locked(&self, states: &mut States, start: u64, end: u64, bits: ExtentBits) -> u64 {
        let stored = bits & ExtentBits::STORED;
        if stored.is_empty() || end <= start {
            return 0;
        }
        self.split_at(states, start);
        self.split_at(states, end);
        let hits: Vec<(u64, u64, ExtentBits)> = states
            .range(start..end)
            .filter(|(_, (_, b))| b.intersects(stored))
            .map(|(&s, &(e, b))| (s, e, b))
            .collect();
        let mut cleared = 0;
        for (s, e, old) in hits {
            let range = StateRange { start: s, end: e };
            self.hooks.on_clear(range, old, bits);
            cleared += range.len();
            let next = old - stored;
            if next.is_empty() {
                states.remove(&s);
            } else {
                states.insert(s, (e, next));
            }
        }
        self.merge_around(states, start, end);
        cleared
    }

    /// Set `bits` on `[start, end)`. Returns the number of bytes that did not
    /// already carry all of `bits`.
    pub fn set_bits(&self, start: u64, end: u64, bits: ExtentBits) -> u64 {
        let mut states = self.states.lock();
        let n = self.set_locked(&mut states, start, end, bits);
        drop(states);
        trace!(start, end, ?bits, newly = n, "set bits");
        n
    }

    /// Clear `bits` from `[start, end)`. Modifier bits are passed through to
    /// the hooks and never stored. Returns the number of bytes that carried
    /// any of the cleared bits.
    pub fn clear_bits(&self, start: u64, end: u64, bits: ExtentBits) -> u64 {
        let mut states = self.states.lock();
        let n = self.clear_locked(&mut states, start, end, bits);
        drop(states);
        if bits.contains(ExtentBits::LOCKED) {
            self.unlocked.notify_all();
        }
        trace!(start, end, ?bits, cleared = n, "clear bits");
        n
    }

    fn any_locked(states: &States, start: u64, end: u64) -> bool {
        let before = states
            .range(..start)
            .next_back()
            .is_some_and(|(_, &(e, b))| e > start && b.contains(ExtentBits::LOCKED));
        before
            || states
                .range(start..end)
                .any(|(_, (_, b))| b.contains(ExtentBits::LOCKED))
    }

    /// Block until no byte of `[start, end)` is locked, then lock it all.
    pub fn lock_range(&self, start: u64, end: u64) {
        let mut states = self.states.lock();
        while Self::any_locked(&states, start, end) {
            self.unlocked.wait(&mut states);
        }
        self.set_locked(&mut states, start, end, ExtentBits::LOCKED);
    }

    /// Lock `[start, end)` if no byte of it is locked.
    pub fn try_lock_range(&self, start: u64, end: u64) -> bool {
        let mut states = self.states.lock();
        if Self::any_locked(&states, start, end) {
            return false;
        }
        self.set_locked(&mut states, start, end, ExtentBits::LOCKED);
        true
    }

    pub fn unlock_range(&self, start: u64, end: u64) {
        self.clear_bits(start, end, ExtentBits::LOCKED);
    }

    /// Clear `clear` then set `set` on `[start, end)` atomically.
    pub fn clear_and_set(&self, start: u64, end: u64, clear: ExtentBits, set: ExtentBits) {
        let mut states = self.states.lock();
        self.clear_locked(&mut states, start, end, clear);
        self.set_locked(&mut states, start, end, set);
        drop(states);
        if clear.contains(ExtentBits::LOCKED) && !set.contains(ExtentBits::LOCKED) {
            self.unlocked.notify_all();
        }
    }

    /// With `filled`, whether every byte of the range carries all of
    /// `bits`; otherwise whether any byte carries any of them.
    #[must_use]
    pub fn test_range(&self, start: u64, end: u64, bits: ExtentBits, filled: bool) -> bool {
        if end <= start {
            return false;
        }
        let states = self.states.lock();
        let mut pos = start;
        let first = states
            .range(..start)
            .next_back()
            .filter(|(_, (e, _))| *e > start)
            .map(|(&s, &(e, b))| (s, e, b));
        let iter = first
            .into_iter()
            .chain(states.range(start..end).map(|(&s, &(e, b))| (s, e, b)));
        for (s, e, b) in iter {
            if filled {
                if s > pos || !b.contains(bits) {
                    return false;
                }
                pos = e;
                if pos >= end {
                    return true;
                }
            } else if b.intersects(bits) {
                return true;
            }
        }
        false
    }

    /// First maximal run at or after `from` whose states all carry any of
    /// `bits`. The returned range may start before `from` if a state
    /// straddles it.
    #[must_use]
    pub fn find_first(&self, from: u64, bits: ExtentBits) -> Option<StateRange> {
        let states = self.states.lock();
        let first = states
            .range(..from)
            .next_back()
            .filter(|(_, (e, b))| *e > from && b.intersects(bits))
            .map(|(&s, &(e, _))| (s, e))
            .or_else(|| {
                states
                    .range(from..)
                    .find(|(_, (_, b))| b.intersects(bits))
                    .map(|(&s, &(e, _))| (s, e))
            })?;
        let (start, mut end) = first;
        for (&s, &(e, b)) in states.range(end..) {
            if s != end || !b.intersects(bits) {
                break;
            }
            end = e;
        }
        Some(StateRange { start, end })
    }

    /// Bytes of `[start, end)` carrying all of `bits`.
    #[must_use]
    pub fn count_bytes(&self, start: u64, end: u64, bits: ExtentBits) -> u64 {
        self.ranges(start, end)
            .into_iter()
            .filter(|(_, b)| b.contains(bits))
            .map(|(r, _)| r.len())
            .sum()
    }

    /// States overlapping `[start, end)`, clipped to it.
    #[must_use]
    pub fn ranges(&self, start: u64, end: u64) -> Vec<(StateRange, ExtentBits)> {
        let states = self.states.lock();
        let mut out = Vec::new();
        if end <= start {
            return out;
        }
        if let Some((&s, &(e, b))) = states.range(..start).next_back() {
            if e > start {
                out.push((
                    StateRange {
                        start: s.max(start),
                        end: e.min(end),
                    },
                    b,
                ));
            }
        }
        for (&s, &(e, b)) in states.range(start..end) {
            out.push((
                StateRange {
                    start: s,
                    end: e.min(end),
                },
                b,
            ));
        }
        out
    }

    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.lock().len()
    }
}
