//! Space accounting counters.
//!
//! One [`SpaceInfo`] exists for data and one for metadata. All counters are
//! atomics so reservations taken by foreground writers never contend with
//! the allocator lock.
//!
//! | counter | meaning |
//! |---------|---------|
//! | `bytes_may_use` | promised to writers, not yet allocated |
//! | `bytes_reserved` | allocated on the device, metadata not yet committed |
//! | `bytes_used` | referenced by committed metadata |

use cfs_error::{CfsError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Which pool a [`SpaceInfo`] accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    Data,
    Metadata,
}

/// Point-in-time copy of the counters, for reports and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceSnapshot {
    pub kind: SpaceKind,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub bytes_reserved: u64,
    pub bytes_may_use: u64,
}

impl SpaceSnapshot {
    /// Bytes neither used, reserved nor promised.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.total_bytes
            .saturating_sub(self.bytes_used)
            .saturating_sub(self.bytes_reserved)
            .saturating_sub(self.bytes_may_use)
    }
}

#[derive(Debug)]
pub struct SpaceInfo {
    kind: SpaceKind,
    total_bytes: AtomicU64,
    bytes_used: AtomicU64,
    bytes_reserved: AtomicU64,
    bytes_may_use: AtomicU64,
}

impl SpaceInfo {
    #[must_use]
    pub fn new(kind: SpaceKind, total_bytes: u64) -> Self {
        Self {
            kind,
            total_bytes: AtomicU64::new(total_bytes),
            bytes_used: AtomicU64::new(0),
            bytes_reserved: AtomicU64::new(0),
            bytes_may_use: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bytes_reserved(&self) -> u64 {
        self.bytes_reserved.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn bytes_may_use(&self) -> u64 {
        self.bytes_may_use.load(Ordering::Acquire)
    }

    /// Promise `bytes` to a writer, failing with `NoSpace` when the pool
    /// cannot cover every outstanding promise.
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut current = self.bytes_may_use.load(Ordering::Acquire);
        loop {
            let committed = self.bytes_used().saturating_add(self.bytes_reserved());
            let wanted = committed.saturating_add(current).saturating_add(bytes);
            if wanted > self.total_bytes() {
                trace!(kind = ?self.kind, bytes, may_use = current, "space reservation refused");
                return Err(CfsError::NoSpace);
            }
            match self.bytes_may_use.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Promise `bytes` without checking capacity (overcommit).
    ///
    /// Used where failing is not an option, e.g. re-dirtying a range during
    /// error cleanup.
    pub fn reserve_force(&self, bytes: u64) {
        self.bytes_may_use.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Return a promise.
    pub fn release(&self, bytes: u64) {
        saturating_sub(&self.bytes_may_use, bytes);
    }

    pub fn add_reserved(&self, bytes: u64) {
        self.bytes_reserved.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub_reserved(&self, bytes: u64) {
        saturating_sub(&self.bytes_reserved, bytes);
    }

    pub fn add_used(&self, bytes: u64) {
        self.bytes_used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub_used(&self, bytes: u64) {
        saturating_sub(&self.bytes_used, bytes);
    }

    #[must_use]
    pub fn snapshot(&self) -> SpaceSnapshot {
        SpaceSnapshot {
            kind: self.kind,
            total_bytes: self.total_bytes(),
            bytes_used: self.bytes_used(),
            bytes_reserved: self.bytes_reserved(),
            bytes_may_use: self.bytes_may_use(),
        }
    }
}

fn saturating_sub(counter: &AtomicU64, bytes: u64) {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        let next = current.saturating_sub(bytes);
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
