//! Corruption and repair records kept for postmortem analysis.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

/// A data sector whose every copy failed checksum verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionRecord {
    pub root: u64,
    pub ino: u64,
    pub file_offset: u64,
    /// Physical address of the sector.
    pub logical: u64,
    /// Last mirror tried.
    pub mirror: u32,
    pub expected: u32,
    pub actual: u32,
}

/// Filesystem-wide diagnostics sink.
#[derive(Debug, Default)]
pub struct DiagnosticsLog {
    corruptions: Mutex<Vec<CorruptionRecord>>,
    repaired_sectors: AtomicU64,
}

impl DiagnosticsLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_corruption(&self, record: CorruptionRecord) {
        let json = serde_json::to_string(&record).unwrap_or_default();
        error!(
            target: "cfs::read",
            ino = record.ino,
            file_offset = record.file_offset,
            logical = record.logical,
            record = %json,
            "data corruption, no good copy"
        );
        self.corruptions.lock().push(record);
    }

    pub fn record_repair(&self, logical: u64, bad_mirror: u32, good_mirror: u32) {
        self.repaired_sectors.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "cfs::read",
            logical,
            bad_mirror,
            good_mirror,
            "sector repaired from mirror"
        );
    }

    #[must_use]
    pub fn corruptions(&self) -> Vec<CorruptionRecord> {
        self.corruptions.lock().clone()
    }

    #[must_use]
    pub fn repaired_sectors(&self) -> u64 {
        self.repaired_sectors.load(Ordering::Relaxed)
    }

    /// Every corruption record as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.corruptions.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_json() {
        let log = DiagnosticsLog::new();
        log.record_corruption(CorruptionRecord {
            root: 5,
            ino: 257,
            file_offset: 8192,
            logical: 1 << 20,
            mirror: 2,
            expected: 0xdead_beef,
            actual: 0x1234_5678,
        });
        log.record_repair(1 << 20, 1, 2);
        assert_eq!(log.repaired_sectors(), 1);
        let json = log.to_json().expect("json");
        let back: Vec<CorruptionRecord> = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, log.corruptions());
        assert_eq!(back[0].ino, 257);
    }
}
