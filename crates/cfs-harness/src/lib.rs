#![forbid(unsafe_code)]
//! End-to-end scenario harness for CowFS.
//!
//! A [`Rig`] mounts a filesystem on one in-memory device behind a
//! [`FaultPlan`] and a [`DeferredEngine`], so a scenario can inspect ordered
//! extents while their IO is still parked, inject write failures, and then
//! let the IO complete. Scenarios produce a serializable
//! [`ScenarioReport`] with one [`StepEntry`] per step.

pub mod scenarios;

use anyhow::{Context, Result};
use cfs::{Filesystem, InodeNumber, MetadataImage, MountOptions, RootId};
use cfs_block::{BioEngine, ByteDevice, DeferredEngine, FaultPlan, FaultyDevice, MemByteDevice, MirrorSet};
use cfs_btree::fs_tree::file_extents_in_range;
use cfs_btree::items::FileExtentItem;
use cfs_inode::Inode;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size of the scenario device.
pub const DEVICE_LEN: u64 = 64 * 1024 * 1024;

// ── Reports ─────────────────────────────────────────────────────────────────

/// One step of a scenario and what it observed.
#[derive(Debug, Clone, Serialize)]
pub struct StepEntry {
    pub step: String,
    pub output: serde_json::Value,
    pub duration_us: u64,
}

/// Outcome of a single scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub description: String,
    pub passed: bool,
    pub failures: Vec<String>,
    pub steps: Vec<StepEntry>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(scenario: &str, description: &str) -> Self {
        Self {
            scenario: scenario.to_owned(),
            description: description.to_owned(),
            passed: true,
            failures: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Record a step that started at `started`.
    pub fn step(&mut self, step: &str, started: Instant, output: serde_json::Value) {
        let duration: Duration = started.elapsed();
        self.steps.push(StepEntry {
            step: step.to_owned(),
            output,
            duration_us: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
        });
    }

    /// Record an expectation; a false `ok` fails the scenario.
    pub fn expect(&mut self, ok: bool, what: impl Into<String>) {
        if !ok {
            self.passed = false;
            self.failures.push(what.into());
        }
    }
}

/// Summary over several scenarios.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub passed: usize,
    pub failed: usize,
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn from_reports(scenarios: Vec<ScenarioReport>) -> Self {
        let passed = scenarios.iter().filter(|r| r.passed).count();
        Self {
            passed,
            failed: scenarios.len() - passed,
            scenarios,
        }
    }
}

// ── Rig ─────────────────────────────────────────────────────────────────────

/// A mounted filesystem whose writes park until [`Rig::complete_io`].
pub struct Rig {
    pub fs: Filesystem,
    pub engine: Arc<DeferredEngine>,
    pub plan: Arc<FaultPlan>,
    device: Arc<dyn ByteDevice>,
}

impl std::fmt::Debug for Rig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rig")
            .field("fs", &self.fs)
            .field("pending", &self.engine.pending_count())
            .finish_non_exhaustive()
    }
}

impl Rig {
    /// Mount with defaults overridden by a `-o` style option string.
    pub fn new(opts: &str) -> Result<Self> {
        let mut options = MountOptions {
            block_group_size: 16 * 1024 * 1024,
            ..MountOptions::default()
        };
        options
            .apply_option_string(opts)
            .with_context(|| format!("invalid options {opts:?}"))?;
        Self::with_options(options)
    }

    pub fn with_options(options: MountOptions) -> Result<Self> {
        let plan = FaultPlan::new();
        let len = usize::try_from(DEVICE_LEN).context("device length")?;
        let device: Arc<dyn ByteDevice> = Arc::new(FaultyDevice::new(
            MemByteDevice::new(len),
            Arc::clone(&plan),
        ));
        Self::mount(device, plan, options, None)
    }

    fn mount(
        device: Arc<dyn ByteDevice>,
        plan: Arc<FaultPlan>,
        options: MountOptions,
        image: Option<MetadataImage>,
    ) -> Result<Self> {
        let engine = Arc::new(DeferredEngine::new(MirrorSet::new(vec![Arc::clone(&device)])?));
        let fs = Filesystem::mount_with_engine(
            Arc::clone(&engine) as Arc<dyn BioEngine>,
            DEVICE_LEN,
            options,
            image,
        )
        .context("mount failed")?;
        Ok(Self {
            fs,
            engine,
            plan,
            device,
        })
    }

    /// Lose power, then mount the same device from the durable metadata.
    pub fn crash_and_remount(self) -> Result<Self> {
        let options = self.fs.options().clone();
        let image = self.fs.crash();
        self.plan.clear();
        Self::mount(self.device, self.plan, options, Some(image))
    }

    #[must_use]
    pub fn sectorsize(&self) -> u64 {
        self.fs.fs_info().sectorsize().bytes()
    }

    /// Create an empty regular file in the default tree.
    pub fn new_file(&self) -> Result<Arc<Inode>> {
        let ino = self.fs.create_file(RootId::FS_TREE)?;
        Ok(self.fs.inode(RootId::FS_TREE, ino)?)
    }

    /// Perform every parked write and wait for the completions.
    pub fn complete_io(&self, inode: &Inode) -> usize {
        let bios = self.engine.flush_pending();
        inode.wait_ordered(0, u64::MAX);
        bios
    }

    /// Flush, complete the IO and commit.
    pub fn settle(&self, inode: &Arc<Inode>) -> Result<()> {
        inode.flush()?;
        self.complete_io(inode);
        self.fs.commit()?;
        Ok(())
    }

    /// Committed file extent items of `inode`.
    pub fn items(&self, inode: &Inode) -> Result<Vec<(u64, FileExtentItem)>> {
        Ok(file_extents_in_range(
            &**self.fs.store(),
            inode.root_id(),
            inode.ino(),
            0,
            u64::MAX,
        )?)
    }

    /// Forget cached pages and mappings so reads go to the device.
    pub fn drop_caches(inode: &Inode) {
        inode.page_cache().drop_clean();
        inode.extent_maps().drop_range(0, u64::MAX, true);
    }

    pub fn reopen(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        Ok(self.fs.inode(RootId::FS_TREE, ino)?)
    }
}

/// Repeating four-byte pattern.
#[must_use]
pub fn repeating(len: usize) -> Vec<u8> {
    [0xde_u8, 0xad, 0xbe, 0xef].iter().copied().cycle().take(len).collect()
}

/// Deterministic bytes that do not compress.
#[must_use]
pub fn noise(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state.to_le_bytes()[0]
        })
        .collect()
}

/// A counting pattern seeded by `seed`.
#[must_use]
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i.to_le_bytes()[0]).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_fails_on_first_unmet_expectation() {
        let mut report = ScenarioReport::new("x", "demo");
        report.expect(true, "fine");
        assert!(report.passed);
        report.expect(false, "broken");
        report.expect(false, "also broken");
        assert!(!report.passed);
        assert_eq!(report.failures, vec!["broken", "also broken"]);
    }

    #[test]
    fn suite_counts_outcomes() {
        let mut bad = ScenarioReport::new("b", "");
        bad.expect(false, "no");
        let suite = SuiteReport::from_reports(vec![ScenarioReport::new("a", ""), bad]);
        assert_eq!((suite.passed, suite.failed), (1, 1));
    }

    #[test]
    fn generators_are_deterministic() {
        assert_eq!(repeating(6), vec![0xde, 0xad, 0xbe, 0xef, 0xde, 0xad]);
        assert_eq!(noise(64, 7), noise(64, 7));
        assert_ne!(pattern(16, 1), pattern(16, 2));
    }
}
