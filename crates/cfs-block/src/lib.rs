#![forbid(unsafe_code)]
//! Byte devices, redundant copies and fault injection.
//!
//! The extent engine never talks to a single device directly: data lives on
//! a [`MirrorSet`] so the read path can fall back to an alternate copy when a
//! checksum does not match. Submission with completion callbacks lives in
//! [`io_engine`].

pub mod io_engine;

pub use io_engine::{
    BioEngine, DeferredEngine, EndIo, InlineEngine, IoEngineStats, ThreadedEngine, WriteBio,
};

use cfs_error::{CfsError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, dev_len: u64, what: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| CfsError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| CfsError::Format(format!("{what} range overflows u64")))?;
    if end > dev_len {
        return Err(CfsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CfsError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset overflow".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset overflow".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Injected failure rules shared between a test and a [`FaultyDevice`].
#[derive(Debug, Default)]
pub struct FaultPlan {
    inner: Mutex<FaultPlanInner>,
}

#[derive(Debug, Default)]
struct FaultPlanInner {
    /// Writes overlapping any of these ranges fail.
    failing_writes: Vec<Range<u64>>,
    /// Fail this many upcoming writes regardless of offset.
    fail_next_writes: u32,
    /// Reads overlapping any of these ranges fail.
    failing_reads: Vec<Range<u64>>,
    writes_failed: u64,
}

impl FaultPlan {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every write that overlaps `range`.
    pub fn fail_writes_in(&self, range: Range<u64>) {
        self.inner.lock().failing_writes.push(range);
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.lock().fail_next_writes = count;
    }

    /// Fail every read that overlaps `range`.
    pub fn fail_reads_in(&self, range: Range<u64>) {
        self.inner.lock().failing_reads.push(range);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.failing_writes.clear();
        inner.failing_reads.clear();
        inner.fail_next_writes = 0;
    }

    #[must_use]
    pub fn writes_failed(&self) -> u64 {
        self.inner.lock().writes_failed
    }

    fn should_fail_write(&self, offset: u64, len: u64) -> bool {
        let mut inner = self.inner.lock();
        let end = offset.saturating_add(len);
        let hit = inner.fail_next_writes > 0
            || inner
                .failing_writes
                .iter()
                .any(|r| r.start < end && offset < r.end);
        if hit {
            inner.fail_next_writes = inner.fail_next_writes.saturating_sub(1);
            inner.writes_failed += 1;
        }
        hit
    }

    fn should_fail_read(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        self.inner
            .lock()
            .failing_reads
            .iter()
            .any(|r| r.start < end && offset < r.end)
    }
}

/// Byte device wrapper that fails IO according to a [`FaultPlan`].
pub struct FaultyDevice<D: ByteDevice> {
    inner: D,
    plan: Arc<FaultPlan>,
}

impl<D: ByteDevice> FaultyDevice<D> {
    #[must_use]
    pub fn new(inner: D, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> ByteDevice for FaultyDevice<D> {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.plan.should_fail_read(offset, buf.len() as u64) {
            return Err(CfsError::Io(std::io::Error::other(format!(
                "injected read failure at {offset}"
            ))));
        }
        self.inner.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.plan.should_fail_write(offset, buf.len() as u64) {
            return Err(CfsError::Io(std::io::Error::other(format!(
                "injected write failure at {offset}"
            ))));
        }
        self.inner.write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// A set of identical copies of the data address space.
///
/// Mirror numbers are 1-based; mirror 0 means "any copy" and resolves to
/// the first one.
#[derive(Clone)]
pub struct MirrorSet {
    mirrors: Vec<Arc<dyn ByteDevice>>,
    len: u64,
}

impl std::fmt::Debug for MirrorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSet")
            .field("copies", &self.mirrors.len())
            .field("len", &self.len)
            .finish()
    }
}

impl MirrorSet {
    /// Build a mirror set; every copy must have the same length.
    pub fn new(mirrors: Vec<Arc<dyn ByteDevice>>) -> Result<Self> {
        let Some(first) = mirrors.first() else {
            return Err(CfsError::InvalidArgument(
                "mirror set needs at least one device".to_owned(),
            ));
        };
        let len = first.len_bytes();
        if let Some(bad) = mirrors.iter().find(|m| m.len_bytes() != len) {
            return Err(CfsError::Format(format!(
                "mirror length mismatch: {} vs {len}",
                bad.len_bytes()
            )));
        }
        Ok(Self { mirrors, len })
    }

    /// Number of redundant copies available for any range.
    #[must_use]
    pub fn num_copies(&self) -> u32 {
        u32::try_from(self.mirrors.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    fn mirror(&self, mirror: u32) -> Result<&Arc<dyn ByteDevice>> {
        let idx = mirror.saturating_sub(1) as usize;
        self.mirrors.get(idx).ok_or_else(|| {
            CfsError::InvalidArgument(format!(
                "mirror {mirror} out of range ({} copies)",
                self.mirrors.len()
            ))
        })
    }

    /// Read `len` bytes at `physical` from one copy.
    pub fn read(&self, physical: u64, len: usize, mirror: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.mirror(mirror)?.read_exact_at(physical, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` to every copy. The first failure is returned after all
    /// copies were attempted.
    pub fn write_all(&self, physical: u64, data: &[u8]) -> Result<()> {
        let mut first_err = None;
        for dev in &self.mirrors {
            if let Err(err) = dev.write_all_at(physical, data) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Overwrite a single copy (used by read repair).
    pub fn write_mirror(&self, physical: u64, data: &[u8], mirror: u32) -> Result<()> {
        self.mirror(mirror)?.write_all_at(physical, data)
    }

    pub fn sync(&self) -> Result<()> {
        for dev in &self.mirrors {
            dev.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemByteDevice::new(8192);
        dev.write_all_at(4096, &[7_u8; 16]).expect("write");
        let mut buf = [0_u8; 16];
        dev.read_exact_at(4096, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 16]);
        assert!(dev.read_exact_at(8190, &mut buf).is_err());
    }

    #[test]
    fn mirror_set_writes_every_copy() {
        let a: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        let b: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        let set = MirrorSet::new(vec![a, b]).expect("set");
        assert_eq!(set.num_copies(), 2);
        set.write_all(0, &[9_u8; 8]).expect("write");
        assert_eq!(set.read(0, 8, 1).expect("m1"), vec![9_u8; 8]);
        assert_eq!(set.read(0, 8, 2).expect("m2"), vec![9_u8; 8]);
        assert_eq!(set.read(0, 8, 0).expect("any"), vec![9_u8; 8]);
        assert!(set.read(0, 8, 3).is_err());
    }

    #[test]
    fn mirror_set_repairs_single_copy() {
        let a: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        let b: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        let set = MirrorSet::new(vec![a, b]).expect("set");
        set.write_all(0, &[1_u8; 4]).expect("write");
        set.write_mirror(0, &[2_u8; 4], 2).expect("repair write");
        assert_eq!(set.read(0, 4, 1).expect("m1"), vec![1_u8; 4]);
        assert_eq!(set.read(0, 4, 2).expect("m2"), vec![2_u8; 4]);
    }

    #[test]
    fn mirror_length_mismatch_rejected() {
        let a: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4096));
        let b: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(8192));
        assert!(MirrorSet::new(vec![a, b]).is_err());
        assert!(MirrorSet::new(Vec::new()).is_err());
    }

    #[test]
    fn fault_plan_fails_overlapping_writes() {
        let plan = FaultPlan::new();
        let dev = FaultyDevice::new(MemByteDevice::new(16384), Arc::clone(&plan));
        plan.fail_writes_in(4096..8192);
        assert!(dev.write_all_at(0, &[1_u8; 4096]).is_ok());
        assert!(dev.write_all_at(6000, &[1_u8; 100]).is_err());
        assert!(dev.write_all_at(8192, &[1_u8; 4096]).is_ok());
        assert_eq!(plan.writes_failed(), 1);

        plan.clear();
        plan.fail_next_writes(1);
        assert!(dev.write_all_at(0, &[1_u8; 8]).is_err());
        assert!(dev.write_all_at(0, &[1_u8; 8]).is_ok());
    }

    #[test]
    fn fault_plan_fails_reads() {
        let plan = FaultPlan::new();
        let dev = FaultyDevice::new(MemByteDevice::new(8192), Arc::clone(&plan));
        plan.fail_reads_in(0..10);
        let mut buf = [0_u8; 4];
        assert!(dev.read_exact_at(0, &mut buf).is_err());
        assert!(dev.read_exact_at(100, &mut buf).is_ok());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dev.img");
        std::fs::write(&path, vec![0_u8; 8192]).expect("create");
        let dev = FileByteDevice::open(&path).expect("open");
        assert!(dev.is_writable());
        assert_eq!(dev.len_bytes(), 8192);
        dev.write_all_at(100, b"cowfs").expect("write");
        let mut buf = [0_u8; 5];
        dev.read_exact_at(100, &mut buf).expect("read");
        assert_eq!(&buf, b"cowfs");
        assert!(dev.write_all_at(8190, b"xyz").is_err());
    }
}
