//! Block IO submission with completion callbacks.
//!
//! The extent engine hands each physical write to a [`BioEngine`] together
//! with an [`EndIo`] callback. Engines decide where the callback runs:
//!
//! - **[`InlineEngine`]**: performs the write and runs the callback on the
//!   submitting thread. Deterministic, used by most unit tests.
//! - **[`ThreadedEngine`]**: a fixed pool of IO threads. Callbacks run on
//!   whichever IO thread finished the write, so several completions for one
//!   ordered extent may race on different threads.
//! - **[`DeferredEngine`]**: parks writes until [`DeferredEngine::flush_pending`]
//!   is called, letting tests hold an ordered extent in flight.
//!
//! Reads are synchronous: the read path needs the bytes before it can
//! verify checksums, and mirror selection is the caller's decision.

use crate::MirrorSet;
use cfs_error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Completion callback for one write bio.
pub type EndIo = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One physical write request.
#[derive(Debug, Clone)]
pub struct WriteBio {
    /// Physical byte offset on the data address space.
    pub physical: u64,
    /// Payload, already laid out for the device (compressed if needed).
    pub data: Vec<u8>,
}

/// IO engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoEngineStats {
    pub reads: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Pluggable write-submission interface.
pub trait BioEngine: Send + Sync {
    /// Queue a write; `end_io` runs exactly once with the outcome.
    fn submit_write(&self, bio: WriteBio, end_io: EndIo);

    /// Read `len` bytes at `physical` from `mirror` (0 = any copy).
    fn read(&self, physical: u64, len: usize, mirror: u32) -> Result<Vec<u8>>;

    /// Overwrite a single copy (read repair).
    fn write_mirror(&self, physical: u64, data: &[u8], mirror: u32) -> Result<()>;

    /// Number of redundant copies of every range.
    fn num_copies(&self) -> u32;

    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    /// Current statistics.
    fn stats(&self) -> IoEngineStats;
}

fn do_write(mirrors: &MirrorSet, stats: &Mutex<IoEngineStats>, bio: &WriteBio) -> Result<()> {
    let res = mirrors.write_all(bio.physical, &bio.data);
    let mut s = stats.lock();
    match &res {
        Ok(()) => {
            s.writes += 1;
            s.bytes_written += bio.data.len() as u64;
        }
        Err(_) => s.write_errors += 1,
    }
    drop(s);
    res
}

fn do_read(
    mirrors: &MirrorSet,
    stats: &Mutex<IoEngineStats>,
    physical: u64,
    len: usize,
    mirror: u32,
) -> Result<Vec<u8>> {
    let buf = mirrors.read(physical, len, mirror)?;
    let mut s = stats.lock();
    s.reads += 1;
    s.bytes_read += len as u64;
    drop(s);
    Ok(buf)
}

// ── Inline engine ──────────────────────────────────────────────────────────

/// Executes writes on the submitting thread.
pub struct InlineEngine {
    mirrors: MirrorSet,
    stats: Mutex<IoEngineStats>,
}

impl InlineEngine {
    #[must_use]
    pub fn new(mirrors: MirrorSet) -> Self {
        Self {
            mirrors,
            stats: Mutex::new(IoEngineStats::default()),
        }
    }
}

impl std::fmt::Debug for InlineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineEngine")
            .field("mirrors", &self.mirrors)
            .finish_non_exhaustive()
    }
}

impl BioEngine for InlineEngine {
    fn submit_write(&self, bio: WriteBio, end_io: EndIo) {
        trace!(physical = bio.physical, len = bio.data.len(), "inline write");
        let res = do_write(&self.mirrors, &self.stats, &bio);
        end_io(res);
    }

    fn read(&self, physical: u64, len: usize, mirror: u32) -> Result<Vec<u8>> {
        do_read(&self.mirrors, &self.stats, physical, len, mirror)
    }

    fn write_mirror(&self, physical: u64, data: &[u8], mirror: u32) -> Result<()> {
        self.mirrors.write_mirror(physical, data, mirror)
    }

    fn num_copies(&self) -> u32 {
        self.mirrors.num_copies()
    }

    fn name(&self) -> &'static str {
        "inline"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }
}

// ── Threaded engine ────────────────────────────────────────────────────────

enum IoJob {
    Write(WriteBio, EndIo),
    Shutdown,
}

struct ThreadedShared {
    mirrors: MirrorSet,
    stats: Mutex<IoEngineStats>,
}

/// Fixed pool of IO threads; completions run on the IO threads.
pub struct ThreadedEngine {
    shared: Arc<ThreadedShared>,
    tx: Mutex<Sender<IoJob>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedEngine {
    /// Spawn `threads` IO workers (at least one).
    pub fn new(mirrors: MirrorSet, threads: usize) -> Result<Self> {
        let shared = Arc::new(ThreadedShared {
            mirrors,
            stats: Mutex::new(IoEngineStats::default()),
        });
        let (tx, rx) = channel::<IoJob>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::new();
        for idx in 0..threads.max(1) {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("cfs-io-{idx}"))
                .spawn(move || io_worker(&shared, &rx))?;
            workers.push(handle);
        }
        debug!(threads = workers.len(), "threaded IO engine started");
        Ok(Self {
            shared,
            tx: Mutex::new(tx),
            workers: Mutex::new(workers),
        })
    }
}

fn io_worker(shared: &ThreadedShared, rx: &Mutex<Receiver<IoJob>>) {
    loop {
        let job = rx.lock().recv();
        match job {
            Ok(IoJob::Write(bio, end_io)) => {
                let res = do_write(&shared.mirrors, &shared.stats, &bio);
                end_io(res);
            }
            Ok(IoJob::Shutdown) | Err(_) => return,
        }
    }
}

impl std::fmt::Debug for ThreadedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedEngine")
            .field("mirrors", &self.shared.mirrors)
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}

impl BioEngine for ThreadedEngine {
    fn submit_write(&self, bio: WriteBio, end_io: EndIo) {
        let tx = self.tx.lock();
        if let Err(err) = tx.send(IoJob::Write(bio, end_io)) {
            drop(tx);
            // The pool is gone; complete on the caller so the ordered extent
            // still gets its accounting.
            if let IoJob::Write(bio, end_io) = err.0 {
                let res = do_write(&self.shared.mirrors, &self.shared.stats, &bio);
                end_io(res);
            }
        }
    }

    fn read(&self, physical: u64, len: usize, mirror: u32) -> Result<Vec<u8>> {
        do_read(&self.shared.mirrors, &self.shared.stats, physical, len, mirror)
    }

    fn write_mirror(&self, physical: u64, data: &[u8], mirror: u32) -> Result<()> {
        self.shared.mirrors.write_mirror(physical, data, mirror)
    }

    fn num_copies(&self) -> u32 {
        self.shared.mirrors.num_copies()
    }

    fn name(&self) -> &'static str {
        "threaded"
    }

    fn stats(&self) -> IoEngineStats {
        self.shared.stats.lock().clone()
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        {
            let tx = self.tx.lock();
            for _ in &workers {
                let _ = tx.send(IoJob::Shutdown);
            }
        }
        // The last reference may be dropped by a completion on an IO thread.
        let me = std::thread::current().id();
        for handle in workers {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

// ── Deferred engine ────────────────────────────────────────────────────────

/// Holds every submitted write until [`flush_pending`](Self::flush_pending).
pub struct DeferredEngine {
    mirrors: MirrorSet,
    stats: Mutex<IoEngineStats>,
    pending: Mutex<Vec<(WriteBio, EndIo)>>,
}

impl DeferredEngine {
    #[must_use]
    pub fn new(mirrors: MirrorSet) -> Self {
        Self {
            mirrors,
            stats: Mutex::new(IoEngineStats::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Writes submitted but not yet performed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Perform every parked write in submission order and run its callback.
    /// Returns the number of bios completed.
    pub fn flush_pending(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let n = batch.len();
        for (bio, end_io) in batch {
            let res = do_write(&self.mirrors, &self.stats, &bio);
            end_io(res);
        }
        debug!(bios = n, "deferred writes flushed");
        n
    }
}

impl std::fmt::Debug for DeferredEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredEngine")
            .field("mirrors", &self.mirrors)
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl BioEngine for DeferredEngine {
    fn submit_write(&self, bio: WriteBio, end_io: EndIo) {
        trace!(physical = bio.physical, len = bio.data.len(), "write deferred");
        self.pending.lock().push((bio, end_io));
    }

    fn read(&self, physical: u64, len: usize, mirror: u32) -> Result<Vec<u8>> {
        do_read(&self.mirrors, &self.stats, physical, len, mirror)
    }

    fn write_mirror(&self, physical: u64, data: &[u8], mirror: u32) -> Result<()> {
        self.mirrors.write_mirror(physical, data, mirror)
    }

    fn num_copies(&self) -> u32 {
        self.mirrors.num_copies()
    }

    fn name(&self) -> &'static str {
        "deferred"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteDevice, FaultPlan, FaultyDevice, MemByteDevice};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;

    fn mirrors(copies: usize, len: usize) -> MirrorSet {
        let devs: Vec<Arc<dyn ByteDevice>> = (0..copies)
            .map(|_| Arc::new(MemByteDevice::new(len)) as Arc<dyn ByteDevice>)
            .collect();
        MirrorSet::new(devs).expect("mirrors")
    }

    #[test]
    fn inline_engine_completes_on_caller() {
        let engine = InlineEngine::new(mirrors(1, 16384));
        let done = Arc::new(AtomicU64::new(0));
        let d = Arc::clone(&done);
        engine.submit_write(
            WriteBio {
                physical: 4096,
                data: vec![5_u8; 4096],
            },
            Box::new(move |res| {
                assert!(res.is_ok());
                d.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(engine.read(4096, 4, 0).expect("read"), vec![5_u8; 4]);
        let stats = engine.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_written, 4096);
        assert_eq!(stats.reads, 1);
        assert_eq!(engine.name(), "inline");
    }

    #[test]
    fn threaded_engine_runs_every_callback() {
        let engine = ThreadedEngine::new(mirrors(2, 1 << 20), 4).expect("engine");
        let (tx, rx) = mpsc::channel();
        for i in 0..32_u64 {
            let tx = tx.clone();
            engine.submit_write(
                WriteBio {
                    physical: i * 4096,
                    data: vec![u8::try_from(i).unwrap_or(0); 4096],
                },
                Box::new(move |res| {
                    tx.send(res.is_ok()).expect("send");
                }),
            );
        }
        drop(tx);
        let results: Vec<bool> = rx.iter().collect();
        assert_eq!(results.len(), 32);
        assert!(results.iter().all(|ok| *ok));
        assert_eq!(engine.num_copies(), 2);
        assert_eq!(engine.read(31 * 4096, 1, 2).expect("read"), vec![31_u8]);
    }

    #[test]
    fn write_errors_reach_end_io() {
        let plan = FaultPlan::new();
        let faulty: Arc<dyn ByteDevice> =
            Arc::new(FaultyDevice::new(MemByteDevice::new(8192), Arc::clone(&plan)));
        let engine = InlineEngine::new(MirrorSet::new(vec![faulty]).expect("set"));
        plan.fail_writes_in(0..4096);
        let (tx, rx) = mpsc::channel();
        engine.submit_write(
            WriteBio {
                physical: 0,
                data: vec![1_u8; 512],
            },
            Box::new(move |res| tx.send(res.is_err()).expect("send")),
        );
        assert!(rx.recv().expect("completion"));
        assert_eq!(engine.stats().write_errors, 1);
    }

    #[test]
    fn deferred_engine_holds_writes_until_flushed() {
        let engine = DeferredEngine::new(mirrors(1, 16384));
        let done = Arc::new(AtomicU64::new(0));
        for i in 0..3_u64 {
            let d = Arc::clone(&done);
            engine.submit_write(
                WriteBio {
                    physical: i * 4096,
                    data: vec![9_u8; 4096],
                },
                Box::new(move |res| {
                    assert!(res.is_ok());
                    d.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(engine.pending_count(), 3);
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(engine.read(0, 1, 0).expect("read"), vec![0_u8]);
        assert_eq!(engine.flush_pending(), 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(engine.read(8192, 1, 1).expect("read"), vec![9_u8]);
        assert_eq!(engine.flush_pending(), 0);
    }
}
