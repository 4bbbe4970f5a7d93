//! Fixed-size worker pools.
//!
//! Two pools exist per filesystem: one runs compression jobs, one runs
//! ordered-extent completion so that IO callbacks never do metadata work on
//! the IO thread. [`WorkerPool::submit`] returns a [`TaskHandle`]; callers
//! that need results in submission order simply join their handles in the
//! order they were created.

use cfs_error::{CfsError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result of one submitted job.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the job has run.
    pub fn join(self) -> Result<T> {
        self.rx.recv().map_err(|_| {
            CfsError::Io(std::io::Error::other("worker exited before finishing a job"))
        })
    }
}

pub struct WorkerPool {
    name: &'static str,
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.workers.lock().len())
            .finish()
    }
}

/// Number of workers for a `threads` setting of 0 ("one per CPU").
#[must_use]
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map_or(2, std::num::NonZeroUsize::get)
        .min(8)
}

impl WorkerPool {
    /// Spawn `threads` workers; 0 means one per CPU.
    pub fn new(name: &'static str, threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            default_threads()
        } else {
            threads
        };
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let rx = Arc::clone(&rx);
            let handle = std::thread::Builder::new()
                .name(format!("cfs-{name}-{idx}"))
                .spawn(move || worker_loop(&rx))?;
            workers.push(handle);
        }
        debug!(target: "cfs::workers", pool = name, threads, "worker pool started");
        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Run `job` on a worker. After [`shutdown`](Self::shutdown) the job runs
    /// on the caller.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        let tx = self.tx.lock();
        let rejected = match tx.as_ref() {
            Some(tx) => tx.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        drop(tx);
        if let Some(job) = rejected {
            trace!(target: "cfs::workers", pool = self.name, "pool closed, running inline");
            job();
        }
    }

    /// Run `f` on a worker and hand back its result through a [`TaskHandle`].
    pub fn submit<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> TaskHandle<T> {
        let (tx, rx) = channel();
        self.spawn(move || {
            let _ = tx.send(f());
        });
        TaskHandle { rx }
    }

    /// Stop accepting jobs, let queued jobs finish and join the workers.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let me = std::thread::current().id();
        for handle in workers {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        debug!(target: "cfs::workers", pool = self.name, "worker pool stopped");
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>) {
    loop {
        let job = rx.lock().recv();
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
