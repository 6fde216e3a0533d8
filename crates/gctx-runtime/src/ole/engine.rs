//! Offload worker threads
//!
//! One process-wide engine: a priority queue of jobs shared by a set of OS
//! threads. Workers are spawned on demand and exit only on `shutdown`, after
//! the queue has drained.

use crate::config;
use crate::parking::{Parking, PlatformParking};
use gctx_core::{kdebug, CtxResult, MemoryError, SpinLock};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

pub(super) type Task = Box<dyn FnOnce() + Send>;

struct Job {
    nice: i8,
    seq: u64,
    task: Task,
}

// Max-heap order: lower nice first, then submission order
impl Ord for Job {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.nice.cmp(&self.nice).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Job {}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OleStats {
    pub threads: usize,
    pub queued: usize,
    pub active: usize,
    pub submitted: u64,
    pub completed: u64,
    pub panics: u64,
}

pub(super) struct Engine {
    queue: SpinLock<BinaryHeap<Job>>,
    parking: PlatformParking,
    stop: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    spawned: AtomicUsize,
    seq: AtomicU64,
    active: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    panics: AtomicU64,
}

static ENGINE: OnceLock<Engine> = OnceLock::new();

pub(super) fn engine() -> &'static Engine {
    ENGINE.get_or_init(|| Engine {
        queue: SpinLock::new(BinaryHeap::new()),
        parking: PlatformParking::new(),
        stop: AtomicBool::new(false),
        workers: Mutex::new(Vec::new()),
        spawned: AtomicUsize::new(0),
        seq: AtomicU64::new(0),
        active: AtomicUsize::new(0),
        submitted: AtomicU64::new(0),
        completed: AtomicU64::new(0),
        panics: AtomicU64::new(0),
    })
}

impl Engine {
    /// Make sure at least `want` workers run
    fn ensure_workers(&'static self, workers: &mut Vec<JoinHandle<()>>, want: usize) -> CtxResult<()> {
        while workers.len() < want {
            let id = self.spawned.fetch_add(1, Ordering::Relaxed);
            let handle = thread::Builder::new()
                .name(format!("gctx-ole-{}", id))
                .spawn(move || self.worker_loop(id))
                .map_err(|_| MemoryError::AllocationFailed)?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Queue `tasks` at priority `nice`, growing the pool to `concurrency`
    pub(super) fn submit(&'static self, nice: i8, concurrency: usize, tasks: Vec<Task>) -> CtxResult<()> {
        let want = concurrency.max(config::global().ole_threads);
        // held until the jobs are queued so a concurrent shutdown drains them
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_workers(&mut workers, want)?;

        let n = tasks.len();
        {
            let mut q = self.queue.lock();
            for task in tasks {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                q.push(Job { nice, seq, task });
            }
        }
        drop(workers);
        self.submitted.fetch_add(n as u64, Ordering::Relaxed);
        if n == 1 {
            self.parking.wake_one();
        } else {
            self.parking.wake_all();
        }
        Ok(())
    }

    fn worker_loop(&self, id: usize) {
        kdebug!("ole worker {} started", id);
        let idle = config::global().park_timeout;
        loop {
            let job = self.queue.lock().pop();
            match job {
                Some(job) => {
                    self.active.fetch_add(1, Ordering::Relaxed);
                    // tasks capture their own panics; this keeps the worker alive
                    if panic::catch_unwind(AssertUnwindSafe(job.task)).is_err() {
                        self.panics.fetch_add(1, Ordering::Relaxed);
                    }
                    self.active.fetch_sub(1, Ordering::Relaxed);
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                None if self.stop.load(Ordering::Acquire) => break,
                None => {
                    self.parking.park(Some(idle));
                }
            }
        }
        kdebug!("ole worker {} exiting", id);
    }

    /// Drain the queue, then stop and join every worker
    pub(super) fn shutdown(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.parking.wake_all();
        let n = workers.len();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        self.stop.store(false, Ordering::Release);
        kdebug!("ole engine stopped {} workers", n);
    }

    pub(super) fn threads(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(super) fn stats(&self) -> OleStats {
        OleStats {
            threads: self.threads(),
            queued: self.queue.lock().len(),
            active: self.active.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}
