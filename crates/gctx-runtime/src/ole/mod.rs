//! Offload engine
//!
//! Runs blocking or CPU-heavy functions on a shared pool of OS threads while
//! the calling context sleeps. The reactor thread keeps running other
//! contexts meanwhile; the last worker to finish posts the wakeup back
//! through the reactor's remote inbox.

mod engine;

pub use engine::OleStats;

use crate::interrupt::Uninterruptible;
use crate::ios::Descriptor;
use crate::latch::Latch;
use crate::reactor::{PendingGuard, ReactorHandle};
use crate::sched;
use crate::tls;
use engine::{engine, Task};
use gctx_core::{kdebug, kerror, CtxError, CtxResult, SpinLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

static OLE_COMPLETE: Descriptor = Descriptor::with_options("ole.complete", true, false);

/// Offload options
#[derive(Debug, Clone)]
pub struct Opts {
    /// Shown in logs
    pub name: &'static str,
    /// Number of parallel invocations of the function
    pub concurrency: usize,
    /// Queue priority; lower runs first
    pub prio: i8,
}

impl Default for Opts {
    fn default() -> Self {
        Self { name: "ole", concurrency: 1, prio: 0 }
    }
}

/// Raw pointer that may cross to a worker thread
struct SendPtr<T>(*const T);

// Safety: only dereferenced on the thread that owns the pointee
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline]
    fn get(&self) -> *const T {
        self.0
    }
}

/// Lives on the waiting context's stack until every worker reported
struct Request<'f, F, T> {
    work: &'f F,
    results: Vec<SpinLock<Option<thread::Result<T>>>>,
    remaining: AtomicUsize,
    home: ReactorHandle,
    latch: SendPtr<Latch>,
    _pending: PendingGuard,
}

impl<F, T> Request<'_, F, T>
where
    F: Fn() -> T,
{
    fn run(&self, slot: usize) {
        let r = panic::catch_unwind(AssertUnwindSafe(|| (self.work)()));
        *self.results[slot].lock() = Some(r);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // last one out: nothing below may touch `self` once posted
        let home = self.home.clone();
        let latch = SendPtr(self.latch.get());
        let posted = home.post(&OLE_COMPLETE, move || {
            // Safety: the latch outlives the wait it releases
            unsafe { (*latch.get()).count_down(1) }
        });
        if let Err(e) = posted {
            kerror!("ole completion lost: {}", e);
        }
    }
}

/// Run `f` once on an offload thread and return its value
///
/// Interruption point on entry; the wait itself is not interruptible. A
/// panic in `f` is re-raised in the calling context.
pub fn offload<F, T>(f: F) -> CtxResult<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    let once = SpinLock::new(Some(f));
    let mut values = offload_with(&Opts::default(), || {
        let f = once.lock().take();
        f.map(|f| f())
    })?;
    values.pop().flatten().ok_or(CtxError::Stalled)
}

/// Run `f` on `opts.concurrency` offload threads at once
///
/// Returns every invocation's value in submission order. The first panic
/// is re-raised after all invocations finished.
pub fn offload_with<F, T>(opts: &Opts, f: F) -> CtxResult<Vec<T>>
where
    F: Fn() -> T + Sync,
    T: Send,
{
    let c = sched::require_current()?;
    sched::interruption_point(c)?;
    sched::check_switch()?;
    let inner = tls::reactor().ok_or(CtxError::NoReactor)?;

    let n = opts.concurrency.max(1);
    let home = inner.handle();
    let latch = Latch::new(1);
    let request = Request {
        work: &f,
        results: (0..n).map(|_| SpinLock::new(None)).collect(),
        remaining: AtomicUsize::new(n),
        _pending: home.pending(),
        home,
        latch: SendPtr(&latch),
    };

    let req = &request;
    let tasks: Vec<Task> = (0..n)
        .map(|slot| {
            let task: Box<dyn FnOnce() + Send + '_> = Box::new(move || req.run(slot));
            // Safety: this frame waits below until every task has reported
            unsafe { std::mem::transmute::<Box<dyn FnOnce() + Send + '_>, Task>(task) }
        })
        .collect();

    kdebug!("ole '{}' x{} prio {} from '{}'", opts.name, n, opts.prio, c.name);
    engine().submit(opts.prio, n, tasks)?;

    let waited = {
        let _ni = Uninterruptible::new();
        latch.wait()
    };
    if let Err(e) = waited {
        kerror!("ole '{}' wait failed with work in flight: {}", opts.name, e);
        std::process::abort();
    }

    let Request { results, .. } = request;
    let mut values = Vec::with_capacity(n);
    let mut fault = None;
    for slot in results {
        match slot.into_inner() {
            Some(Ok(v)) => values.push(v),
            Some(Err(payload)) => {
                fault.get_or_insert(payload);
            }
            None => return Err(CtxError::Stalled),
        }
    }
    if let Some(payload) = fault {
        panic::resume_unwind(payload);
    }
    Ok(values)
}

/// Engine counters
pub fn stats() -> OleStats {
    engine().stats()
}

/// Running worker threads
pub fn threads() -> usize {
    engine().threads()
}

/// Drain the queue and join every worker; later offloads respawn them
pub fn shutdown() {
    engine().shutdown();
}
