//! Per-thread reactor
//!
//! Runs submitted handlers in FIFO order, fires context timers, drains the
//! cross-thread inbox and switches into contexts. One reactor per OS thread;
//! it is installed into thread-local state on construction and removed on
//! drop.
//!
//! The loop parks the OS thread only when nothing is runnable but a timer is
//! armed or remote work is pending. With neither it returns: every remaining
//! context waits on something only local code can signal.

use crate::arch::{self, SavedRegs};
use crate::config::{self, RuntimeConfig};
use crate::context::{Context, Ctx};
use crate::ios::{self, Descriptor, Handle, SendHandle};
use crate::memory::StackPool;
use crate::parking::{Parking, PlatformParking};
use crate::sched;
use crate::stack::Stack;
use crate::timer::TimerQueue;
use crate::tls;
use gctx_core::kprint::{log_level, set_log_level, LogLevel};
use gctx_core::{kdebug, kwarn};
use gctx_core::{CtxError, CtxFlags, CtxId, CtxResult, CtxState, MemoryError};
use crossbeam_queue::SegQueue;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Reactor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorStats {
    /// Handlers invoked
    pub handlers: u64,
    /// Switches into contexts
    pub switches: u64,
    /// Timers that woke a context
    pub timers_fired: u64,
    /// Handlers received through the remote inbox
    pub remote: u64,
    /// Slice and stack watchdog warnings
    pub warnings: u64,
    /// Live contexts
    pub live: usize,
    /// Handlers waiting to run
    pub queued: usize,
}

/// State reachable from other threads
pub(crate) struct Shared {
    inbox: SegQueue<SendHandle>,
    parking: PlatformParking,
    /// Outstanding remote work that will post back here
    pending: AtomicUsize,
    closed: AtomicBool,
    thread: ThreadId,
}

impl Shared {
    fn has_remote(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0 || !self.inbox.is_empty()
    }
}

pub(crate) struct Inner {
    pub(crate) config: RuntimeConfig,
    queue: RefCell<VecDeque<Handle>>,
    timers: RefCell<TimerQueue>,
    live: RefCell<HashMap<CtxId, NonNull<Ctx>>>,
    /// Register file of the reactor stack while a context runs
    main_regs: UnsafeCell<SavedRegs>,
    pool: RefCell<Option<Rc<RefCell<StackPool>>>>,
    pub(crate) shared: Arc<Shared>,
    handlers: Cell<u64>,
    warnings: Cell<u64>,
    switches: Cell<u64>,
    timers_fired: Cell<u64>,
    remote: Cell<u64>,
    closed: Cell<bool>,
}

impl Inner {
    #[inline]
    pub(crate) fn main_regs(&self) -> *mut SavedRegs {
        self.main_regs.get()
    }

    pub(crate) fn enqueue(&self, h: Handle) {
        self.queue.borrow_mut().push_back(h);
    }

    pub(crate) fn enqueue_front(&self, h: Handle) {
        self.queue.borrow_mut().push_front(h);
    }

    pub(crate) fn arm_timer(&self, deadline: Instant, ctx: CtxId, epoch: u64) {
        self.timers.borrow_mut().arm(deadline, ctx, epoch);
    }

    pub(crate) fn register(&self, ptr: NonNull<Ctx>) {
        // Safety: freshly created control block
        let id = unsafe { ptr.as_ref() }.id;
        self.live.borrow_mut().insert(id, ptr);
    }

    pub(crate) fn handle(&self) -> ReactorHandle {
        ReactorHandle { shared: Arc::clone(&self.shared) }
    }

    /// Stack for a new context; the default size comes from the pool
    /// while slots remain
    pub(crate) fn allocate_stack(&self, size: usize) -> CtxResult<Stack> {
        if size == self.config.stack_size && self.config.stack_pool_slots > 0 {
            match Stack::pooled(&self.pool()?) {
                Ok(stack) => return Ok(stack),
                Err(MemoryError::PoolExhausted) => {
                    kdebug!("stack pool exhausted, mapping {} bytes", size);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Stack::mapped(size, self.config.stack_guard)?)
    }

    fn pool(&self) -> CtxResult<Rc<RefCell<StackPool>>> {
        let mut slot = self.pool.borrow_mut();
        if let Some(pool) = slot.as_ref() {
            return Ok(Rc::clone(pool));
        }
        let pool = Rc::new(RefCell::new(StackPool::new(
            self.config.stack_pool_slots,
            self.config.stack_size,
        )?));
        *slot = Some(Rc::clone(&pool));
        Ok(pool)
    }

    /// Run a queued context until it suspends or finishes
    ///
    /// Only called from the reactor stack. A context that finished is
    /// reaped here, and an uncaught error from it is re-raised as a panic.
    pub(crate) fn switch_in(&self, ptr: NonNull<Ctx>) {
        // Safety: queued contexts are alive; c is not used after reaping
        let c = unsafe { ptr.as_ref() };
        debug_assert!(tls::current_ctx().is_none(), "switch_in from a context stack");
        debug_assert_eq!(c.state.get(), CtxState::Queued, "context '{}' not queued", c.name);

        c.state.set(CtxState::Running);
        c.epoch.set(c.epoch.get() + 1);
        self.switches.set(self.switches.get() + 1);
        let start = Instant::now();

        tls::set_current_ctx(Some(ptr));
        // Safety: c.regs holds either a fresh frame from init_context or the
        // state saved by its last suspension
        unsafe { arch::switch_context(self.main_regs.get(), c.regs.get()) };
        tls::set_current_ctx(None);

        self.check_slice(c, start.elapsed());

        if c.state.get().is_finished() {
            self.reap(ptr);
        }
    }

    /// Slice watchdog
    fn check_slice(&self, c: &Ctx, slice: Duration) {
        let limit = self.config.slice_warning;
        if limit.is_zero() || slice < limit || c.flags.get().contains(CtxFlags::SLICE_EXEMPT) {
            return;
        }
        self.warned();
        kwarn!("context '{}' {} ran {:?} without suspending", c.name, c.id, slice);
    }

    #[inline]
    pub(crate) fn warned(&self) {
        self.warnings.set(self.warnings.get() + 1);
    }

    fn reap(&self, ptr: NonNull<Ctx>) {
        let c = unsafe { ptr.as_ref() };
        self.live.borrow_mut().remove(&c.id);
        let fault = c.take_fault();
        if c.flags.get().contains(CtxFlags::DETACH) {
            // Safety: finished, unregistered, and nobody owns it
            unsafe { Ctx::free(ptr) };
        }
        if let Some(payload) = fault {
            std::panic::resume_unwind(payload);
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let Some(entry) = self.timers.borrow_mut().pop_expired(now) else {
                break;
            };
            if !self.timer_is_live(entry.ctx, entry.epoch) {
                continue;
            }
            let ptr = self.live.borrow()[&entry.ctx];
            let c = unsafe { ptr.as_ref() };
            c.timed_out.set(true);
            sched::wake(c);
            self.timers_fired.set(self.timers_fired.get() + 1);
        }
    }

    fn drain_remote(&self) {
        while let Some(h) = self.shared.inbox.pop() {
            self.remote.set(self.remote.get() + 1);
            self.enqueue(h.into_local());
        }
    }

    /// A timer still able to wake its context
    fn timer_is_live(&self, ctx: CtxId, epoch: u64) -> bool {
        self.live.borrow().get(&ctx).is_some_and(|p| {
            let c = unsafe { p.as_ref() };
            c.epoch.get() == epoch && c.state.get() == CtxState::Waiting
        })
    }

    fn has_events(&self) -> bool {
        if self.shared.has_remote() {
            return true;
        }
        let mut timers = self.timers.borrow_mut();
        timers.retain(|e| self.timer_is_live(e.ctx, e.epoch));
        !timers.is_empty()
    }

    fn park(&self) {
        let timeout = self.config.park_timeout;
        let timeout = match self.timers.borrow().next_deadline() {
            Some(d) => d.saturating_duration_since(Instant::now()).min(timeout),
            None => timeout,
        };
        if !timeout.is_zero() {
            self.shared.parking.park(Some(timeout));
        }
    }

    /// Invoke one handler if one is runnable without waiting
    fn poll_one(&self) -> bool {
        self.fire_timers();
        self.drain_remote();
        let Some(h) = self.queue.borrow_mut().pop_front() else {
            return false;
        };
        self.handlers.set(self.handlers.get() + 1);
        h.invoke();
        true
    }

    /// Invoke one handler, parking until one is available; false when
    /// nothing can become runnable
    pub(crate) fn run_one(&self) -> bool {
        loop {
            if self.poll_one() {
                return true;
            }
            if self.closed.get() || !self.has_events() {
                return false;
            }
            self.park();
        }
    }

    pub(crate) fn run_until(&self, mut pred: impl FnMut() -> bool) -> CtxResult<()> {
        debug_assert!(tls::current_ctx().is_none(), "reactor driven from a context stack");
        loop {
            if pred() {
                return Ok(());
            }
            if !self.run_one() {
                if pred() {
                    return Ok(());
                }
                kdebug!("reactor stalled: {} live contexts", self.live.borrow().len());
                return Err(CtxError::Stalled);
            }
        }
    }
}

/// Send-able entry point into a reactor
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    fn push(&self, h: SendHandle) -> CtxResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CtxError::NoReactor);
        }
        self.shared.inbox.push(h);
        self.shared.parking.wake_one();
        Ok(())
    }

    pub fn post(&self, desc: &'static Descriptor, f: impl FnOnce() + Send + 'static) -> CtxResult<()> {
        self.push(SendHandle::new(desc, f))
    }

    /// Inline on the reactor's thread when outside any context
    pub fn dispatch(&self, desc: &'static Descriptor, f: impl FnOnce() + Send + 'static) -> CtxResult<()> {
        if self.is_local() && !tls::in_context() {
            ios::handler::invoke_inline(desc, f);
            return Ok(());
        }
        self.post(desc, f)
    }

    pub fn defer(&self, desc: &'static Descriptor, f: impl FnOnce() + Send + 'static) -> CtxResult<()> {
        self.post(desc, f)
    }

    /// Whether the calling thread runs this reactor
    pub fn is_local(&self) -> bool {
        self.shared.thread == thread::current().id()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn thread(&self) -> ThreadId {
        self.shared.thread
    }

    /// Keep the reactor from returning while remote work is outstanding
    pub fn pending(&self) -> PendingGuard {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        PendingGuard { shared: Arc::clone(&self.shared) }
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("thread", &self.shared.thread)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[must_use]
pub struct PendingGuard {
    shared: Arc<Shared>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        self.shared.parking.wake_one();
    }
}

/// The reactor of the calling OS thread
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Create with the process-wide configuration
    pub fn new() -> CtxResult<Self> {
        Self::with_config(config::global().clone())
    }

    pub fn with_config(config: RuntimeConfig) -> CtxResult<Self> {
        config.validate()?;
        if config.debug_logging && log_level() < LogLevel::Debug {
            set_log_level(LogLevel::Debug);
        }

        let inner = Rc::new(Inner {
            config,
            queue: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerQueue::new()),
            live: RefCell::new(HashMap::new()),
            main_regs: UnsafeCell::new(SavedRegs::default()),
            pool: RefCell::new(None),
            shared: Arc::new(Shared {
                inbox: SegQueue::new(),
                parking: PlatformParking::new(),
                pending: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                thread: thread::current().id(),
            }),
            handlers: Cell::new(0),
            warnings: Cell::new(0),
            switches: Cell::new(0),
            timers_fired: Cell::new(0),
            remote: Cell::new(0),
            closed: Cell::new(false),
        });

        if !tls::install_reactor(Rc::clone(&inner)) {
            return Err(CtxError::ReactorExists);
        }
        kdebug!("reactor installed on {:?}", inner.shared.thread);
        Ok(Self { inner })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.inner.handle()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Run until nothing can become runnable; returns handlers invoked
    pub fn run(&self) -> usize {
        let mut n = 0;
        while self.inner.run_one() {
            n += 1;
        }
        n
    }

    /// Run a single handler, waiting for one if timers or remote work are
    /// outstanding
    pub fn run_one(&self) -> bool {
        self.inner.run_one()
    }

    /// Run what is runnable now without parking
    pub fn poll(&self) -> usize {
        let mut n = 0;
        while self.inner.poll_one() {
            n += 1;
        }
        n
    }

    /// Run until `pred` holds; `Stalled` if the loop ran dry first
    pub fn run_until(&self, pred: impl FnMut() -> bool) -> CtxResult<()> {
        self.inner.run_until(pred)
    }

    /// Run `f` in a new context and drive the reactor until it returns
    pub fn block_on<F, R>(&self, f: F) -> CtxResult<R>
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        assert!(!tls::in_context(), "block_on called from inside a context");
        let out = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&out);
        let ctx = Context::builder()
            .name("main")
            .spawn(move || {
                *slot.borrow_mut() = Some(f());
            })?;
        self.inner.run_until(|| ctx.joined())?;
        drop(ctx);
        let value = out.borrow_mut().take();
        value.ok_or(CtxError::Stalled)
    }

    /// Live contexts
    pub fn live(&self) -> usize {
        self.inner.live.borrow().len()
    }

    /// Handlers waiting to run
    pub fn queued(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    pub fn stats(&self) -> ReactorStats {
        let i = &self.inner;
        ReactorStats {
            handlers: i.handlers.get(),
            switches: i.switches.get(),
            timers_fired: i.timers_fired.get(),
            remote: i.remote.get(),
            warnings: i.warnings.get(),
            live: self.live(),
            queued: self.queued(),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<Inner> {
        &self.inner
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let inner = &self.inner;

        // Contexts never started are started so they can see the request
        let live: Vec<_> = inner.live.borrow().values().copied().collect();
        for ptr in live {
            let c = unsafe { ptr.as_ref() };
            if c.state.get() == CtxState::Created {
                c.state.set(CtxState::Queued);
                inner.enqueue(Handle::new(&sched::SPAWN, move || sched::resume(ptr)));
            }
            sched::terminate(c);
        }
        if !thread::panicking() {
            while inner.run_one() {}
        }

        let left = inner.live.borrow().len();
        if left > 0 {
            kwarn!("reactor dropped with {} live contexts", left);
        }

        inner.closed.set(true);
        inner.shared.closed.store(true, Ordering::Release);
        inner.queue.borrow_mut().clear();
        inner.timers.borrow_mut().clear();
        while inner.shared.inbox.pop().is_some() {}
        tls::uninstall_reactor();
        kdebug!("reactor removed from {:?}", inner.shared.thread);
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::this_ctx;
    use std::sync::atomic::AtomicU32;

    static TEST_REMOTE: Descriptor = Descriptor::new("test.remote");

    #[test]
    fn test_one_reactor_per_thread() {
        let reactor = Reactor::new().unwrap();
        assert!(matches!(Reactor::new(), Err(CtxError::ReactorExists)));
        drop(reactor);
        assert!(!tls::has_reactor());
        let again = Reactor::new().unwrap();
        drop(again);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig::new().stack_size(1024);
        assert!(matches!(Reactor::with_config(config), Err(CtxError::Config(_))));
        assert!(!tls::has_reactor());
    }

    #[test]
    fn test_spawn_join_leaves_nothing_behind() {
        static TEST_TICK: Descriptor = Descriptor::new("test.tick");
        let reactor = Reactor::new().unwrap();
        let ctxs: Vec<_> = (0..16u64)
            .map(|i| {
                Context::builder()
                    .name(format!("n{}", i))
                    .flags(CtxFlags::POST)
                    .spawn(move || -> CtxResult<()> {
                        ios::post(&TEST_TICK, || ())?;
                        this_ctx::sleep(Duration::from_millis(i % 3))
                    })
                    .unwrap()
            })
            .collect();
        for c in &ctxs {
            c.join().unwrap();
        }
        drop(ctxs);
        reactor.run();
        assert_eq!(reactor.live(), 0);
        assert_eq!(reactor.queued(), 0);
        assert!(TEST_TICK.is_balanced());
        assert_eq!(TEST_TICK.stats().calls, 16);
    }

    #[test]
    fn test_block_on_returns_value() {
        let reactor = Reactor::new().unwrap();
        let v = reactor
            .block_on(|| {
                this_ctx::sleep(Duration::from_millis(2)).unwrap();
                42
            })
            .unwrap();
        assert_eq!(v, 42);
        assert!(reactor.stats().switches >= 2);
    }

    #[test]
    fn test_run_until_stalls() {
        let reactor = Reactor::new().unwrap();
        let ctx = Context::builder()
            .flags(CtxFlags::WAIT_JOIN)
            .spawn(this_ctx::wait)
            .unwrap();
        assert_eq!(reactor.run_until(|| ctx.joined()), Err(CtxError::Stalled));
        ctx.interrupt();
        reactor.run_until(|| ctx.joined()).unwrap();
    }

    #[test]
    fn test_remote_post_wakes_parked_reactor() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let hits = Arc::new(AtomicU32::new(0));

        let guard = handle.pending();
        let (h, n) = (handle.clone(), hits.clone());
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            h.post(&TEST_REMOTE, move || {
                n.fetch_add(1, Ordering::SeqCst);
                drop(guard);
            })
            .unwrap();
        });

        // parks until the remote completion arrives
        assert!(reactor.run() >= 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.stats().remote, 1);
        t.join().unwrap();
    }

    #[test]
    fn test_handle_rejects_after_drop() {
        let reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        assert!(handle.is_local());
        drop(reactor);
        assert!(handle.is_closed());
        assert_eq!(handle.post(&TEST_REMOTE, || ()), Err(CtxError::NoReactor));
    }

    #[test]
    fn test_drop_terminates_live_contexts() {
        let reactor = Reactor::new().unwrap();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let ctx = Context::new("forever", move || {
            let r = this_ctx::wait();
            *s.borrow_mut() = Some(r.clone());
            r
        })
        .unwrap();
        assert!(ctx.detach().is_some());
        drop(reactor);
        assert_eq!(*seen.borrow(), Some(Err(CtxError::Terminated)));
    }

    #[test]
    fn test_default_stacks_come_from_pool() {
        let config = RuntimeConfig::new().stack_pool_slots(2);
        let reactor = Reactor::with_config(config).unwrap();
        let spawn = || {
            Context::builder()
                .flags(CtxFlags::WAIT_JOIN)
                .spawn(this_ctx::wait)
                .unwrap()
        };
        let a = spawn();
        let b = spawn();
        // pool exhausted: falls back to a mapped stack
        let c = spawn();
        let pooled = |x: &Context| unsafe { x.as_ptr().unwrap().as_ref() }.stack.is_pooled();
        assert!(pooled(&a) && pooled(&b) && !pooled(&c));
        for x in [&a, &b, &c] {
            x.interrupt();
        }
        reactor.run();
    }

    fn spin(d: Duration) {
        let start = Instant::now();
        while start.elapsed() < d {
            std::hint::spin_loop();
        }
    }

    #[test]
    fn test_slice_watchdog() {
        let config = RuntimeConfig::new().slice_warning(Duration::from_millis(1));
        let reactor = Reactor::with_config(config).unwrap();

        let quick = Context::new("quick", || ()).unwrap();
        let exempt = Context::builder()
            .flags(CtxFlags::SLICE_EXEMPT)
            .spawn(|| spin(Duration::from_millis(5)))
            .unwrap();
        assert!(quick.joined() && exempt.joined());
        assert_eq!(reactor.stats().warnings, 0);

        let hog = Context::new("hog", || spin(Duration::from_millis(5))).unwrap();
        reactor.run();
        assert!(hog.joined());
        assert_eq!(reactor.stats().warnings, 1);
    }

    #[test]
    fn test_stack_watchdog() {
        let config = RuntimeConfig::new()
            .stack_size(64 * 1024)
            .stack_profiling(true)
            .stack_warn_percent(1)
            .slice_warning(Duration::ZERO);
        let reactor = Reactor::with_config(config).unwrap();
        let deep = || -> CtxResult<()> {
            let pad = [0u8; 4096];
            std::hint::black_box(&pad);
            this_ctx::yield_now()?;
            std::hint::black_box(&pad);
            Ok(())
        };

        let exempt = Context::builder().flags(CtxFlags::STACK_EXEMPT).spawn(deep).unwrap();
        reactor.run();
        assert!(exempt.joined());
        assert!(exempt.stack_peak() >= 4096);
        assert_eq!(reactor.stats().warnings, 0);

        let hot = Context::new("hot", deep).unwrap();
        reactor.run();
        assert!(hot.joined());
        assert!(reactor.stats().warnings >= 1);
    }
}
