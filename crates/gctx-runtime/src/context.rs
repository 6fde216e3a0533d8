//! Contexts: control block, spawn builder and owning handle
//!
//! A context is a resumable unit of execution with its own stack. The
//! control block (`Ctx`) lives in a heap allocation that never moves while
//! the context is alive; its address is the context's identity and its
//! intrusive link fields let wait-queues hold it without allocating.
//!
//! Ownership:
//! - `Context` owns a running or finished context; dropping it interrupts
//!   (unless WAIT_JOIN) and joins, then frees the control block.
//! - A DETACH context frees itself when its entry function returns.

use crate::arch::{self, SavedRegs};
use crate::dock::Dock;
use crate::interrupt::Uninterruptible;
use crate::ios::{self, Handle};
use crate::reactor::Inner;
use crate::sched;
use crate::stack::Stack;
use crate::tls;
use gctx_core::{kerror, ktrace};
use gctx_core::{CtxError, CtxFlags, CtxId, CtxResult, CtxState, Membership};
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;

type Entry = Box<dyn FnOnce() -> Option<String>>;
type Fault = Box<dyn Any + Send + 'static>;

/// Context control block
pub struct Ctx {
    pub(crate) id: CtxId,
    pub(crate) name: String,
    pub(crate) flags: Cell<CtxFlags>,
    pub(crate) state: Cell<CtxState>,

    // Intrusive links; owned by the queue named in `member`
    pub(crate) prev: Cell<Option<NonNull<Ctx>>>,
    pub(crate) next: Cell<Option<NonNull<Ctx>>>,
    pub(crate) member: Cell<Membership>,

    pub(crate) regs: UnsafeCell<SavedRegs>,
    pub(crate) stack: Stack,
    entry: Cell<Option<Entry>>,

    /// Wake-ups recorded while not waiting
    pub(crate) notes: Cell<usize>,
    /// Switches into this context so far
    pub(crate) epoch: Cell<u64>,
    /// Set by the reactor when a timed wait expired
    pub(crate) timed_out: Cell<bool>,
    pub(crate) nice: Cell<i8>,
    /// Active critical assertions
    pub(crate) critical: Cell<u32>,

    pub(crate) joiners: Dock,
    fault: Cell<Option<Fault>>,

    // Dropped last so the stack returns to its pool first
    pub(crate) reactor: Rc<Inner>,
}

impl Ctx {
    #[inline]
    pub fn id(&self) -> CtxId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> CtxState {
        self.state.get()
    }

    #[inline]
    pub fn flags(&self) -> CtxFlags {
        self.flags.get()
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    #[inline]
    pub fn notes(&self) -> usize {
        self.notes.get()
    }

    #[inline]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    #[inline]
    pub(crate) fn set_flag(&self, flag: CtxFlags) {
        self.flags.set(self.flags.get().with(flag));
    }

    #[inline]
    pub(crate) fn clear_flag(&self, flag: CtxFlags) {
        self.flags.set(self.flags.get().without(flag));
    }

    #[inline]
    pub(crate) fn ptr(&self) -> NonNull<Ctx> {
        NonNull::from(self)
    }

    pub(crate) fn take_fault(&self) -> Option<Fault> {
        self.fault.take()
    }

    /// Free a control block and its stack
    ///
    /// # Safety
    ///
    /// The context must be finished, reaped from its reactor, and no other
    /// pointer to it may be used afterwards.
    pub(crate) unsafe fn free(ptr: NonNull<Ctx>) {
        debug_assert!(ptr.as_ref().state.get().is_finished());
        debug_assert!(ptr.as_ref().member.get().is_none());
        drop(Box::from_raw(ptr.as_ptr()));
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("flags", &self.flags.get())
            .field("epoch", &self.epoch.get())
            .finish()
    }
}

/// Return value of a context's entry function
///
/// `()` is a clean exit. A `Result` is clean when `Ok` or when the error is
/// an interruption or termination signal; any other error escaping the
/// entry function is fatal.
pub trait Exit {
    /// Message describing a fatal exit, `None` for a clean one
    fn into_fatal(self) -> Option<String>;
}

impl Exit for () {
    #[inline]
    fn into_fatal(self) -> Option<String> {
        None
    }
}

impl<E: fmt::Display + 'static> Exit for Result<(), E> {
    fn into_fatal(self) -> Option<String> {
        let e = self.err()?;
        match (&e as &dyn Any).downcast_ref::<CtxError>() {
            Some(signal) if signal.is_signal() => None,
            _ => Some(e.to_string()),
        }
    }
}

/// First code run on a fresh context stack
extern "C" fn ctx_main(arg: usize) -> ! {
    // Safety: `arg` is the control block address given to init_context; it
    // stays allocated until this context is reaped after its final switch.
    let ctx = unsafe { &*(arg as *const Ctx) };
    run_entry(ctx);

    // Safety: the reactor's main register file is live while a context runs
    unsafe { arch::switch_context(ctx.regs.get(), ctx.reactor.main_regs()) };
    std::process::abort();
}

fn run_entry(ctx: &Ctx) {
    let fault: Option<Fault> = ctx.entry.take().and_then(|entry| {
        match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(None) => None,
            Ok(Some(msg)) => {
                kerror!("context '{}' {} exited with uncaught error: {}", ctx.name, ctx.id, msg);
                Some(Box::new(format!("uncaught error in context '{}': {}", ctx.name, msg)) as Fault)
            }
            Err(payload) => {
                kerror!("context '{}' {} panicked", ctx.name, ctx.id);
                Some(payload)
            }
        }
    });

    ctx.fault.set(fault);
    ctx.state.set(CtxState::Terminated);
    ktrace!("context '{}' {} finished", ctx.name, ctx.id);
    ctx.joiners.notify_all();
}

enum StackSpec {
    Default,
    Size(usize),
    Buffer(Box<[u8]>),
}

/// Context spawn configuration
pub struct Builder {
    name: Option<String>,
    stack: StackSpec,
    flags: CtxFlags,
    nice: i8,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: None,
            stack: StackSpec::Default,
            flags: CtxFlags::NONE,
            nice: 0,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Request a stack of `size` bytes
    ///
    /// The configured default size is served from the reactor's stack pool.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack = StackSpec::Size(size);
        self
    }

    /// Run on a caller-supplied buffer
    pub fn stack_buffer(mut self, buf: Box<[u8]>) -> Self {
        self.stack = StackSpec::Buffer(buf);
        self
    }

    pub fn flags(mut self, flags: CtxFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Queueing priority for SORT docks; lower runs first
    pub fn nice(mut self, nice: i8) -> Self {
        self.nice = nice;
        self
    }

    /// Create the context and start it according to the spawn flags
    ///
    /// Without POST/DISPATCH/DEFER the entry function runs before this
    /// returns, up to its first suspension. With DETACH the returned handle
    /// is empty.
    pub fn spawn<F, R>(self, f: F) -> CtxResult<Context>
    where
        F: FnOnce() -> R + 'static,
        R: Exit,
    {
        let inner = tls::reactor().ok_or(CtxError::NoReactor)?;
        let stack = match self.stack {
            StackSpec::Default => inner.allocate_stack(inner.config.stack_size)?,
            StackSpec::Size(size) => inner.allocate_stack(size)?,
            StackSpec::Buffer(buf) => Stack::from_buffer(buf)?,
        };

        let flags = self.flags.without(CtxFlags::INTERRUPTED | CtxFlags::TERMINATED);
        let entry: Entry = Box::new(move || f().into_fatal());
        let ctx = Box::new(Ctx {
            id: CtxId::next(),
            name: self.name.unwrap_or_else(|| String::from("ctx")),
            flags: Cell::new(flags),
            state: Cell::new(CtxState::Created),
            prev: Cell::new(None),
            next: Cell::new(None),
            member: Cell::new(Membership::None),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack,
            entry: Cell::new(Some(entry)),
            notes: Cell::new(0),
            epoch: Cell::new(0),
            timed_out: Cell::new(false),
            nice: Cell::new(self.nice),
            critical: Cell::new(0),
            joiners: Dock::new(),
            fault: Cell::new(None),
            reactor: Rc::clone(&inner),
        });

        let ptr = NonNull::from(Box::leak(ctx));
        // Safety: the stack belongs to this control block and outlives it
        unsafe {
            let c = ptr.as_ref();
            arch::init_context(&mut *c.regs.get(), c.stack.base(), ctx_main, ptr.as_ptr() as usize);
        }
        inner.register(ptr);
        let c = unsafe { ptr.as_ref() };
        ktrace!("context '{}' {} spawned {:?}", c.name, c.id, flags);

        let handle = if flags.contains(CtxFlags::DETACH) {
            Context { ptr: None }
        } else {
            Context { ptr: Some(ptr) }
        };
        launch(&inner, ptr, flags)?;
        Ok(handle)
    }
}

/// First resumption of a freshly created context
fn launch(inner: &Rc<Inner>, ptr: NonNull<Ctx>, flags: CtxFlags) -> CtxResult<()> {
    let c = unsafe { ptr.as_ref() };
    let start = move || sched::resume(ptr);

    if flags.contains(CtxFlags::POST) {
        c.state.set(CtxState::Queued);
        return ios::post(&sched::SPAWN, start);
    }
    if flags.contains(CtxFlags::DEFER) {
        c.state.set(CtxState::Queued);
        return ios::defer(&sched::SPAWN, start);
    }
    if flags.contains(CtxFlags::DISPATCH) {
        c.state.set(CtxState::Queued);
        return ios::dispatch(&sched::SPAWN, start);
    }

    match tls::current_ctx() {
        None => {
            c.state.set(CtxState::Queued);
            inner.switch_in(ptr);
            Ok(())
        }
        Some(_) if sched::check_switch().is_err() => {
            c.state.set(CtxState::Queued);
            inner.enqueue(Handle::new(&sched::SPAWN, start));
            Ok(())
        }
        Some(parent) => {
            // child first, then the parent right behind it
            let p = unsafe { parent.as_ref() };
            sched::may_suspend(p)?;
            c.state.set(CtxState::Queued);
            p.state.set(CtxState::Queued);
            inner.enqueue_front(sched::resume_handle(parent));
            inner.enqueue_front(Handle::new(&sched::SPAWN, start));
            sched::suspend(p);
            Ok(())
        }
    }
}

/// Owning handle to a context
pub struct Context {
    ptr: Option<NonNull<Ctx>>,
}

impl Context {
    /// Spawn with default options
    pub fn new<F, R>(name: impl Into<String>, f: F) -> CtxResult<Context>
    where
        F: FnOnce() -> R + 'static,
        R: Exit,
    {
        Builder::new().name(name).spawn(f)
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> Option<NonNull<Ctx>> {
        self.ptr
    }

    #[inline]
    fn ctx(&self) -> Option<&Ctx> {
        // Safety: an owned control block is freed only by this handle
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    /// True when the handle is empty or the context finished
    pub fn joined(&self) -> bool {
        self.ctx().is_none_or(|c| c.state.get().is_finished())
    }

    /// Wait for the context to finish
    ///
    /// Inside a context this suspends the caller and is an interruption
    /// point; outside any context it drives the reactor until the target
    /// finishes.
    pub fn join(&self) -> CtxResult<()> {
        match self.ptr {
            Some(ptr) => join_ptr(ptr),
            None => Ok(()),
        }
    }

    pub fn interrupt(&self) {
        if let Some(c) = self.ctx() {
            sched::interrupt(c);
        }
    }

    pub fn terminate(&self) {
        if let Some(c) = self.ctx() {
            sched::terminate(c);
        }
    }

    /// Give up ownership; the context frees itself when it finishes
    ///
    /// Returns `None` when the context already finished and was freed here.
    pub fn detach(mut self) -> Option<NonNull<Ctx>> {
        let ptr = self.ptr.take()?;
        let c = unsafe { ptr.as_ref() };
        if c.state.get().is_finished() {
            // Safety: finished and reaped, and this handle was the owner
            unsafe { Ctx::free(ptr) };
            return None;
        }
        c.set_flag(CtxFlags::DETACH);
        Some(ptr)
    }

    pub fn id(&self) -> CtxId {
        self.ctx().map_or(CtxId::NONE, |c| c.id)
    }

    pub fn name(&self) -> Option<&str> {
        self.ctx().map(|c| c.name.as_str())
    }

    pub fn state(&self) -> Option<CtxState> {
        self.ctx().map(|c| c.state.get())
    }

    pub fn flags(&self) -> CtxFlags {
        self.ctx().map_or(CtxFlags::NONE, |c| c.flags.get())
    }

    /// Stack high-water mark (sampled with stack profiling)
    pub fn stack_peak(&self) -> usize {
        self.ctx().map_or(0, |c| c.stack.peak())
    }
}

fn join_ptr(ptr: NonNull<Ctx>) -> CtxResult<()> {
    let c = unsafe { ptr.as_ref() };
    if c.state.get().is_finished() {
        return Ok(());
    }
    match tls::current_ctx() {
        Some(cur) => {
            assert!(cur != ptr, "context '{}' cannot join itself", c.name);
            c.joiners.wait(|| c.state.get().is_finished())
        }
        None => c.reactor.run_until(|| c.state.get().is_finished()),
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let Some(ptr) = self.ptr.take() else {
            return;
        };
        let c = unsafe { ptr.as_ref() };

        if !c.state.get().is_finished() {
            if tls::current_ctx() == Some(ptr) {
                c.set_flag(CtxFlags::DETACH);
                return;
            }
            if !c.flags.get().contains(CtxFlags::WAIT_JOIN) {
                sched::interrupt(c);
            }
            let joined = {
                let _nointerrupt = Uninterruptible::new();
                join_ptr(ptr)
            };
            if let Err(e) = joined {
                gctx_core::kwarn!("context '{}' {} not joined ({}); detaching", c.name, c.id, e);
                c.set_flag(CtxFlags::DETACH);
                return;
            }
        }

        // Safety: finished, reaped, and owned by this handle
        unsafe { Ctx::free(ptr) };
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ctx() {
            Some(c) => c.fmt(f),
            None => f.write_str("Context(detached)"),
        }
    }
}
