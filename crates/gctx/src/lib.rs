//! # gctx - cooperative stackful contexts
//!
//! Userspace-scheduled execution units ("contexts", green threads), each
//! with its own stack, multiplexed onto an OS thread by a reactor. A
//! context runs until it blocks on a primitive (wait, sleep, lock, join,
//! offload); the reactor then runs whatever else is ready.
//!
//! ## Features
//!
//! - **Stackful**: pooled mmap stacks with guard pages, or caller buffers
//! - **Fast switch**: callee-saved registers only, hand-written assembly
//! - **Primitives**: dock (condition wait), latch, shared/upgrade mutex
//! - **Cancellation**: interrupt and terminate delivered at interruption points
//! - **Instrumented executor**: per-descriptor handler statistics
//! - **Offload**: blocking work on OS threads without blocking the reactor
//!
//! ## Quick Start
//!
//! ```ignore
//! use gctx::{Context, Runtime, this_ctx};
//! use std::time::Duration;
//!
//! fn main() -> gctx::CtxResult<()> {
//!     let rt = Runtime::new()?;
//!     rt.block_on(|| -> gctx::CtxResult<()> {
//!         let child = Context::new("child", || -> gctx::CtxResult<()> {
//!             this_ctx::sleep(Duration::from_millis(10))?;
//!             println!("child woke");
//!             Ok(())
//!         })?;
//!         let sum = gctx::ole::offload(|| (1..=100u64).sum::<u64>())?;
//!         child.join()?;
//!         println!("sum {}", sum);
//!         Ok(())
//!     })?
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │      Context::new(), this_ctx::*, Dock, Latch, SharedMutex  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Reactor (per OS thread)                │
//! │        handler queue, timers, remote inbox, switch-in       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Context  │      │  Context  │      │  Offload  │
//!    │  stack    │      │  stack    │      │  threads  │
//!    └───────────┘      └───────────┘      └───────────┘
//! ```

// Re-export core types
pub use gctx_core::{
    CtxId,
    CtxFlags,
    CtxState,
    CtxError,
    CtxResult,
    MemoryError,
    ConfigError,
};

// Re-export kprint macros for debug logging
pub use gctx_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use gctx_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use gctx_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use gctx_runtime::{
    interrupt,
    terminate,
    notify,
    concurrent_for_each,
    Builder,
    Concurrent,
    Context,
    CriticalAssertion,
    CriticalIndicator,
    Descriptor,
    Dock,
    DockOpts,
    Executor,
    Latch,
    Pool,
    Reactor,
    ReactorHandle,
    ReactorStats,
    RuntimeConfig,
    SharedGuard,
    SharedMutex,
    UniqueGuard,
    Uninterruptible,
    UpgradeGuard,
};
pub use gctx_runtime::{ios, ole, this_ctx};

use gctx_runtime::Exit;

/// A reactor installed as the process's main executor
///
/// Dropping the runtime finishes the reactor's contexts first, then marks
/// the process as exiting and stops the offload engine.
pub struct Runtime {
    reactor: Reactor,
    _init: ios::Init,
}

impl Runtime {
    /// Create with the process-wide configuration
    pub fn new() -> CtxResult<Self> {
        Self::with_config(gctx_runtime::config::global().clone())
    }

    pub fn with_config(config: RuntimeConfig) -> CtxResult<Self> {
        let reactor = Reactor::with_config(config)?;
        let init = ios::Init::new(&reactor)?;
        Ok(Self { reactor, _init: init })
    }

    #[inline]
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Send-able handle for other threads
    pub fn handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// Run `f` in a context named "main" until it returns
    pub fn block_on<F, R>(&self, f: F) -> CtxResult<R>
    where
        F: FnOnce() -> R + 'static,
        R: 'static,
    {
        self.reactor.block_on(f)
    }

    /// Spawn a context on this runtime's reactor
    pub fn spawn<F, R>(&self, name: impl Into<String>, f: F) -> CtxResult<Context>
    where
        F: FnOnce() -> R + 'static,
        R: Exit,
    {
        Context::new(name, f)
    }

    /// Run until nothing is left to do
    pub fn run(&self) -> usize {
        self.reactor.run()
    }

    pub fn stats(&self) -> ReactorStats {
        self.reactor.stats()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("reactor", &self.reactor).finish()
    }
}

/// Spawn a context with default options on this thread's reactor
pub fn spawn<F, R>(name: impl Into<String>, f: F) -> CtxResult<Context>
where
    F: FnOnce() -> R + 'static,
    R: Exit,
{
    Context::new(name, f)
}

/// Yield the current context behind everything already queued
#[inline]
pub fn yield_now() -> CtxResult<()> {
    this_ctx::yield_now()
}

/// The current context's id
///
/// Returns `CtxId::NONE` outside any context.
#[inline]
pub fn current_id() -> CtxId {
    this_ctx::id()
}

/// Check if currently executing within a context
#[inline]
pub fn in_context() -> bool {
    gctx_runtime::tls::in_context()
}
