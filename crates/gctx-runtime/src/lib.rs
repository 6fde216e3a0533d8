//! # gctx-runtime
//!
//! Platform runtime for the gctx cooperative context runtime.
//!
//! This crate provides:
//! - Stack memory (mmap allocator and the slotted stack pool)
//! - Context switching (architecture-specific assembly)
//! - Contexts and the per-thread reactor that drives them
//! - Wait primitives: list, dock, latch, shared mutex
//! - Interruption and termination delivery
//! - Executor integration (descriptors, handlers, submission modes)
//! - The offload engine for blocking work on OS threads

pub mod config;
pub mod memory;
pub mod arch;
pub mod parking;
pub mod prof;
pub mod stack;
pub mod list;
pub mod context;
pub mod dock;
pub mod latch;
pub mod shared_mutex;
pub mod interrupt;
pub mod this_ctx;
pub mod pool;
pub mod concurrent;
pub mod reactor;
pub mod ios;
pub mod ole;
pub mod tls;

pub(crate) mod sched;
pub(crate) mod timer;

// Re-exports
pub use config::RuntimeConfig;
pub use context::{Builder, Context, Ctx, Exit};
pub use dock::{Dock, DockOpts};
pub use latch::Latch;
pub use shared_mutex::{SharedGuard, SharedMutex, UniqueGuard, UpgradeGuard};
pub use interrupt::{CriticalAssertion, CriticalIndicator, Uninterruptible};
pub use pool::Pool;
pub use concurrent::{concurrent_for_each, Concurrent};
pub use reactor::{PendingGuard, Reactor, ReactorHandle, ReactorStats};
pub use ios::{Descriptor, Executor};
pub use stack::Stack;
pub use list::List;

/// Request interruption of `ctx` at its next interruption point
pub fn interrupt(ctx: &Ctx) {
    sched::interrupt(ctx);
}

/// Request termination of `ctx`; every later interruption point fails
pub fn terminate(ctx: &Ctx) {
    sched::terminate(ctx);
}

/// Wake `ctx` if it waits, else record a note it consumes on its next wait
pub fn notify(ctx: &Ctx) {
    sched::notify(ctx);
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
