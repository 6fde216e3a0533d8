//! # gctx-core
//!
//! Core types and contracts for the gctx cooperative context runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching and the reactor live in `gctx-runtime`.
//!
//! ## Modules
//!
//! - `id` - Context identifier type
//! - `state` - Context flags, lifecycle state, queue membership
//! - `error` - Error and signal types
//! - `slot` - Bitmap slot allocator
//! - `traits` - Memory contracts (stack allocator, slot allocator)
//! - `spinlock` - Short-section spinlock
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod slot;
pub mod traits;
pub mod spinlock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::CtxId;
pub use state::{CtxFlags, CtxState, Membership};
pub use error::{ConfigError, CtxError, CtxResult, MemoryError};
pub use slot::SlotBitmap;
pub use traits::{SlotAllocator, StackAllocator};
pub use spinlock::SpinLock;
pub use kprint::{LogLevel, set_log_level, set_flush_enabled};
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_opt, env_get_str, env_is_set};

/// Constants for stack layout
pub mod constants {
    /// Page size assumed for guard pages and slot rounding
    pub const PAGE_SIZE: usize = 4096;

    /// Guard page size below every mapped stack
    pub const GUARD_SIZE: usize = PAGE_SIZE;

    /// Smallest usable stack
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Stack pointer alignment required by the supported ABIs
    pub const STACK_ALIGN: usize = 16;
}
