//! Architecture-specific context switching
//!
//! Each backend provides `SavedRegs` (the callee-saved register file of a
//! suspended context), `init_context` (prepare registers so that the first
//! switch enters `entry(arg)` on a fresh stack) and `switch_context`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{SavedRegs, init_context, switch_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{SavedRegs, init_context, switch_context};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Entry point invoked on a new stack with the argument given to `init_context`
pub type EntryFn = extern "C" fn(usize) -> !;
