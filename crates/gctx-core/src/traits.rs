//! Memory contracts consumed by the runtime
//!
//! The runtime only needs an aligned allocate/free pair for stacks and a
//! slot allocator for carving fixed-size stacks out of a reserved region.
//! Platform implementations live in `gctx-runtime::memory`.

use core::ptr::NonNull;
use crate::error::MemoryError;

/// Aligned raw memory for execution stacks
pub trait StackAllocator {
    /// Allocate `size` bytes aligned to `align`
    ///
    /// The returned region is readable and writable.
    fn allocate(&self, align: usize, size: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Release a region returned by `allocate`
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a prior `allocate` on this allocator,
    /// and no code may still be executing on the region.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

/// Fixed-slot allocator
///
/// Positions are slot indexes; `n` is a count of contiguous slots.
pub trait SlotAllocator {
    /// Whether `n` contiguous slots could be allocated right now
    fn available(&self, n: usize) -> bool;

    /// Claim `n` contiguous slots, searching from `hint`
    fn allocate(&mut self, n: usize, hint: usize) -> Option<usize>;

    /// Release `n` slots starting at `pos`
    fn deallocate(&mut self, pos: usize, n: usize);
}
