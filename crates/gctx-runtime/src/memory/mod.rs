//! Stack memory
//!
//! Two sources of mapped stacks:
//!
//! - `MmapAllocator`: one mapping per stack, optional guard page below.
//! - `StackPool`: a single reserved region carved into equal slots by a
//!   `SlotBitmap`. Every slot is `[guard | usable]`; the guard stays
//!   `PROT_NONE`, the usable part is committed on acquire and decommitted
//!   on release.
//!
//! Platform-specific implementations handle the virtual memory calls.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("gctx-runtime requires a unix platform");
    }
}

use core::ptr::NonNull;
use gctx_core::constants::{GUARD_SIZE, MIN_STACK_SIZE, PAGE_SIZE};
use gctx_core::error::MemoryError;
use gctx_core::{SlotAllocator, SlotBitmap, StackAllocator};

/// Round `size` up to a whole number of pages
#[inline]
pub fn page_round(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// One mapping per allocation
#[derive(Debug, Clone, Copy)]
pub struct MmapAllocator {
    guard: bool,
}

impl MmapAllocator {
    pub const fn new(guard: bool) -> Self {
        Self { guard }
    }

    #[inline]
    fn guard_len(&self) -> usize {
        if self.guard { GUARD_SIZE } else { 0 }
    }
}

impl Default for MmapAllocator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StackAllocator for MmapAllocator {
    fn allocate(&self, align: usize, size: usize) -> Result<NonNull<u8>, MemoryError> {
        debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::StackTooSmall);
        }

        let guard = self.guard_len();
        let total = page_round(size) + guard;
        let base = map(total, true)?;

        if guard > 0 {
            if let Err(e) = protect_none(base, guard) {
                // Safety: the mapping was created above and never handed out
                let _ = unsafe { unmap(base, total) };
                return Err(e);
            }
        }

        // Safety: guard < total
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(guard)) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let guard = self.guard_len();
        let base = NonNull::new_unchecked(ptr.as_ptr().sub(guard));
        if unmap(base, page_round(size) + guard).is_err() {
            gctx_core::kwarn!("munmap failed for stack at {:p}", ptr.as_ptr());
        }
    }
}

/// Fixed-size stack slots carved out of one reserved region
pub struct StackPool {
    base: NonNull<u8>,
    region_size: usize,
    slot_size: usize,
    stack_size: usize,
    slots: SlotBitmap,
    hint: usize,
}

impl StackPool {
    /// Reserve address space for `slots` stacks of `stack_size` usable bytes
    ///
    /// Nothing is committed until a slot is acquired.
    pub fn new(slots: usize, stack_size: usize) -> Result<Self, MemoryError> {
        if stack_size < MIN_STACK_SIZE {
            return Err(MemoryError::StackTooSmall);
        }
        if slots == 0 {
            return Err(MemoryError::InvalidSlot);
        }

        let stack_size = page_round(stack_size);
        let slot_size = stack_size + GUARD_SIZE;
        let region_size = slots
            .checked_mul(slot_size)
            .ok_or(MemoryError::AllocationFailed)?;
        let base = map(region_size, false)?;

        Ok(Self {
            base,
            region_size,
            slot_size,
            stack_size,
            slots: SlotBitmap::new(slots),
            hint: 0,
        })
    }

    /// Usable bytes of every slot
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.slots.used()
    }

    #[inline]
    pub fn available(&self) -> bool {
        self.slots.available(1)
    }

    /// Lowest usable address of a slot (just above its guard page)
    #[inline]
    fn slot_bottom(&self, slot: usize) -> NonNull<u8> {
        debug_assert!(slot < self.capacity());
        // Safety: slot is in range so the offset stays inside the region
        unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(slot * self.slot_size + GUARD_SIZE))
        }
    }

    /// Claim a slot and commit its usable pages
    ///
    /// Returns the slot index and the lowest usable address.
    pub fn acquire(&mut self) -> Result<(usize, NonNull<u8>), MemoryError> {
        let slot = self
            .slots
            .allocate(1, self.hint)
            .ok_or(MemoryError::PoolExhausted)?;
        let bottom = self.slot_bottom(slot);

        if let Err(e) = commit(bottom, self.stack_size) {
            self.slots.deallocate(slot, 1);
            return Err(e);
        }
        self.hint = slot + 1;
        Ok((slot, bottom))
    }

    /// Return a slot; its pages are dropped and made inaccessible
    pub fn release(&mut self, slot: usize) -> Result<(), MemoryError> {
        if slot >= self.capacity() || !self.slots.is_set(slot) {
            return Err(MemoryError::InvalidSlot);
        }
        let bottom = self.slot_bottom(slot);
        let result = decommit(bottom, self.stack_size)
            .and_then(|()| protect_none(bottom, self.stack_size));
        self.slots.deallocate(slot, 1);
        self.hint = self.hint.min(slot);
        result
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        debug_assert_eq!(self.in_use(), 0, "stack pool dropped with slots in use");
        // Safety: every context using a slot has been reaped
        if unsafe { unmap(self.base, self.region_size) }.is_err() {
            gctx_core::kwarn!("munmap failed for stack pool at {:p}", self.base.as_ptr());
        }
    }
}
