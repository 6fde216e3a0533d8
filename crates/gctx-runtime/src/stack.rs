//! Context execution stacks
//!
//! A stack is one contiguous region owned by exactly one context. The base is
//! the highest 16-byte aligned address; stacks grow down from it. Offsets
//! (`at`, `peak`) are measured downward from the base.

use crate::memory::{page_round, MmapAllocator, StackPool};
use gctx_core::constants::{MIN_STACK_SIZE, PAGE_SIZE, STACK_ALIGN};
use gctx_core::error::MemoryError;
use gctx_core::StackAllocator;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

enum Memory {
    Buffer(Box<[u8]>),
    Mapped { ptr: NonNull<u8>, alloc: MmapAllocator },
    Pooled { slot: usize, pool: Rc<RefCell<StackPool>> },
}

pub struct Stack {
    mem: Memory,
    bottom: NonNull<u8>,
    size: usize,
    at: Cell<usize>,
    peak: Cell<usize>,
}

impl Stack {
    /// Use a caller-supplied buffer
    pub fn from_buffer(mut buf: Box<[u8]>) -> Result<Self, MemoryError> {
        let size = buf.len();
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::StackTooSmall);
        }
        let bottom = NonNull::new(buf.as_mut_ptr()).ok_or(MemoryError::AllocationFailed)?;
        Ok(Self::with_memory(Memory::Buffer(buf), bottom, size))
    }

    /// Map a dedicated region of at least `size` usable bytes
    pub fn mapped(size: usize, guard: bool) -> Result<Self, MemoryError> {
        let alloc = MmapAllocator::new(guard);
        let size = page_round(size);
        let ptr = alloc.allocate(PAGE_SIZE, size)?;
        Ok(Self::with_memory(Memory::Mapped { ptr, alloc }, ptr, size))
    }

    /// Take a slot from `pool`
    pub fn pooled(pool: &Rc<RefCell<StackPool>>) -> Result<Self, MemoryError> {
        let mut p = pool.borrow_mut();
        let (slot, bottom) = p.acquire()?;
        let size = p.stack_size();
        drop(p);
        Ok(Self::with_memory(Memory::Pooled { slot, pool: Rc::clone(pool) }, bottom, size))
    }

    fn with_memory(mem: Memory, bottom: NonNull<u8>, size: usize) -> Self {
        Self {
            mem,
            bottom,
            size,
            at: Cell::new(0),
            peak: Cell::new(0),
        }
    }

    /// Highest aligned address; the initial stack pointer
    #[inline]
    pub fn base(&self) -> *mut u8 {
        let top = self.bottom.as_ptr() as usize + self.size;
        (top & !(STACK_ALIGN - 1)) as *mut u8
    }

    /// Usable bytes
    #[inline]
    pub fn max(&self) -> usize {
        self.size
    }

    /// Last sampled offset below the base
    #[inline]
    pub fn at(&self) -> usize {
        self.at.get()
    }

    /// Deepest sampled offset
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Offset of `sp` below the base (saturating outside the region)
    #[inline]
    pub fn offset_of(&self, sp: usize) -> usize {
        (self.base() as usize).saturating_sub(sp)
    }

    /// Record a stack pointer sample; returns the offset
    pub fn sample(&self, sp: usize) -> usize {
        let at = self.offset_of(sp);
        self.at.set(at);
        if at > self.peak.get() {
            self.peak.set(at);
        }
        at
    }

    /// Share of the stack in use at the last sample
    pub fn usage_percent(&self) -> u8 {
        ((self.at.get() as u128 * 100) / self.size.max(1) as u128).min(100) as u8
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let lo = self.bottom.as_ptr() as usize;
        addr >= lo && addr < lo + self.size
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.mem, Memory::Pooled { .. })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        match &self.mem {
            Memory::Buffer(_) => {}
            Memory::Mapped { ptr, alloc } => unsafe { alloc.deallocate(*ptr, self.size) },
            Memory::Pooled { slot, pool } => {
                if let Err(e) = pool.borrow_mut().release(*slot) {
                    gctx_core::kwarn!("stack slot {} release failed: {}", slot, e);
                }
            }
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base())
            .field("max", &self.size)
            .field("at", &self.at.get())
            .field("peak", &self.peak.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_stack_base_aligned() {
        let stack = Stack::from_buffer(vec![0u8; MIN_STACK_SIZE + 3].into_boxed_slice()).unwrap();
        assert_eq!(stack.base() as usize % STACK_ALIGN, 0);
        assert!(stack.contains(stack.base() as usize - 1));
        assert_eq!(stack.max(), MIN_STACK_SIZE + 3);
    }

    #[test]
    fn test_buffer_too_small() {
        let err = Stack::from_buffer(vec![0u8; 512].into_boxed_slice()).unwrap_err();
        assert_eq!(err, MemoryError::StackTooSmall);
    }

    #[test]
    fn test_sample_tracks_peak() {
        let stack = Stack::mapped(64 * 1024, true).unwrap();
        let base = stack.base() as usize;
        assert_eq!(stack.sample(base - 100), 100);
        assert_eq!(stack.sample(base - 4000), 4000);
        assert_eq!(stack.sample(base - 200), 200);
        assert_eq!(stack.at(), 200);
        assert_eq!(stack.peak(), 4000);
        assert_eq!(stack.usage_percent(), 0);
    }

    #[test]
    fn test_pooled_returns_slot() {
        let pool = Rc::new(RefCell::new(StackPool::new(2, 32 * 1024).unwrap()));
        let a = Stack::pooled(&pool).unwrap();
        let b = Stack::pooled(&pool).unwrap();
        assert!(a.is_pooled());
        assert_eq!(pool.borrow().in_use(), 2);
        assert!(Stack::pooled(&pool).is_err());
        drop(a);
        drop(b);
        assert_eq!(pool.borrow().in_use(), 0);
    }
}
