//! Unix memory implementation using mmap
//!
//! Thin wrappers over mmap/mprotect/madvise/munmap returning `MemoryError`.

use core::ptr::NonNull;
use gctx_core::error::MemoryError;

/// Map a fresh anonymous region
///
/// `writable == false` reserves address space only (PROT_NONE, no swap
/// reservation) for later `commit`.
pub fn map(size: usize, writable: bool) -> Result<NonNull<u8>, MemoryError> {
    let (prot, extra) = if writable {
        (libc::PROT_READ | libc::PROT_WRITE, 0)
    } else {
        (libc::PROT_NONE, libc::MAP_NORESERVE)
    };

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed);
    }
    NonNull::new(base as *mut u8).ok_or(MemoryError::AllocationFailed)
}

/// Make a range readable and writable
pub fn commit(ptr: NonNull<u8>, len: usize) -> Result<(), MemoryError> {
    protect(ptr, len, libc::PROT_READ | libc::PROT_WRITE)
}

/// Make a range inaccessible (guard page, released slot)
pub fn protect_none(ptr: NonNull<u8>, len: usize) -> Result<(), MemoryError> {
    protect(ptr, len, libc::PROT_NONE)
}

fn protect(ptr: NonNull<u8>, len: usize, prot: libc::c_int) -> Result<(), MemoryError> {
    let ret = unsafe { libc::mprotect(ptr.as_ptr() as *mut libc::c_void, len, prot) };
    if ret != 0 {
        return Err(MemoryError::ProtectionFailed);
    }
    Ok(())
}

/// Tell the kernel the physical pages of a range are no longer needed
pub fn decommit(ptr: NonNull<u8>, len: usize) -> Result<(), MemoryError> {
    let ret = unsafe {
        libc::madvise(ptr.as_ptr() as *mut libc::c_void, len, libc::MADV_DONTNEED)
    };
    if ret != 0 {
        return Err(MemoryError::AdviseFailed);
    }
    Ok(())
}

/// Unmap a region returned by `map`
///
/// # Safety
///
/// Nothing may reference the range afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), MemoryError> {
    if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
        return Err(MemoryError::AllocationFailed);
    }
    Ok(())
}
