//! aarch64 context switching implementation
//!
//! AAPCS64: x19-x29, the link register, sp and the low halves of v8-v15
//! (d8-d15) are callee-saved.

use super::EntryFn;
use std::arch::naked_asm;

/// Saved register file of a suspended context
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedRegs {
    sp: u64,        // 0x00
    lr: u64,        // 0x08
    x19_x29: [u64; 11], // 0x10..0x68
    d8_d15: [u64; 8],   // 0x68..0xA8
}

impl SavedRegs {
    /// Saved stack pointer (meaningful only while suspended)
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Initialize a new context's registers
///
/// # Safety
///
/// `stack_top` must be the upper end of a writable region large enough for
/// `entry` to run on.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let mut saved = SavedRegs {
        sp: ((stack_top as usize) & !0xF) as u64,
        lr: entry_trampoline as usize as u64,
        ..SavedRegs::default()
    };
    saved.x19_x29[0] = entry as usize as u64; // x19
    saved.x19_x29[1] = arg as u64;            // x20
    *regs = saved;
}

/// Calls x19(x20) on the fresh stack; the entry never returns
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x29, xzr",
        "mov x0, x20",
        "blr x19",
        "brk #0",
    );
}

/// Save the running register file into `old` and resume `new`
///
/// # Safety
///
/// `new` must hold registers produced by `init_context` or by a previous
/// save into it, and its stack must still be alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save to old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(std::mem::size_of::<SavedRegs>(), 0xA8);
        assert_eq!(std::mem::offset_of!(SavedRegs, d8_d15), 0x68);
    }
}
