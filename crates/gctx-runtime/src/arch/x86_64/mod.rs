//! x86_64 context switching implementation
//!
//! System V AMD64: rbx, rbp, r12-r15, rsp, the MXCSR control bits and the
//! x87 control word are callee-saved. Everything else is clobbered by the
//! call into `switch_context` so it needs no saving.

use super::EntryFn;
use std::arch::naked_asm;

/// Default MXCSR: all exceptions masked, round to nearest
const MXCSR_DEFAULT: u32 = 0x1F80;
/// Default x87 control word: extended precision, exceptions masked
const FPUCW_DEFAULT: u16 = 0x037F;

/// Saved register file of a suspended context
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedRegs {
    rsp: u64,       // 0x00
    rip: u64,       // 0x08
    rbx: u64,       // 0x10
    rbp: u64,       // 0x18
    r12: u64,       // 0x20
    r13: u64,       // 0x28
    r14: u64,       // 0x30
    r15: u64,       // 0x38
    mxcsr: u32,     // 0x40
    fpucw: u16,     // 0x44
    _pad: u16,
}

impl SavedRegs {
    /// Saved stack pointer (meaningful only while suspended)
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

/// Initialize a new context's registers
///
/// The first switch jumps to the trampoline with a 16-byte aligned stack,
/// which then calls `entry(arg)` with the ABI-mandated alignment.
///
/// # Safety
///
/// `stack_top` must be the upper end of a writable region large enough for
/// `entry` to run on.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs {
        rsp: sp as u64,
        rip: entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        mxcsr: MXCSR_DEFAULT,
        fpucw: FPUCW_DEFAULT,
        ..SavedRegs::default()
    };
}

/// Calls r12(r13) on the fresh stack; the entry never returns
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the running register file into `old` and resume `new`
///
/// Returns when some later switch resumes `old`.
///
/// # Safety
///
/// `new` must hold registers produced by `init_context` or by a previous
/// save into it, and its stack must still be alive.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved state to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}
