//! x86-64 (System V) context switching.

use super::{Arch, ContextEntry};
use core::arch::global_asm;

/// MXCSR at process start: all exceptions masked, round to nearest.
pub const MXCSR_DEFAULT: u32 = 0x1F80;
/// x87 control word at process start: extended precision, round to nearest.
pub const FPU_CW_DEFAULT: u16 = 0x037F;

/// Callee-saved register state of a suspended thread.
///
/// Includes the SSE and x87 control words, which the System V ABI also
/// treats as callee-saved. Field offsets are hard-coded in the switch
/// routine below.
#[repr(C)]
#[derive(Debug)]
pub struct X86_64Context {
    pub rsp: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub mxcsr: u32,
    pub fpu_cw: u16,
}

impl Default for X86_64Context {
    fn default() -> Self {
        Self {
            rsp: 0,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            mxcsr: MXCSR_DEFAULT,
            fpu_cw: FPU_CW_DEFAULT,
        }
    }
}

// rdi = prev, rsi = next. The return address pushed by the call stays on
// the saved stack, so `ret` resumes the restored thread right after its own
// call to this routine (or at its entry point, see `init_context`).
global_asm!(
    ".text",
    ".global green_threads_context_switch",
    ".p2align 4",
    "green_threads_context_switch:",
    "mov [rdi + 0x00], rsp",
    "mov [rdi + 0x08], r15",
    "mov [rdi + 0x10], r14",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r12",
    "mov [rdi + 0x28], rbx",
    "mov [rdi + 0x30], rbp",
    "stmxcsr dword ptr [rdi + 0x38]",
    "fnstcw word ptr [rdi + 0x3c]",
    "mov rsp, [rsi + 0x00]",
    "mov r15, [rsi + 0x08]",
    "mov r14, [rsi + 0x10]",
    "mov r13, [rsi + 0x18]",
    "mov r12, [rsi + 0x20]",
    "mov rbx, [rsi + 0x28]",
    "mov rbp, [rsi + 0x30]",
    "ldmxcsr dword ptr [rsi + 0x38]",
    "fldcw word ptr [rsi + 0x3c]",
    "ret",
);

extern "C" {
    fn green_threads_context_switch(prev: *mut X86_64Context, next: *const X86_64Context);
}

/// x86-64 architecture implementation.
pub struct X86_64Arch;

impl Arch for X86_64Arch {
    type SavedContext = X86_64Context;

    #[inline]
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext) {
        unsafe { green_threads_context_switch(prev, next) }
    }

    unsafe fn init_context(ctx: &mut Self::SavedContext, stack_top: *mut u8, entry: ContextEntry) {
        // Layout below stack_top:
        //   [top - 8]  0      fake return address, ends backtraces
        //   [top - 16] entry  popped by `ret` in the switch routine
        // After the pop rsp = top - 8, the alignment a callee expects.
        let top = stack_top as *mut u64;
        unsafe {
            top.sub(1).write(0);
            top.sub(2).write(entry as usize as u64);
        }

        *ctx = X86_64Context {
            rsp: top.wrapping_sub(2) as u64,
            ..X86_64Context::default()
        };
    }
}
