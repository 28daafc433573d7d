//! AArch64 (AAPCS64) context switching.

use super::{Arch, ContextEntry};
use core::arch::global_asm;

/// Callee-saved register state of a suspended thread.
///
/// Field offsets are hard-coded in the switch routine below.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Aarch64Context {
    pub sp: u64,
    /// x19-x28
    pub x: [u64; 10],
    /// Frame pointer
    pub x29: u64,
    /// Link register; the resume address
    pub x30: u64,
    /// Low halves of v8-v15
    pub d: [u64; 8],
    /// Floating-point control register (rounding mode)
    pub fpcr: u64,
}

// x0 = prev, x1 = next. `ret` branches to the restored x30.
global_asm!(
    ".text",
    ".global green_threads_context_switch",
    ".p2align 4",
    "green_threads_context_switch:",
    "mov x9, sp",
    "str x9, [x0, #0]",
    "stp x19, x20, [x0, #8]",
    "stp x21, x22, [x0, #24]",
    "stp x23, x24, [x0, #40]",
    "stp x25, x26, [x0, #56]",
    "stp x27, x28, [x0, #72]",
    "stp x29, x30, [x0, #88]",
    "stp d8, d9, [x0, #104]",
    "stp d10, d11, [x0, #120]",
    "stp d12, d13, [x0, #136]",
    "stp d14, d15, [x0, #152]",
    "mrs x9, fpcr",
    "str x9, [x0, #168]",
    "ldr x9, [x1, #0]",
    "mov sp, x9",
    "ldp x19, x20, [x1, #8]",
    "ldp x21, x22, [x1, #24]",
    "ldp x23, x24, [x1, #40]",
    "ldp x25, x26, [x1, #56]",
    "ldp x27, x28, [x1, #72]",
    "ldp x29, x30, [x1, #88]",
    "ldp d8, d9, [x1, #104]",
    "ldp d10, d11, [x1, #120]",
    "ldp d12, d13, [x1, #136]",
    "ldp d14, d15, [x1, #152]",
    "ldr x9, [x1, #168]",
    "msr fpcr, x9",
    "ret",
);

extern "C" {
    fn green_threads_context_switch(prev: *mut Aarch64Context, next: *const Aarch64Context);
}

/// AArch64 architecture implementation.
pub struct Aarch64Arch;

impl Arch for Aarch64Arch {
    type SavedContext = Aarch64Context;

    #[inline]
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext) {
        unsafe { green_threads_context_switch(prev, next) }
    }

    unsafe fn init_context(ctx: &mut Self::SavedContext, stack_top: *mut u8, entry: ContextEntry) {
        // A zero frame pointer terminates frame-pointer walks at the entry.
        *ctx = Aarch64Context {
            sp: stack_top as u64,
            x29: 0,
            x30: entry as usize as u64,
            ..Aarch64Context::default()
        };
    }
}
