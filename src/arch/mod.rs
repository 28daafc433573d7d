//! Architecture abstraction layer for context switching.
//!
//! This module provides a unified interface for the architecture-specific
//! part of the runtime: saving one thread's registers and restoring
//! another's.

/// Entry point of a freshly initialized context.
///
/// The function runs on the new thread's stack and must never return.
pub type ContextEntry = extern "C" fn() -> !;

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations switch stacks with hand-written assembly. All methods
/// marked as unsafe have specific preconditions that must be upheld by the
/// caller.
pub trait Arch {
    /// Architecture-specific saved context type.
    ///
    /// Holds the stack pointer and every callee-saved register; the
    /// caller-saved registers are spilled by the compiler around the call
    /// to [`Arch::context_switch`].
    type SavedContext: Default;

    /// Switch from one thread context to another.
    ///
    /// The current register state is stored into `prev` and execution
    /// continues from the state in `next`. The call returns when some later
    /// switch restores `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` and `next` must point to valid, properly aligned contexts
    /// - `next` must have been filled by a previous switch or by
    ///   [`Arch::init_context`], and its stack must still be alive
    /// - No Rust references derived from scheduler state may be held across
    ///   the call
    unsafe fn context_switch(prev: *mut Self::SavedContext, next: *const Self::SavedContext);

    /// Prepare `ctx` so that switching to it calls `entry` on the stack whose
    /// highest usable address is `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be 16-byte aligned and at least 16 bytes above the
    /// lowest address of a writable region owned by the new thread.
    unsafe fn init_context(ctx: &mut Self::SavedContext, stack_top: *mut u8, entry: ContextEntry);
}

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86_64Arch as DefaultArch;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::Aarch64Arch as DefaultArch;

/// Saved context of the architecture the crate is built for.
pub type SavedContext = <DefaultArch as Arch>::SavedContext;

#[cfg(not(all(
    unix,
    not(target_vendor = "apple"),
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("green-threads supports x86_64 and aarch64 on ELF Unix targets only.");
