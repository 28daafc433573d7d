#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unreachable_pub)]

//! User-level green threads for Unix.
//!
//! This library multiplexes many logical threads onto the OS thread that
//! uses it. Threads switch when they yield, block in a join or on a mutex,
//! exit, or reach a preemption point after their time slice expired.
//!
//! # Target Platform
//!
//! - **Architecture**: x86-64 or AArch64
//! - **Operating system**: Unix (ELF platforms)
//!
//! # Quick Start
//!
//! ```no_run
//! use green_threads::{join, spawn, yield_now};
//!
//! let worker = spawn(|| {
//!     for _ in 0..3 {
//!         yield_now();
//!     }
//!     42u32
//! })
//! .unwrap();
//!
//! let value = join(worker).unwrap();
//! assert_eq!(value.downcast_ref::<u32>(), Some(&42));
//! ```
//!
//! # Architecture
//!
//! The library is organized around several key abstractions:
//! - Callee-saved register context switching per architecture
//! - A registry of thread control blocks and a round-robin scheduler
//! - Quantum expiry from a SIGPROF interval timer or a monotonic deadline,
//!   acted on at preemption points
//! - Pooled, canary-checked thread stacks freed exactly once
//!
//! Each OS thread has its own runtime, created lazily from
//! [`RuntimeConfig::from_env`] or explicitly with [`init`]. Diagnostics go
//! through the [`log`] facade; install any logger to see them.

pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod mem;
pub mod platform_timer;
pub mod sched;
pub mod sync;
pub mod thread;

#[cfg(test)]
mod tests;

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, DefaultArch};

// Configuration
pub use config::{RuntimeConfig, TimerMode};

// Runtime
pub use kernel::{current, exit, init, join, shutdown, stats, thread_info, yield_now, RuntimeStats};

// Scheduler
pub use sched::{RoundRobinScheduler, Scheduler};

// Synchronization
pub use sync::{Mutex, MutexGuard};

// Threads
pub use thread::{ExitValue, ThreadBuilder, ThreadId, ThreadInfo, ThreadState};

// Memory management
pub use mem::{Stack, StackPool, StackStats};

// Errors
pub use errors::{ThreadError, ThreadResult};

// ============================================================================
// Convenience Functions
// ============================================================================

/// Spawn a green thread running `f` on the current OS thread's runtime.
///
/// Equivalent to `ThreadBuilder::new().spawn(f)`.
#[inline]
pub fn spawn<F, T>(f: F) -> ThreadResult<ThreadId>
where
    F: FnOnce() -> T + 'static,
    T: core::any::Any,
{
    ThreadBuilder::new().spawn(f)
}
