//! Test helper utilities and common functionality.

use crate::config::RuntimeConfig;
use crate::kernel::{self, RuntimeStats};
use crate::thread::ExitValue;
use core::any::Any;

/// Test environment setup and cleanup.
///
/// Initializes the runtime of the calling OS thread and tears it down when
/// dropped, so a failing test does not leak stacks into the next one.
pub(crate) struct TestEnvironment {
    active: bool,
}

impl TestEnvironment {
    /// Runtime without preemption, for deterministic interleavings.
    pub(crate) fn new() -> Self {
        Self::with_config(RuntimeConfig::cooperative())
    }

    pub(crate) fn with_config(config: RuntimeConfig) -> Self {
        kernel::init(config).expect("Failed to initialize runtime");
        Self { active: true }
    }

    /// Tear the runtime down and return its final counters.
    pub(crate) fn shutdown(mut self) -> RuntimeStats {
        self.active = false;
        kernel::shutdown().expect("Failed to shut down runtime")
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        if self.active {
            let _ = kernel::shutdown();
        }
    }
}

/// Unbox an exit value of a known type.
pub(crate) fn value<T: Any>(exit: ExitValue) -> T {
    *exit.downcast::<T>().expect("Unexpected exit value type")
}

/// Assert that every stack the runtime allocated has been freed.
pub(crate) fn assert_no_stack_leak(stats: &RuntimeStats) {
    assert_eq!(
        stats.stacks.allocated, stats.stacks.freed,
        "stacks leaked: {:?}",
        stats.stacks
    );
}
