//! Stack pool allocator for thread stacks.
//!
//! Every spawned thread owns one [`Stack`]. Stacks are freed by `Drop`, so
//! a stack region is released exactly once no matter which path (thread
//! reclamation, pool eviction, runtime teardown) lets go of it. Released
//! stacks are cached up to a configurable limit and handed out again.

use portable_atomic::{AtomicUsize, Ordering};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::errors::{MemoryError, ThreadResult};

/// Alignment of every stack region.
const STACK_ALIGN: usize = 4096;

/// Value written at the lowest address of each stack.
pub const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Allocation counters shared between a pool and the stacks it created.
#[derive(Debug, Default)]
pub struct StackCounters {
    /// Number of stack regions allocated
    allocated: AtomicUsize,
    /// Number of stack regions returned to the allocator
    freed: AtomicUsize,
    /// Number of allocations served from the cache
    reused: AtomicUsize,
}

/// Snapshot of [`StackCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    pub allocated: usize,
    pub freed: usize,
    pub reused: usize,
}

impl StackCounters {
    pub fn snapshot(&self) -> StackStats {
        StackStats {
            allocated: self.allocated.load(Ordering::Acquire),
            freed: self.freed.load(Ordering::Acquire),
            reused: self.reused.load(Ordering::Acquire),
        }
    }
}

/// An owned, page-aligned stack region.
pub struct Stack {
    /// Lowest address of the region
    memory: NonNull<u8>,
    /// Region size in bytes
    size: usize,
    counters: Arc<StackCounters>,
}

impl Stack {
    /// Get the stack size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Highest usable address, aligned down to 16 bytes.
    ///
    /// Stacks grow downwards, so this is the initial stack pointer.
    pub fn stack_top(&self) -> *mut u8 {
        let top = self.memory.as_ptr() as usize + self.size;
        (top & !0xF) as *mut u8
    }

    /// Lowest address of the region.
    pub fn stack_limit(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    /// Write the canary at the lowest address of the stack.
    pub fn install_canary(&self) {
        let canary_location = self.memory.as_ptr() as *mut u64;
        // SAFETY: the region is at least MIN_STACK_SIZE bytes and 4096-aligned.
        unsafe { canary_location.write(STACK_CANARY) };
    }

    /// Check whether the canary survived.
    ///
    /// A clobbered canary means the thread ran past the end of its stack.
    pub fn check_canary(&self) -> bool {
        let canary_location = self.memory.as_ptr() as *const u64;
        // SAFETY: see `install_canary`.
        unsafe { canary_location.read() == STACK_CANARY }
    }

    fn layout(size: usize) -> Result<Layout, MemoryError> {
        Layout::from_size_align(size, STACK_ALIGN).map_err(|_| MemoryError::InvalidLayout(size))
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.size) {
            // SAFETY: `memory` came from `alloc` with this exact layout and
            // `Stack` is neither `Clone` nor `Copy`.
            unsafe { dealloc(self.memory.as_ptr(), layout) };
            self.counters.freed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.memory)
            .field("size", &self.size)
            .finish()
    }
}

/// Pool of equally sized thread stacks.
pub struct StackPool {
    stack_size: usize,
    capacity: usize,
    free_stacks: Vec<Stack>,
    counters: Arc<StackCounters>,
}

impl StackPool {
    /// Create a pool handing out stacks of `stack_size` bytes and caching at
    /// most `capacity` released stacks.
    pub fn new(stack_size: usize, capacity: usize) -> Self {
        Self {
            stack_size,
            capacity,
            free_stacks: Vec::with_capacity(capacity),
            counters: Arc::new(StackCounters::default()),
        }
    }

    /// Allocate a stack, reusing a cached one when available.
    ///
    /// Running out of memory is fatal: the process aborts through
    /// [`handle_alloc_error`].
    pub fn allocate(&mut self) -> ThreadResult<Stack> {
        if let Some(stack) = self.free_stacks.pop() {
            self.counters.reused.fetch_add(1, Ordering::AcqRel);
            stack.install_canary();
            return Ok(stack);
        }

        let layout = Stack::layout(self.stack_size)?;
        // SAFETY: layout has a non-zero size (validated by RuntimeConfig).
        let memory = unsafe { alloc(layout) };
        let memory = match NonNull::new(memory) {
            Some(memory) => memory,
            None => handle_alloc_error(layout),
        };

        self.counters.allocated.fetch_add(1, Ordering::AcqRel);
        let stack = Stack {
            memory,
            size: self.stack_size,
            counters: Arc::clone(&self.counters),
        };
        stack.install_canary();
        Ok(stack)
    }

    /// Return a stack to the pool for reuse.
    ///
    /// The stack is freed instead when the cache is full.
    pub fn release(&mut self, stack: Stack) {
        if !stack.check_canary() {
            log::warn!(
                "stack at {:p} overflowed its {} bytes; discarding it",
                stack.stack_limit(),
                stack.size()
            );
            return;
        }
        if self.free_stacks.len() < self.capacity && stack.size() == self.stack_size {
            self.free_stacks.push(stack);
        }
    }

    /// Number of cached stacks.
    #[cfg(test)]
    fn cached(&self) -> usize {
        self.free_stacks.len()
    }

    /// Shared counters, valid after the pool is dropped.
    pub fn counters(&self) -> Arc<StackCounters> {
        Arc::clone(&self.counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_STACK_SIZE;

    #[test]
    fn test_stack_pool_basic() {
        let mut pool = StackPool::new(MIN_STACK_SIZE, 4);
        let stack = pool.allocate().unwrap();

        assert_eq!(stack.size(), MIN_STACK_SIZE);
        assert_eq!(stack.stack_top() as usize % 16, 0);
        assert!(stack.stack_top() as usize > stack.stack_limit() as usize);

        pool.release(stack);
        assert_eq!(pool.cached(), 1);

        let again = pool.allocate().unwrap();
        assert_eq!(pool.cached(), 0);
        drop(again);

        let stats = pool.counters().snapshot();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.freed, 1);
    }

    #[test]
    fn test_stack_canary() {
        let mut pool = StackPool::new(MIN_STACK_SIZE, 0);
        let stack = pool.allocate().unwrap();
        assert!(stack.check_canary());

        // SAFETY: overwrite the canary inside the owned region.
        unsafe { (stack.stack_limit() as *mut u64).write(0x1234_5678_9ABC_DEF0) };
        assert!(!stack.check_canary());

        pool.release(stack);
        assert_eq!(pool.cached(), 0);
        assert_eq!(pool.counters().snapshot().freed, 1);
    }

    #[test]
    fn test_counters_outlive_pool() {
        let mut pool = StackPool::new(MIN_STACK_SIZE, 8);
        let stacks: Vec<Stack> = (0..5).map(|_| pool.allocate().unwrap()).collect();
        for stack in stacks {
            pool.release(stack);
        }
        let counters = pool.counters();
        drop(pool);

        let stats = counters.snapshot();
        assert_eq!(stats.allocated, 5);
        assert_eq!(stats.freed, 5);
    }
}
