//! Mutex for green threads.
//!
//! A contended [`Mutex::lock`] does not busy-wait across the quantum: after
//! a few immediate retries the caller blocks, leaves the CPU to the
//! scheduler and tries again once an unlock releases it. Unlock releases
//! every blocked thread at once; they race for the lock when they next run.

use crate::errors::{MutexError, ThreadError, ThreadResult};
use crate::kernel::{self, SwitchOutcome};
use crate::thread::ThreadId;
use core::marker::PhantomData;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Acquisition attempts made before blocking.
const SPIN_LIMIT: usize = 4;

/// Owner value meaning "not held".
const NO_OWNER: u64 = 0;

/// Lock for green threads of one runtime.
///
/// The mutex guards no data of its own; pair it with a `Cell`/`RefCell` or
/// use it to order side effects. Blocked threads are recorded by id only,
/// so a mutex never keeps a thread alive. Thread ids are only meaningful
/// inside one runtime, so the mutex is neither `Send` nor `Sync` and stays
/// on the OS thread that created it.
#[derive(Debug)]
pub struct Mutex {
    locked: AtomicBool,
    owner: AtomicU64,
    destroyed: AtomicBool,
    waiters: spin::Mutex<Vec<ThreadId>>,
    /// Threads released by an unlock that have not retried yet
    released: AtomicUsize,
    _runtime_local: PhantomData<*const ()>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    /// Create an unlocked mutex with no waiters.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            destroyed: AtomicBool::new(false),
            waiters: spin::Mutex::new(Vec::new()),
            released: AtomicUsize::new(0),
            _runtime_local: PhantomData,
        }
    }

    fn acquire(&self, me: ThreadId) -> bool {
        if self.locked.swap(true, Ordering::Acquire) {
            return false;
        }
        self.owner.store(me.get(), Ordering::Relaxed);
        true
    }

    fn check_usable(&self) -> ThreadResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(MutexError::Destroyed.into());
        }
        Ok(())
    }

    /// Thread currently holding the lock.
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.owner.load(Ordering::Relaxed))
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Number of blocked threads.
    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Acquire the lock, blocking the running thread while it is held.
    ///
    /// # Errors
    ///
    /// - [`MutexError::Destroyed`] after [`Mutex::destroy`]
    /// - `WouldDeadlock` if the caller already holds the lock, or if it is
    ///   held and no other thread can run to release it
    pub fn lock(&self) -> ThreadResult<()> {
        let me = kernel::current();

        loop {
            self.check_usable()?;
            for _ in 0..SPIN_LIMIT {
                if self.acquire(me) {
                    return Ok(());
                }
                core::hint::spin_loop();
            }
            if self.owner() == Some(me) {
                log::warn!("thread {} tried to relock a mutex it holds", me);
                return Err(ThreadError::would_deadlock());
            }

            kernel::with_runtime(|rt| rt.block_current());
            self.waiters.lock().push(me);

            if kernel::schedule() == SwitchOutcome::Switched {
                // Resumed by an unlock
                let _ = self
                    .released
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            } else {
                self.waiters.lock().retain(|id| *id != me);
                kernel::with_runtime(|rt| rt.unblock_current());
                if self.acquire(me) {
                    return Ok(());
                }
                log::warn!("thread {} would block forever on a mutex", me);
                return Err(ThreadError::would_deadlock());
            }
        }
    }

    /// Acquire the lock if it is free, without blocking.
    ///
    /// Returns `Ok(false)` if another thread holds it.
    pub fn try_lock(&self) -> ThreadResult<bool> {
        self.check_usable()?;
        Ok(self.acquire(kernel::current()))
    }

    /// Release the lock and make every blocked thread Ready.
    ///
    /// # Errors
    ///
    /// - [`MutexError::NotLocked`] if the mutex is not held
    /// - [`MutexError::NotOwner`] if another thread holds it
    pub fn unlock(&self) -> ThreadResult<()> {
        if !self.is_locked() {
            log::warn!("unlock of a mutex that is not locked");
            return Err(MutexError::NotLocked.into());
        }
        let me = kernel::current();
        if self.owner() != Some(me) {
            log::warn!("thread {} unlocked a mutex it does not hold", me);
            return Err(MutexError::NotOwner.into());
        }

        let waiters = core::mem::take(&mut *self.waiters.lock());
        let woken = kernel::with_runtime(|rt| waiters.iter().filter(|id| rt.wake(**id)).count());
        self.released.fetch_add(woken, Ordering::AcqRel);

        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        Ok(())
    }

    /// Retire the mutex.
    ///
    /// Threads released by an unlock still count as waiters until they
    /// have run and retried the lock.
    ///
    /// # Errors
    ///
    /// - [`MutexError::HasWaiters`] while threads are blocked on it
    /// - [`MutexError::Locked`] while held
    pub fn destroy(&self) -> ThreadResult<()> {
        if self.waiting() > 0 || self.released.load(Ordering::Acquire) > 0 {
            return Err(MutexError::HasWaiters.into());
        }
        if self.is_locked() {
            return Err(MutexError::Locked.into());
        }
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }

    /// Acquire the lock and release it when the guard is dropped.
    pub fn guard(&self) -> ThreadResult<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }
}

/// Holds a [`Mutex`] until dropped.
#[derive(Debug)]
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            log::warn!("mutex guard release failed: {}", e);
        }
    }
}
