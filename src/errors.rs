//! Error handling for the green thread runtime.
//!
//! Every fallible runtime operation returns a [`ThreadResult`]. Errors are
//! grouped by the subsystem that produced them, with `From` conversions so
//! `?` works across subsystems.

#![allow(clippy::uninlined_format_args)]

use crate::thread::ThreadId;
use core::fmt;

/// Result type for threading operations.
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Error type for all runtime operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// Thread creation errors
    Spawn(SpawnError),
    /// Thread joining errors
    Join(JoinError),
    /// Mutex state errors
    Mutex(MutexError),
    /// Stack memory errors
    Memory(MemoryError),
    /// Preemption timer errors
    Timer(TimerError),
    /// Operation rejected in the current runtime state
    InvalidOperation(InvalidOperationError),
    /// No live thread carries this identifier
    NotFound(ThreadId),
}

/// Errors that can occur during thread creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// Configured stack size is below the supported minimum
    InvalidStackSize(usize),
}

/// Errors that can occur during thread joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// Thread already has a joiner, or its value was already retrieved
    AlreadyJoined,
    /// Thread panicked during execution
    ThreadPanicked,
}

/// Errors reported by [`crate::sync::Mutex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutexError {
    /// The mutex is held by a thread
    Locked,
    /// Threads are queued on the mutex
    HasWaiters,
    /// Unlock called on an unlocked mutex
    NotLocked,
    /// Unlock called by a thread that does not hold the mutex
    NotOwner,
    /// The mutex has been destroyed
    Destroyed,
}

/// Stack memory errors.
///
/// Running out of memory is not represented here: a failed stack
/// allocation aborts the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// No valid layout exists for the requested stack size
    InvalidLayout(usize),
}

/// Preemption timer errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// `sigaction` or `setitimer` failed with the given errno
    InstallFailed(i32),
    /// Quantum is zero or not representable by the interval timer
    InvalidQuantum,
}

/// Invalid operation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidOperationError {
    /// Blocking would leave no runnable thread
    WouldDeadlock,
    /// Operation must be called from the thread that initialized the runtime
    WrongThread,
    /// The runtime for this OS thread already exists
    AlreadyInitialized,
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::Spawn(e) => write!(f, "Thread spawn error: {}", e),
            ThreadError::Join(e) => write!(f, "Thread join error: {}", e),
            ThreadError::Mutex(e) => write!(f, "Mutex error: {}", e),
            ThreadError::Memory(e) => write!(f, "Memory error: {}", e),
            ThreadError::Timer(e) => write!(f, "Timer error: {}", e),
            ThreadError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            ThreadError::NotFound(id) => write!(f, "No thread with id {}", id),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::InvalidStackSize(size) => write!(f, "Invalid stack size: {}", size),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::AlreadyJoined => write!(f, "Thread has already been joined"),
            JoinError::ThreadPanicked => write!(f, "Thread panicked during execution"),
        }
    }
}

impl fmt::Display for MutexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutexError::Locked => write!(f, "Mutex is locked"),
            MutexError::HasWaiters => write!(f, "Mutex has waiting threads"),
            MutexError::NotLocked => write!(f, "Mutex is not locked"),
            MutexError::NotOwner => write!(f, "Mutex is held by another thread"),
            MutexError::Destroyed => write!(f, "Mutex has been destroyed"),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::InvalidLayout(size) => write!(f, "Invalid stack layout for {} bytes", size),
        }
    }
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::InstallFailed(errno) => write!(f, "Failed to install timer (errno {})", errno),
            TimerError::InvalidQuantum => write!(f, "Invalid timer quantum"),
        }
    }
}

impl fmt::Display for InvalidOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidOperationError::WouldDeadlock => write!(f, "Operation would cause deadlock"),
            InvalidOperationError::WrongThread => write!(f, "Operation called on wrong thread"),
            InvalidOperationError::AlreadyInitialized => write!(f, "Runtime already initialized"),
        }
    }
}

impl std::error::Error for ThreadError {}

impl From<SpawnError> for ThreadError {
    fn from(error: SpawnError) -> Self {
        ThreadError::Spawn(error)
    }
}

impl From<JoinError> for ThreadError {
    fn from(error: JoinError) -> Self {
        ThreadError::Join(error)
    }
}

impl From<MutexError> for ThreadError {
    fn from(error: MutexError) -> Self {
        ThreadError::Mutex(error)
    }
}

impl From<MemoryError> for ThreadError {
    fn from(error: MemoryError) -> Self {
        ThreadError::Memory(error)
    }
}

impl From<TimerError> for ThreadError {
    fn from(error: TimerError) -> Self {
        ThreadError::Timer(error)
    }
}

impl From<InvalidOperationError> for ThreadError {
    fn from(error: InvalidOperationError) -> Self {
        ThreadError::InvalidOperation(error)
    }
}

impl ThreadError {
    /// Create a deadlock error.
    pub fn would_deadlock() -> Self {
        ThreadError::InvalidOperation(InvalidOperationError::WouldDeadlock)
    }

    /// Whether this error reports an unknown thread id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ThreadError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let id = ThreadId::from_raw(9999).unwrap();
        assert_eq!(ThreadError::NotFound(id).to_string(), "No thread with id 9999");
        assert_eq!(
            ThreadError::from(JoinError::AlreadyJoined).to_string(),
            "Thread join error: Thread has already been joined"
        );
        assert_eq!(
            ThreadError::from(MutexError::HasWaiters).to_string(),
            "Mutex error: Mutex has waiting threads"
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            ThreadError::from(InvalidOperationError::WouldDeadlock),
            ThreadError::would_deadlock()
        );
        assert!(ThreadError::NotFound(ThreadId::from_raw(3).unwrap()).is_not_found());
        assert!(!ThreadError::from(TimerError::InvalidQuantum).is_not_found());
    }
}
