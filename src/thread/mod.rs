//! Thread control blocks and thread identity.

use crate::arch::SavedContext;
use crate::mem::Stack;
use core::any::Any;
use core::num::NonZeroU64;

pub mod builder;

pub use builder::ThreadBuilder;

/// Value a thread exits with, handed to its joiner.
pub type ExitValue = Box<dyn Any>;

/// How a thread ended: its exit value, or the payload of a caught panic.
pub(crate) type Outcome = Result<ExitValue, Box<dyn Any + Send>>;

/// Closure a spawned thread runs.
pub(crate) type Entry = Box<dyn FnOnce() -> ExitValue>;

/// Unique identifier for threads.
///
/// Thread IDs are never reused within a runtime and are guaranteed to be
/// non-zero. The OS thread that owns the runtime is [`ThreadId::MAIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadId {
    /// Identifier of the thread that initialized the runtime.
    pub const MAIN: ThreadId = ThreadId(match NonZeroU64::new(1) {
        Some(id) => id,
        None => unreachable!(),
    });

    /// Rebuild an identifier from its raw value.
    ///
    /// Returns `None` for zero, which is never a valid id.
    pub fn from_raw(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    /// Get the raw ID value.
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Identifier handed out after this one.
    pub(crate) fn successor(self) -> Self {
        ThreadId(self.0.saturating_add(1))
    }
}

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to run
    Ready,
    /// Currently executing; only the thread in the runtime's current slot
    Running,
    /// Blocked on a join or a mutex until explicitly released
    Scheduled,
    /// Exited; the exit value waits for a joiner
    Finished,
    /// Exit value retrieved; memory will be reclaimed
    Terminated,
}

impl ThreadState {
    /// Whether the scheduler may pick a thread in this state.
    pub fn is_runnable(self) -> bool {
        self == ThreadState::Ready
    }
}

/// Snapshot of a thread's scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub state: ThreadState,
    /// Thread this one is blocked on, while joining
    pub waiting_on: Option<ThreadId>,
    pub name: Option<String>,
}

/// Thread control block.
pub struct Tcb {
    pub(crate) id: ThreadId,
    pub(crate) name: Option<String>,
    pub(crate) status: ThreadState,
    pub(crate) context: SavedContext,
    /// Owned stack; `None` for the main thread, which runs on the OS stack
    pub(crate) stack: Option<Stack>,
    pub(crate) entry: Option<Entry>,
    /// Thread this one is joining
    pub(crate) waiting_on: Option<ThreadId>,
    /// Thread registered to receive this one's outcome
    pub(crate) joiner: Option<ThreadId>,
    /// Outcome stored for a joiner that has not arrived yet
    pub(crate) result: Option<Outcome>,
    /// Outcome delivered to this thread as a joiner
    pub(crate) received: Option<Outcome>,
}

impl Tcb {
    /// Control block for the OS thread that owns the runtime.
    pub(crate) fn main() -> Self {
        let mut tcb = Self::blank(ThreadId::MAIN, Some("main".into()));
        tcb.status = ThreadState::Running;
        tcb
    }

    /// Control block for a spawned thread.
    ///
    /// The context still has to be initialized for `stack` before the
    /// thread is scheduled.
    pub(crate) fn spawned(id: ThreadId, name: Option<String>, stack: Stack, entry: Entry) -> Self {
        let mut tcb = Self::blank(id, name);
        tcb.stack = Some(stack);
        tcb.entry = Some(entry);
        tcb
    }

    fn blank(id: ThreadId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            status: ThreadState::Ready,
            context: SavedContext::default(),
            stack: None,
            entry: None,
            waiting_on: None,
            joiner: None,
            result: None,
            received: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.status
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            state: self.status,
            waiting_on: self.waiting_on,
            name: self.name.clone(),
        }
    }

    /// Whether this thread is blocked joining `target`.
    pub(crate) fn is_joining(&self, target: ThreadId) -> bool {
        self.status == ThreadState::Scheduled && self.waiting_on == Some(target)
    }
}

impl core::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("waiting_on", &self.waiting_on)
            .field("joiner", &self.joiner)
            .finish_non_exhaustive()
    }
}
