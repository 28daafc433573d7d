//! Scheduler trait definition.

use super::registry::{Registry, Slot};
use crate::thread::Tcb;

/// Result of one scheduling pass.
#[derive(Debug, Default)]
pub struct Pick {
    /// Thread selected to run next, already removed from the rotation
    pub next: Option<Slot>,
    /// Terminated threads removed from the registry during the pass
    pub reclaimed: Vec<Tcb>,
}

/// Scheduling policy over the threads of one runtime.
///
/// The scheduler owns the rotation order; the TCBs themselves stay in the
/// [`Registry`]. The running thread is never part of the rotation.
pub trait Scheduler {
    /// Append a thread to the back of the rotation.
    ///
    /// Called for newly created threads and for the previously running
    /// thread after every switch, whatever its state.
    fn enqueue(&mut self, slot: Slot);

    /// Pick the next thread to run.
    ///
    /// Threads in the `Terminated` state met during the pass are removed
    /// from both the rotation and the registry and returned for
    /// reclamation. The selected thread must be `Ready`.
    fn pick_next(&mut self, registry: &mut Registry) -> Pick;

    /// Number of threads in the rotation.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every thread.
    fn clear(&mut self);
}
