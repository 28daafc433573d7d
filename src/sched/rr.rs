//! Round-robin scheduler.

use super::registry::{Registry, Slot};
use super::trait_def::{Pick, Scheduler};
use crate::thread::ThreadState;
use std::collections::VecDeque;

/// Round-robin scheduler.
///
/// Threads sit in a single rotation. Each pass takes the first `Ready`
/// thread from the front and the switched-out thread goes to the back, so
/// among threads that stay Ready each runs once before any runs twice.
/// Blocked and finished threads stay in place and are skipped.
#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    run_order: VecDeque<Slot>,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots in rotation order, front first.
    pub fn order(&self) -> impl Iterator<Item = Slot> + '_ {
        self.run_order.iter().copied()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn enqueue(&mut self, slot: Slot) {
        debug_assert!(!self.run_order.contains(&slot), "slot enqueued twice");
        self.run_order.push_back(slot);
    }

    fn pick_next(&mut self, registry: &mut Registry) -> Pick {
        let mut pick = Pick::default();
        let mut selected = None;
        let mut i = 0;

        while i < self.run_order.len() {
            let slot = self.run_order[i];
            match registry.get(slot).map(|tcb| tcb.state()) {
                Some(ThreadState::Terminated) => {
                    self.run_order.remove(i);
                    if let Some(tcb) = registry.remove(slot) {
                        pick.reclaimed.push(tcb);
                    }
                    continue;
                }
                None => {
                    // Slot emptied behind the scheduler's back.
                    self.run_order.remove(i);
                    continue;
                }
                Some(state) if state.is_runnable() && selected.is_none() => selected = Some(i),
                Some(_) => {}
            }
            i += 1;
        }

        // Removals only happen past `selected`, so the index is still valid.
        pick.next = selected.and_then(|i| self.run_order.remove(i));
        pick
    }

    fn len(&self) -> usize {
        self.run_order.len()
    }

    fn clear(&mut self) {
        self.run_order.clear();
    }
}
