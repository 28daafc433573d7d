//! Arena of thread control blocks.
//!
//! TCBs live in a vector of slots addressed by a stable [`Slot`] index.
//! Scheduler structures refer to threads by slot, outside code by
//! [`ThreadId`]; the registry maps one to the other.

use crate::errors::{ThreadError, ThreadResult};
use crate::thread::{Tcb, ThreadId};
use std::collections::BTreeMap;

/// Stable index of a TCB inside the [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(usize);

impl Slot {
    pub fn index(self) -> usize {
        self.0
    }
}

/// The set of all live TCBs.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Tcb>>,
    free: Vec<Slot>,
    by_id: BTreeMap<ThreadId, Slot>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a TCB and return its slot.
    ///
    /// # Panics
    ///
    /// Panics if a TCB with the same id is already registered.
    pub fn insert(&mut self, tcb: Tcb) -> Slot {
        assert!(
            !self.by_id.contains_key(&tcb.id),
            "thread {} registered twice",
            tcb.id
        );

        let id = tcb.id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot.0] = Some(tcb);
                slot
            }
            None => {
                self.slots.push(Some(tcb));
                Slot(self.slots.len() - 1)
            }
        };
        self.by_id.insert(id, slot);
        slot
    }

    /// Remove a TCB, freeing its slot for reuse.
    pub fn remove(&mut self, slot: Slot) -> Option<Tcb> {
        let tcb = self.slots.get_mut(slot.0)?.take()?;
        self.by_id.remove(&tcb.id);
        self.free.push(slot);
        Some(tcb)
    }

    pub fn get(&self, slot: Slot) -> Option<&Tcb> {
        self.slots.get(slot.0)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut Tcb> {
        self.slots.get_mut(slot.0)?.as_mut()
    }

    /// Find the slot of a live thread.
    pub fn lookup(&self, id: ThreadId) -> ThreadResult<Slot> {
        self.by_id.get(&id).copied().ok_or(ThreadError::NotFound(id))
    }

    pub fn tcb(&self, id: ThreadId) -> ThreadResult<&Tcb> {
        let slot = self.lookup(id)?;
        self.get(slot).ok_or(ThreadError::NotFound(id))
    }

    pub fn tcb_mut(&mut self, id: ThreadId) -> ThreadResult<&mut Tcb> {
        let slot = self.lookup(id)?;
        self.get_mut(slot).ok_or(ThreadError::NotFound(id))
    }

    /// Mutable access to two distinct TCBs at once.
    pub fn pair_mut(&mut self, a: Slot, b: Slot) -> Option<(&mut Tcb, &mut Tcb)> {
        if a == b {
            return None;
        }
        let (low, high, swapped) = if a.0 < b.0 { (a.0, b.0, false) } else { (b.0, a.0, true) };
        if high >= self.slots.len() {
            return None;
        }
        let (head, tail) = self.slots.split_at_mut(high);
        let first = head[low].as_mut()?;
        let second = tail[0].as_mut()?;
        if swapped {
            Some((second, first))
        } else {
            Some((first, second))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tcb> {
        self.slots.iter_mut().flatten()
    }

    /// Remove every TCB.
    pub fn drain(&mut self) -> Vec<Tcb> {
        self.by_id.clear();
        self.free.clear();
        self.slots.drain(..).flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
