//! Slot table and work queue for the worker pool.
//!
//! Pure bookkeeping: callers pass the current `Instant` in, so every transition
//! is deterministic and can be exercised without spawning workers. The
//! scheduler in [`crate::scheduler`] drives this state from the coordinator
//! thread only.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::core::protocol::SlotId;
use crate::core::types::ProgressReport;

/// Liveness of one pool position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy { path: PathBuf },
    Dead,
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    /// Bumped each time the slot's worker is replaced.
    pub generation: u64,
    pub state: SlotState,
    pub last_activity: Option<Instant>,
}

/// A path bound to a slot by [`PoolState::next_dispatches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub slot: SlotId,
    pub generation: u64,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct PoolState {
    queue: VecDeque<PathBuf>,
    slots: Vec<Slot>,
    total: usize,
    processed: usize,
    abandoned: Vec<PathBuf>,
}

impl PoolState {
    pub fn new(slot_count: usize, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let queue: VecDeque<PathBuf> = paths.into_iter().collect();
        let slots = (0..slot_count)
            .map(|id| Slot {
                id,
                generation: 0,
                state: SlotState::Idle,
                last_activity: None,
            })
            .collect();
        Self {
            total: queue.len(),
            queue,
            slots,
            processed: 0,
            abandoned: Vec::new(),
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn idle_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Idle)
            .count()
    }

    /// Slots that are not dead.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != SlotState::Dead)
            .count()
    }

    pub fn abandoned(&self) -> &[PathBuf] {
        &self.abandoned
    }

    /// Bind queued paths to idle slots until either runs out.
    ///
    /// A popped path that finds no idle slot goes back to the front of the
    /// queue so dispatch order follows submission order.
    pub fn next_dispatches(&mut self, now: Instant) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();
        while let Some(path) = self.queue.pop_front() {
            let Some(slot) = self
                .slots
                .iter_mut()
                .find(|slot| slot.state == SlotState::Idle)
            else {
                self.queue.push_front(path);
                break;
            };
            slot.state = SlotState::Busy { path: path.clone() };
            slot.last_activity = Some(now);
            dispatched.push(Dispatch {
                slot: slot.id,
                generation: slot.generation,
                path,
            });
        }
        dispatched
    }

    /// Whether a message from `(slot, generation)` belongs to the current worker.
    pub fn is_current(&self, slot: SlotId, generation: u64) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| s.generation == generation && s.state != SlotState::Dead)
    }

    /// Record activity on a busy slot. Returns `false` for stale senders.
    pub fn touch(&mut self, slot: SlotId, generation: u64, now: Instant) -> bool {
        if !self.is_current(slot, generation) {
            return false;
        }
        let entry = &mut self.slots[slot];
        if !matches!(entry.state, SlotState::Busy { .. }) {
            return false;
        }
        entry.last_activity = Some(now);
        true
    }

    /// Conclude the job on a busy slot (Busy → Idle) and count it processed.
    ///
    /// Returns the concluded path, or `None` when the sender is stale or the
    /// slot was not busy.
    pub fn release(&mut self, slot: SlotId, generation: u64) -> Option<PathBuf> {
        if !self.is_current(slot, generation) {
            return None;
        }
        let entry = &mut self.slots[slot];
        match std::mem::replace(&mut entry.state, SlotState::Idle) {
            SlotState::Busy { path } => {
                self.processed += 1;
                Some(path)
            }
            other => {
                entry.state = other;
                None
            }
        }
    }

    /// Busy slots with no activity for longer than `threshold`.
    pub fn hung_slots(&self, now: Instant, threshold: Duration) -> Vec<SlotId> {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Busy { .. }))
            .filter(|slot| {
                slot.last_activity
                    .is_some_and(|at| now.saturating_duration_since(at) > threshold)
            })
            .map(|slot| slot.id)
            .collect()
    }

    /// Mark a busy slot dead and give up on its in-flight path.
    ///
    /// The path is never re-queued and never counted as processed.
    pub fn abandon(&mut self, slot: SlotId) -> Option<PathBuf> {
        let entry = self.slots.get_mut(slot)?;
        match std::mem::replace(&mut entry.state, SlotState::Dead) {
            SlotState::Busy { path } => {
                entry.last_activity = None;
                self.abandoned.push(path.clone());
                Some(path)
            }
            other => {
                entry.state = other;
                None
            }
        }
    }

    /// Mark a busy slot dead and put its path back at the front of the queue.
    ///
    /// For a dispatch that never reached its worker.
    pub fn requeue(&mut self, slot: SlotId) -> Option<PathBuf> {
        let entry = self.slots.get_mut(slot)?;
        match std::mem::replace(&mut entry.state, SlotState::Dead) {
            SlotState::Busy { path } => {
                entry.last_activity = None;
                self.queue.push_front(path.clone());
                Some(path)
            }
            other => {
                entry.state = other;
                None
            }
        }
    }

    /// Bring a dead slot back as idle under a new generation.
    pub fn revive(&mut self, slot: SlotId) -> Option<u64> {
        let entry = self.slots.get_mut(slot)?;
        if entry.state != SlotState::Dead {
            return None;
        }
        entry.generation += 1;
        entry.state = SlotState::Idle;
        entry.last_activity = None;
        Some(entry.generation)
    }

    /// Take an idle slot out of the pool for good, e.g. when its replacement
    /// worker could not be started.
    pub fn retire(&mut self, slot: SlotId) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.state == SlotState::Idle => {
                entry.state = SlotState::Dead;
                entry.last_activity = None;
                true
            }
            _ => false,
        }
    }

    /// Drop everything still queued when no live slot is left to run it.
    pub fn abandon_queue(&mut self) -> Vec<PathBuf> {
        let drained: Vec<PathBuf> = self.queue.drain(..).collect();
        self.abandoned.extend(drained.iter().cloned());
        drained
    }

    /// Queue drained and nothing in flight.
    pub fn is_finished(&self) -> bool {
        self.queue.is_empty()
            && self
                .slots
                .iter()
                .all(|slot| !matches!(slot.state, SlotState::Busy { .. }))
    }

    pub fn progress(&self) -> ProgressReport {
        ProgressReport::new(self.processed, self.total)
    }
}
