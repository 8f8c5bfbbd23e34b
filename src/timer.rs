//! Min-heap of expiring timers, generic over an opaque payload.
//!
//! The scheduler is the only caller; it instantiates `TimerHeap<TimerPayload>`
//! with its own payload enum (see `sched.rs`) so this module stays ignorant of
//! fibers entirely. Armed nodes carry a `(slot index, generation)` handle
//! (`TimerId`) instead of a raw heap position, because cancellation is common
//! and must be cheap: `remove`/`cancel` just flip the slot's state rather than
//! rebalancing the heap. Stale slots accumulate in the `BinaryHeap` until
//! either they reach the front (and get discarded lazily by `fire`/`peek_wait`)
//! or the heap is rebuilt wholesale once enough of them pile up.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};

/// Rebuild the underlying heap once this many stale (disarmed/cancelled)
/// entries have accumulated, so a long-lived heap dominated by cancellations
/// doesn't grow without bound.
const COMPACT_THRESHOLD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32, u32);

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Armed,
    Disarmed,
    Cancelled,
}

struct Slot<P> {
    generation: u32,
    state: State,
    expiry: i64,
    payload: Option<P>,
}

/// A min-heap of `(expiry, payload)` pairs ordered by expiry, with O(1) soft
/// removal.
pub struct TimerHeap<P> {
    heap: BinaryHeap<Reverse<(i64, u32, u32)>>,
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    armed: usize,
    stale: usize,
}

impl<P> TimerHeap<P> {
    pub fn new() -> Self {
        TimerHeap {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            armed: 0,
            stale: 0,
        }
    }

    /// Number of currently armed (not yet fired, not cancelled) timers.
    pub fn armed_len(&self) -> usize {
        self.armed
    }

    /// Arm a new timer expiring at `expiry` (monotonic milliseconds).
    ///
    /// Fails with [`Error::OutOfMemory`] if growing the slot table fails,
    /// rather than letting the allocator abort the process, per this
    /// runtime's policy of surfacing allocation failure as a `Result`.
    pub fn insert(&mut self, expiry: i64, payload: P) -> Result<TimerId> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| Error::OutOfMemory)?;
                self.slots.push(Slot {
                    generation: 0,
                    state: State::Cancelled,
                    expiry: 0,
                    payload: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[idx as usize].generation;
        self.slots[idx as usize] = Slot {
            generation,
            state: State::Armed,
            expiry,
            payload: Some(payload),
        };
        self.heap.push(Reverse((expiry, idx, generation)));
        self.armed += 1;
        Ok(TimerId(idx, generation))
    }

    /// Soft-cancel: the node stays allocated (in case the caller still holds
    /// the `TimerId` and wants to reuse the slot's identity is not actually
    /// needed), the stale heap entry is skipped lazily later. O(1).
    pub fn remove(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if slot.generation == id.1 && slot.state == State::Armed {
                slot.state = State::Disarmed;
                slot.payload = None;
                self.armed -= 1;
                self.bump_stale();
            }
        }
    }

    /// Like [`Self::remove`] but also releases the slot for reuse, bumping
    /// its generation so any stale heap entries referencing it are ignored
    /// even if the slot index gets recycled before they're popped.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if slot.generation == id.1 && slot.state != State::Cancelled {
                let was_armed = slot.state == State::Armed;
                slot.state = State::Cancelled;
                slot.payload = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.0);
                if was_armed {
                    self.armed -= 1;
                }
                self.bump_stale();
            }
        }
    }

    fn bump_stale(&mut self) {
        self.stale += 1;
        if self.stale > COMPACT_THRESHOLD {
            self.compact();
        }
    }

    fn compact(&mut self) {
        self.heap = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == State::Armed)
            .map(|(i, s)| Reverse((s.expiry, i as u32, s.generation)))
            .collect();
        self.stale = 0;
        log::trace!("timer heap compacted, {} armed entries remain", self.heap.len());
    }

    /// Pop and return every armed timer whose expiry is `<= now`, firing them
    /// (their slots are freed as a side effect, same as `cancel`).
    pub fn fire(&mut self, now: i64) -> Vec<P> {
        let mut fired = Vec::new();
        while let Some(&Reverse((expiry, idx, generation))) = self.heap.peek() {
            if expiry > now {
                break;
            }
            self.heap.pop();
            let slot = &mut self.slots[idx as usize];
            if slot.generation != generation || slot.state != State::Armed {
                continue;
            }
            let payload = slot.payload.take().expect("armed slot always carries a payload");
            slot.state = State::Cancelled;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(idx);
            self.armed -= 1;
            fired.push(payload);
        }
        fired
    }

    /// Milliseconds until the earliest armed timer, discarding stale entries
    /// it finds at the top of the heap along the way. `None` if no timer is
    /// armed.
    pub fn next_timeout_ms(&mut self, now: i64) -> Option<i64> {
        loop {
            let &Reverse((expiry, idx, generation)) = self.heap.peek()?;
            let slot = &self.slots[idx as usize];
            if slot.generation != generation || slot.state != State::Armed {
                self.heap.pop();
                continue;
            }
            return Some((expiry - now).max(0));
        }
    }
}

impl<P> Default for TimerHeap<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_expiry_order() {
        let mut heap = TimerHeap::new();
        heap.insert(30, "c").unwrap();
        heap.insert(10, "a").unwrap();
        heap.insert(20, "b").unwrap();
        assert_eq!(heap.fire(15), vec!["a"]);
        assert_eq!(heap.fire(25), vec!["b"]);
        assert_eq!(heap.fire(100), vec!["c"]);
        assert_eq!(heap.armed_len(), 0);
    }

    #[test]
    fn removed_timer_never_fires() {
        let mut heap = TimerHeap::new();
        let id = heap.insert(10, "a").unwrap();
        heap.remove(id);
        assert!(heap.fire(100).is_empty());
    }

    #[test]
    fn cancel_allows_slot_reuse_without_confusing_stale_entries() {
        let mut heap = TimerHeap::new();
        let a = heap.insert(10, "a").unwrap();
        heap.cancel(a);
        let b = heap.insert(10, "b").unwrap();
        assert_eq!(heap.fire(100), vec!["b"]);
    }

    #[test]
    fn next_timeout_skips_stale_entries() {
        let mut heap = TimerHeap::new();
        let a = heap.insert(5, "a").unwrap();
        heap.insert(50, "b").unwrap();
        heap.remove(a);
        assert_eq!(heap.next_timeout_ms(0), Some(50));
    }

    #[test]
    fn compaction_keeps_armed_entries_intact() {
        let mut heap = TimerHeap::new();
        for _ in 0..(COMPACT_THRESHOLD + 10) {
            let id = heap.insert(1000, "noise").unwrap();
            heap.cancel(id);
        }
        let survivor = heap.insert(5, "real").unwrap();
        let _ = survivor;
        assert_eq!(heap.fire(1000), vec!["real"]);
    }
}
