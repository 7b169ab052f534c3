//! Lock-free single-producer ring buffer of [`EventSlot`]s.
//!
//! Grounded on `cognitod::runtime::sequencer::SequencerConsumer`'s ticket/
//! cursor protocol, adapted from a mmap'd eBPF ring to spec.md §4.3's model:
//! a fixed slot array, a validity flag per slot instead of a ticket number,
//! and a reservation window protected by interrupt-disable rather than an
//! atomic compare-exchange (stub prologues run with interrupts masked, so
//! there is never more than one writer touching `write_pos` at a time).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use atrace_common::{EventSlot, MIN_RING_CAPACITY};
use atrace_platform::InterruptGuard;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring capacity {0} is below the minimum of {MIN_RING_CAPACITY}")]
    CapacityTooSmall(u32),
}

/// Returned by [`Ring::reserve`] when the slot the next reservation would
/// land on is still marked valid: the consumer has fallen behind the
/// producer. The caller counts this and drops the event rather than
/// blocking — spec.md §5 requires producers never to wait on the consumer.
#[derive(Debug, Error)]
#[error("ring is full, consumer has fallen behind")]
pub struct Overflow;

/// A fixed-capacity array of event slots plus producer/consumer cursors.
///
/// `slots` are `UnsafeCell` rather than `Mutex`-guarded because the
/// synchronization discipline is external to the type: the reservation
/// window is single-writer-at-a-time by construction (an [`InterruptGuard`]
/// is held for its duration), and the consumer only ever reads a slot after
/// observing `valid == 1`, which is the producer's last write to that slot.
pub struct Ring {
    slots: Box<[UnsafeCell<EventSlot>]>,
    capacity: u32,
    write_pos: AtomicU32,
    read_pos: AtomicU32,
    overflow: AtomicU32,
}

// SAFETY: see the type's doc comment; access to each slot is serialized by
// the interrupt-disable window (writer) or the valid-flag handoff (reader).
unsafe impl Sync for Ring {}
unsafe impl Send for Ring {}

impl Ring {
    pub fn new(capacity: u32) -> Result<Self, RingError> {
        if capacity < MIN_RING_CAPACITY {
            return Err(RingError::CapacityTooSmall(capacity));
        }
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(EventSlot::zeroed()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            slots,
            capacity,
            write_pos: AtomicU32::new(0),
            read_pos: AtomicU32::new(0),
            overflow: AtomicU32::new(0),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn overflow_count(&self) -> u32 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Snapshot and zero the overflow counter under interrupt-disable —
    /// spec.md §4.4 step 4. Returns the count accumulated since the last
    /// call.
    pub fn take_overflow<G: InterruptGuard>(&self) -> u32 {
        let _guard = G::disable();
        self.overflow.swap(0, Ordering::AcqRel)
    }

    pub fn write_pos(&self) -> u32 {
        self.write_pos.load(Ordering::Acquire)
    }

    pub fn read_pos(&self) -> u32 {
        self.read_pos.load(Ordering::Acquire)
    }

    /// Reserve the next slot for population. Holds `G` (an interrupt-disable
    /// window) for the lifetime of the returned [`ReservedSlot`] — callers
    /// must populate and commit promptly, never suspend while holding one.
    pub fn reserve<G: InterruptGuard>(&self) -> Result<ReservedSlot<'_, G>, Overflow> {
        let guard = G::disable();
        let write = self.write_pos.load(Ordering::Relaxed);
        let index = write % self.capacity;
        // SAFETY: the interrupt-disable window just acquired is the only
        // thing that writes `write_pos`, so no other reservation can be in
        // flight concurrently with this read-modify-write.
        let existing = unsafe { &*self.slots[index as usize].get() };
        if existing.is_valid() {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return Err(Overflow);
        }
        self.write_pos.store(write.wrapping_add(1), Ordering::Release);
        Ok(ReservedSlot {
            ring: self,
            index,
            committed: false,
            _guard: guard,
        })
    }

    /// Read the slot at `index` without consuming it (`index` is taken
    /// modulo capacity so the consumer can track a free-running counter the
    /// way `SequencerConsumer` tracks its cursor).
    pub fn peek(&self, index: u32) -> EventSlot {
        // SAFETY: a `Copy` read race with an in-progress producer write to
        // the same slot is possible only if the consumer reads a slot index
        // the producer hasn't reserved yet, which callers must not do; the
        // normal poll loop only reads indices it has itself observed valid.
        unsafe { *self.slots[(index % self.capacity) as usize].get() }
    }

    /// Mark the slot at `index` empty again, advancing the consumer cursor
    /// past it. Called after the consumer has copied the slot out.
    pub fn release(&self, index: u32) {
        let slot = unsafe { &mut *self.slots[(index % self.capacity) as usize].get() };
        slot.valid = 0;
        self.read_pos.store(index.wrapping_add(1), Ordering::Release);
    }

    /// Force-drain every still-valid slot under one interrupt-disable
    /// window, used once at shutdown (`QUIT`) so a consumer that is slower
    /// than the final burst of patched calls doesn't see slots a producer
    /// is no longer running to hand off. Returns the number of slots this
    /// call cleared, which the caller folds into its consumed-event count.
    pub fn global_disable_drain<G: InterruptGuard>(&self) -> u32 {
        let _guard = G::disable();
        let mut drained = 0u32;
        for cell in self.slots.iter() {
            let slot = unsafe { &mut *cell.get() };
            if slot.is_valid() {
                slot.valid = 0;
                drained += 1;
            }
        }
        self.read_pos.store(self.write_pos.load(Ordering::Relaxed), Ordering::Release);
        drained
    }
}

/// An in-flight reservation. Populate it via [`ReservedSlot::slot_mut`] then
/// call [`ReservedSlot::commit`]; dropping without committing marks the slot
/// abandoned (`valid = 0`) rather than leaving it half-written and flagged
/// valid — the safety net for a stub that panics partway through populating.
pub struct ReservedSlot<'a, G: InterruptGuard> {
    ring: &'a Ring,
    index: u32,
    committed: bool,
    _guard: G,
}

impl<'a, G: InterruptGuard> ReservedSlot<'a, G> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn slot_mut(&mut self) -> &mut EventSlot {
        unsafe { &mut *self.ring.slots[self.index as usize].get() }
    }

    /// Stamp the sequence number and publish the slot by setting `valid = 1`.
    /// This is the single write that hands the slot to the consumer.
    pub fn commit(mut self, sequence: u32) {
        let slot = self.slot_mut();
        slot.sequence = sequence;
        slot.valid = 1;
        self.committed = true;
    }
}

impl<'a, G: InterruptGuard> Drop for ReservedSlot<'a, G> {
    fn drop(&mut self) {
        if !self.committed {
            let slot = unsafe { &mut *self.ring.slots[self.index as usize].get() };
            slot.valid = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrace_platform::sim::SimInterruptGuard;

    #[test]
    fn rejects_capacity_below_minimum() {
        assert!(matches!(Ring::new(4), Err(RingError::CapacityTooSmall(4))));
    }

    #[test]
    fn reserve_commit_peek_release_round_trip() {
        let ring = Ring::new(16).unwrap();
        let mut reserved = ring.reserve::<SimInterruptGuard>().unwrap();
        reserved.slot_mut().lib_id = 1;
        reserved.slot_mut().lvo = -552;
        let index = reserved.index();
        reserved.commit(7);

        let slot = ring.peek(index);
        assert!(slot.is_valid());
        assert_eq!(slot.lib_id, 1);
        assert_eq!(slot.sequence, 7);

        ring.release(index);
        assert!(!ring.peek(index).is_valid());
        assert_eq!(ring.read_pos(), index.wrapping_add(1));
    }

    #[test]
    fn dropping_uncommitted_reservation_abandons_the_slot() {
        let ring = Ring::new(16).unwrap();
        {
            let mut reserved = ring.reserve::<SimInterruptGuard>().unwrap();
            reserved.slot_mut().lib_id = 9;
            // dropped without calling commit()
        }
        assert!(!ring.peek(0).is_valid());
    }

    #[test]
    fn reserve_reports_overflow_when_consumer_has_not_caught_up() {
        let ring = Ring::new(MIN_RING_CAPACITY).unwrap();
        for _ in 0..MIN_RING_CAPACITY {
            ring.reserve::<SimInterruptGuard>().unwrap().commit(0);
        }
        assert!(ring.reserve::<SimInterruptGuard>().is_err());
        assert_eq!(ring.overflow_count(), 1);
    }

    #[test]
    fn take_overflow_snapshots_and_resets() {
        let ring = Ring::new(MIN_RING_CAPACITY).unwrap();
        for _ in 0..MIN_RING_CAPACITY {
            ring.reserve::<SimInterruptGuard>().unwrap().commit(0);
        }
        assert!(ring.reserve::<SimInterruptGuard>().is_err());
        assert_eq!(ring.take_overflow::<SimInterruptGuard>(), 1);
        assert_eq!(ring.overflow_count(), 0);
    }

    #[test]
    fn global_disable_drain_clears_outstanding_slots_and_counts_them() {
        let ring = Ring::new(16).unwrap();
        ring.reserve::<SimInterruptGuard>().unwrap().commit(0);
        ring.reserve::<SimInterruptGuard>().unwrap().commit(1);
        let drained = ring.global_disable_drain::<SimInterruptGuard>();
        assert_eq!(drained, 2);
        assert!(!ring.peek(0).is_valid());
        assert!(!ring.peek(1).is_valid());
    }
}
