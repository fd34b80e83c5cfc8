//! Hazard records.
//!
//! A table keeps a grow-only, singly linked registry of records. An operation
//! claims a free record (or allocates a new one), publishes the nodes it is
//! about to dereference in the record's slots, and releases the record when it
//! is done. Each record also owns the list of nodes its holders have unlinked
//! but not yet reclaimed.
//!
//! Records are only unlinked and freed during teardown, once no operation is
//! in flight.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use tracing::debug;

use crate::alloc::Tracker;
use crate::entry::Entry;
use crate::error::Result;
use crate::reclaim::RetiredList;

/// Hazard slots per record.
pub(crate) const SLOTS: usize = 3;

/// Successor of the node being examined.
pub(crate) const HP_NEXT: usize = 0;
/// Node being examined. Also the slot an [`EntryRef`](crate::EntryRef) keeps.
pub(crate) const HP_CUR: usize = 1;
/// Node whose `next` field the cursor currently points into.
pub(crate) const HP_PREV: usize = 2;

const FREE: u8 = 0;
const IN_USE: u8 = 1;

#[repr(align(128))]
pub(crate) struct HazardRecord<V> {
    slots: [AtomicPtr<Entry<V>>; SLOTS],
    state: AtomicU8,
    next: AtomicPtr<HazardRecord<V>>,
    /// Touched only by the current holder, or by teardown.
    retired: UnsafeCell<RetiredList<V>>,
}

// SAFETY: `retired` is only accessed by the thread holding the record (state
// IN_USE) or by teardown with exclusive access to the registry.
unsafe impl<V: Send + Sync> Send for HazardRecord<V> {}
unsafe impl<V: Send + Sync> Sync for HazardRecord<V> {}

impl<V> HazardRecord<V> {
    fn in_use() -> Self {
        Self {
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; SLOTS],
            state: AtomicU8::new(IN_USE),
            next: AtomicPtr::new(ptr::null_mut()),
            retired: UnsafeCell::new(RetiredList::new()),
        }
    }

    fn try_claim(&self) -> bool {
        self.state.load(Ordering::Relaxed) == FREE
            && self
                .state
                .compare_exchange(FREE, IN_USE, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Clears every slot and hands the record back to the registry.
    pub(crate) fn release(&self) {
        self.clear_all();
        self.state.store(FREE, Ordering::Release);
    }

    /// Publishes `node` in `slot`.
    ///
    /// The store is sequentially consistent: a reclaimer that unlinks the node
    /// afterwards is guaranteed to see it. Callers still have to re-validate
    /// that the node is reachable after publishing.
    #[inline]
    pub(crate) fn protect(&self, slot: usize, node: *mut Entry<V>) {
        self.slots[slot].store(node, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn clear(&self, slot: usize) {
        self.slots[slot].store(ptr::null_mut(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_all(&self) {
        for slot in &self.slots {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Current slot values, null included.
    pub(crate) fn hazards(&self) -> impl Iterator<Item = *mut Entry<V>> + '_ {
        self.slots.iter().map(|slot| slot.load(Ordering::SeqCst))
    }

    /// The record's private retired list.
    ///
    /// # Safety
    ///
    /// The caller must hold the record, or have exclusive access to the
    /// registry, and must not let the reference outlive that access.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn retired(&self) -> &mut RetiredList<V> {
        // SAFETY: exclusivity guaranteed by the caller
        unsafe { &mut *self.retired.get() }
    }
}

/// Grow-only registry of hazard records.
pub(crate) struct HazardRegistry<V> {
    head: AtomicPtr<HazardRecord<V>>,
    /// `SLOTS` times the number of linked records.
    total_slots: AtomicUsize,
}

impl<V> HazardRegistry<V> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            total_slots: AtomicUsize::new(0),
        }
    }

    /// Total hazard slots across all records. Also the scan threshold.
    #[inline]
    pub(crate) fn total_slots(&self) -> usize {
        self.total_slots.load(Ordering::Acquire)
    }

    /// Number of linked records.
    pub(crate) fn records(&self) -> usize {
        self.total_slots() / SLOTS
    }

    /// Claims a free record, allocating a new one if all are held.
    pub(crate) fn pin<'r>(&'r self, tracker: &Tracker) -> Result<Pinned<'r, V>> {
        let mut cur = self.head.load(Ordering::Acquire);
        // SAFETY: linked records are only freed by teardown
        while let Some(record) = unsafe { cur.as_ref() } {
            if record.try_claim() {
                return Ok(Pinned { record });
            }
            cur = record.next.load(Ordering::Acquire);
        }

        let record = tracker.alloc(HazardRecord::in_use(), "hazard record")?;
        // SAFETY: we own the new record until it is linked, and records are
        // not freed while the registry is live
        let record = unsafe { &*record.as_ptr() };
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            record.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                ptr::from_ref(record).cast_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        let total = self.total_slots.fetch_add(SLOTS, Ordering::AcqRel) + SLOTS;
        debug!(total_slots = total, "hazard record allocated");
        Ok(Pinned { record })
    }

    /// Iterates over every linked record.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &HazardRecord<V>> + '_ {
        let mut cur = self.head.load(Ordering::Acquire);
        core::iter::from_fn(move || {
            // SAFETY: linked records are only freed by teardown
            let record = unsafe { cur.as_ref() }?;
            cur = record.next.load(Ordering::Acquire);
            Some(record)
        })
    }

    /// Frees every record that is not held, moving their retired nodes to
    /// `into`. Records still held (by live entry handles) stay linked.
    ///
    /// # Safety
    ///
    /// No table operation may be in flight, and no other thread may be
    /// inside this registry except to release a held record.
    pub(crate) unsafe fn reclaim_free(&self, tracker: &Tracker, into: &mut RetiredList<V>) {
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut kept: *mut HazardRecord<V> = ptr::null_mut();
        let mut kept_count = 0;
        while let Some(record) = NonNull::new(cur) {
            // SAFETY: records stay allocated until freed right here
            let rec = unsafe { record.as_ref() };
            cur = rec.next.load(Ordering::Acquire);
            if rec.try_claim() {
                // SAFETY: claimed, so nobody else touches its list
                into.append(unsafe { rec.retired() });
                // SAFETY: unlinked and claimed by us
                drop(unsafe { tracker.free(record) });
            } else {
                rec.next.store(kept, Ordering::Relaxed);
                kept = record.as_ptr();
                kept_count += 1;
            }
        }
        self.head.store(kept, Ordering::Release);
        self.total_slots
            .store(kept_count * SLOTS, Ordering::Release);
        debug!(kept = kept_count, "hazard records reclaimed");
    }

    /// Frees every record, held or not, moving their retired nodes to `into`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the registry and no entry
    /// handle may be alive.
    pub(crate) unsafe fn reclaim_all(&self, tracker: &Tracker, into: &mut RetiredList<V>) {
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while let Some(record) = NonNull::new(cur) {
            // SAFETY: exclusive access
            let rec = unsafe { record.as_ref() };
            cur = rec.next.load(Ordering::Relaxed);
            into.append(unsafe { rec.retired() });
            drop(unsafe { tracker.free(record) });
        }
        self.total_slots.store(0, Ordering::Release);
    }
}

/// A claimed record, released on drop.
pub(crate) struct Pinned<'r, V> {
    record: &'r HazardRecord<V>,
}

impl<'r, V> Pinned<'r, V> {
    #[inline]
    pub(crate) fn record(&self) -> &'r HazardRecord<V> {
        self.record
    }

    /// Hands the record over to a handle for `entry`, which must be published
    /// in slot [`HP_CUR`].
    pub(crate) fn into_entry(self, entry: NonNull<Entry<V>>) -> crate::EntryRef<'r, V> {
        let record = self.record;
        core::mem::forget(self);
        record.clear(HP_NEXT);
        record.clear(HP_PREV);
        // SAFETY: the caller protected `entry` in HP_CUR of this record
        unsafe { crate::EntryRef::new(record, entry) }
    }
}

impl<V> Drop for Pinned<'_, V> {
    fn drop(&mut self) {
        self.record.release();
    }
}
