//! Deferred reclamation of unlinked nodes.
//!
//! A thread that unlinks a node retires it onto the retired list of the hazard
//! record it holds. Once that list is as long as the total number of hazard
//! slots, the thread scans: every node no slot points at is freed, the rest
//! stay queued for a later scan.
//!
//! Scans compare node addresses only and never dereference a published
//! hazard, so a stale slot can at worst keep a node alive one scan longer.

use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::entry::Entry;
use crate::hazard::HazardRecord;
use crate::table::SoHashTable;

/// Intrusive list of retired nodes, linked through `Entry::retired_next`.
pub(crate) struct RetiredList<V> {
    head: *mut Entry<V>,
    len: usize,
}

impl<V> RetiredList<V> {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// # Safety
    ///
    /// `node` must be unlinked from the table and owned by this list from now
    /// on.
    pub(crate) unsafe fn push(&mut self, node: NonNull<Entry<V>>) {
        // SAFETY: retired nodes stay allocated until popped and freed
        unsafe { node.as_ref() }
            .retired_next
            .store(self.head, Ordering::Relaxed);
        self.head = node.as_ptr();
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<Entry<V>>> {
        let Some(node) = NonNull::new(self.head) else {
            if self.len != 0 {
                panic!("sohash: retired count {} but retired list is empty", self.len);
            }
            return None;
        };
        // SAFETY: nodes in the list are allocated until popped
        self.head = unsafe { node.as_ref() }.retired_next.load(Ordering::Relaxed);
        self.len = match self.len.checked_sub(1) {
            Some(len) => len,
            None => panic!("sohash: retired list longer than its count"),
        };
        Some(node)
    }

    /// Moves every node of `other` into `self`.
    pub(crate) fn append(&mut self, other: &mut RetiredList<V>) {
        while let Some(node) = other.pop() {
            // SAFETY: ownership moves from `other`
            unsafe { self.push(node) };
        }
    }
}

// SAFETY: the list owns its nodes; moving it moves that ownership.
unsafe impl<V: Send> Send for RetiredList<V> {}

impl<V, A: ?Sized> SoHashTable<V, A> {
    /// Queues an unlinked node for reclamation.
    ///
    /// # Safety
    ///
    /// The caller must have unlinked `node` itself, must hold `record`, and
    /// must not use `node` afterwards.
    pub(crate) unsafe fn retire(&self, record: &HazardRecord<V>, node: NonNull<Entry<V>>) {
        // SAFETY: unlinked but not yet freed; we are its only retirer
        let entry = unsafe { node.as_ref() };
        if entry.is_sentinel() {
            if self.is_active() {
                panic!(
                    "sohash: sentinel for bucket {} retired while the table is active",
                    entry.key()
                );
            }
        } else if let Some(on_delete) = &self.hooks.on_delete {
            on_delete(entry);
        }

        // SAFETY: we hold the record
        let retired = unsafe { record.retired() };
        unsafe { retired.push(node) };

        if self.is_active() && retired.len() >= self.registry.total_slots() {
            self.scan(retired);
        }
    }

    /// Frees every node of `retired` no hazard slot points at.
    fn scan(&self, retired: &mut RetiredList<V>) {
        let Some(protected) = self.protected() else {
            return;
        };
        let mut pending = RetiredList::new();
        pending.append(retired);

        let mut freed = 0u64;
        while let Some(node) = pending.pop() {
            if protected.binary_search(&(node.as_ptr() as usize)).is_ok() {
                // SAFETY: ownership moves back to the record
                unsafe { retired.push(node) };
            } else {
                // SAFETY: retired and unprotected
                unsafe { self.free_entry(node) };
                freed += 1;
            }
        }

        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        self.counters.reclaimed.fetch_add(freed, Ordering::Relaxed);
        trace!(freed, kept = retired.len(), "hazard scan");
    }

    /// Sorted addresses currently published in any hazard slot.
    ///
    /// `None` when the snapshot buffer cannot be allocated; the caller skips
    /// reclamation and retries on its next retire.
    fn protected(&self) -> Option<Vec<usize>> {
        let total = self.registry.total_slots();
        let mut protected = Vec::new();
        if protected.try_reserve_exact(total).is_err() {
            warn!(slots = total, "cannot allocate hazard snapshot, skipping scan");
            return None;
        }
        for record in self.registry.iter() {
            protected.extend(
                record
                    .hazards()
                    .filter(|hazard| !hazard.is_null())
                    .map(|hazard| hazard as usize & !1),
            );
        }
        protected.sort_unstable();
        Some(protected)
    }

    /// Releases a node's memory and hands its payload to the free callback.
    ///
    /// # Safety
    ///
    /// `node` must be unreachable from the table and from every hazard slot.
    pub(crate) unsafe fn free_entry(&self, node: NonNull<Entry<V>>) {
        // SAFETY: guaranteed by the caller
        let entry = unsafe { self.tracker.free(node) };
        if let Some(value) = entry.into_value() {
            self.discard(value);
        }
    }

    /// Disposes of a payload the table owns.
    pub(crate) fn discard(&self, value: V) {
        match &self.hooks.on_free {
            Some(on_free) => on_free(value),
            None => drop(value),
        }
    }

    /// Reclaims every record that is not held by an entry handle together
    /// with all retired nodes. Nodes still protected by a handle move to the
    /// orphan list.
    ///
    /// # Safety
    ///
    /// Teardown only: no operation may be in flight and none may start.
    pub(crate) unsafe fn reclaim_quiescent(&self) {
        let mut retired = RetiredList::new();
        // SAFETY: quiescent, guaranteed by the caller
        unsafe { self.registry.reclaim_free(&self.tracker, &mut retired) };
        // SAFETY: teardown has exclusive use of the orphan list
        let orphans = unsafe { self.orphans() };
        retired.append(orphans);

        let protected = self.protected();
        let (mut freed, mut kept) = (0u64, 0usize);
        while let Some(node) = retired.pop() {
            // Without a snapshot nothing can be proven unprotected.
            let unprotected = protected
                .as_ref()
                .is_some_and(|p| p.binary_search(&(node.as_ptr() as usize)).is_err());
            if unprotected {
                // SAFETY: retired and not published by any live record
                unsafe { self.free_entry(node) };
                freed += 1;
            } else {
                // SAFETY: ownership moves to the orphan list
                unsafe { orphans.push(node) };
                kept += 1;
            }
        }
        self.counters.reclaimed.fetch_add(freed, Ordering::Relaxed);
        debug!(freed, orphaned = kept, "retired nodes reclaimed");
    }

    /// Frees every record, retired node and orphan.
    ///
    /// # Safety
    ///
    /// Only from `Drop`, after teardown.
    pub(crate) unsafe fn reclaim_all(&mut self) {
        let mut retired = RetiredList::new();
        // SAFETY: exclusive access through &mut self
        unsafe { self.registry.reclaim_all(&self.tracker, &mut retired) };
        retired.append(unsafe { self.orphans() });
        while let Some(node) = retired.pop() {
            // SAFETY: no handle can outlive the table
            unsafe { self.free_entry(node) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Tracker;

    #[test]
    fn test_retired_list_push_pop() {
        let tracker = Tracker::new(None);
        let mut list = RetiredList::new();
        for key in 0..4u32 {
            let node = tracker.alloc(Entry::regular(key, key, 251, key), "entry").unwrap();
            unsafe { list.push(node) };
        }
        assert_eq!(list.len(), 4);

        let mut other = RetiredList::new();
        other.append(&mut list);
        assert!(list.is_empty());
        assert_eq!(other.len(), 4);

        let mut keys = Vec::new();
        while let Some(node) = other.pop() {
            keys.push(unsafe { tracker.free(node) }.key());
        }
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 1, 2, 3]);
        assert_eq!(tracker.live(), 0);
    }
}
