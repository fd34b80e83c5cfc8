//! Lock-free ordered list with tombstones.
//!
//! All entries of a table, sentinels and regular ones, live in one list
//! sorted by reverse key. A node is deleted in two steps: its `next` link is
//! marked, then its predecessor is swung past it. Traversals that run into a
//! marked node restart from the bucket head instead of helping to unlink it.
//!
//! Every function here takes the caller's hazard record and leaves at most
//! slot [`HP_CUR`] set on return, protecting the node it reports.

use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::SeqCst;

use crossbeam_utils::Backoff;

use crate::entry::{Entry, EntryKind};
use crate::hazard::{HP_CUR, HP_NEXT, HP_PREV, HazardRecord};
use crate::key::ReverseKey;
use crate::link::{Link, Marked};
use crate::stats::Counters;

pub(crate) type MatchFn<V, A> = dyn Fn(&Entry<V>, Option<&A>) -> bool + Send + Sync;

/// What a traversal is looking for.
pub(crate) struct Search<'a, V, A: ?Sized> {
    key: ReverseKey,
    kind: EntryKind,
    matcher: Option<&'a MatchFn<V, A>>,
    arg: Option<&'a A>,
}

impl<'a, V, A: ?Sized> Search<'a, V, A> {
    /// A regular entry. Without a matcher the first entry with an equal key
    /// matches.
    pub(crate) fn regular(
        key: ReverseKey,
        matcher: Option<&'a MatchFn<V, A>>,
        arg: Option<&'a A>,
    ) -> Self {
        Self {
            key,
            kind: EntryKind::Regular,
            matcher,
            arg,
        }
    }

    pub(crate) fn sentinel(key: ReverseKey) -> Self {
        Self {
            key,
            kind: EntryKind::Sentinel,
            matcher: None,
            arg: None,
        }
    }

    fn matches(&self, entry: &Entry<V>) -> bool {
        if entry.reverse_key() != self.key || entry.kind() != self.kind {
            return false;
        }
        match self.matcher {
            Some(matcher) if self.kind == EntryKind::Regular => matcher(entry, self.arg),
            _ => true,
        }
    }
}

/// Position reached by a traversal.
pub(crate) struct Cursor<V> {
    /// Link that pointed at `cur` when it was validated.
    prev: *const Link<Entry<V>>,
    /// First node at or past the search key, protected by [`HP_CUR`].
    cur: *mut Entry<V>,
    /// Unmarked successor of `cur`.
    next: Marked<Entry<V>>,
}

pub(crate) enum Lookup<V> {
    Found(Cursor<V>),
    Absent(Cursor<V>),
}

impl<V> Lookup<V> {
    /// The matching node, if any.
    pub(crate) fn found(self) -> Option<NonNull<Entry<V>>> {
        match self {
            Lookup::Found(cursor) => NonNull::new(cursor.cur),
            Lookup::Absent(_) => None,
        }
    }
}

/// Walks from `head` to the first node not ordered before `search`.
///
/// On return `HP_CUR` protects the cursor's `cur`, `HP_NEXT` its successor
/// and `HP_PREV` the node owning `prev` (unless `prev` is `head`).
///
/// # Safety
///
/// `head` must be a bucket slot whose sentinel stays linked for the
/// duration of the call, and `record` must be held by the caller.
pub(crate) unsafe fn find<V, A: ?Sized>(
    head: &Link<Entry<V>>,
    search: &Search<'_, V, A>,
    record: &HazardRecord<V>,
    counters: &Counters,
) -> Lookup<V> {
    let backoff = Backoff::new();
    'restart: loop {
        let mut prev: *const Link<Entry<V>> = head;
        let mut cur = head.load(SeqCst);
        record.protect(HP_CUR, cur.ptr());
        if head.load(SeqCst) != cur {
            counters.restart();
            backoff.spin();
            continue 'restart;
        }

        loop {
            // SAFETY: cur is published in HP_CUR and was reachable from prev
            // after publication
            let Some(node) = (unsafe { cur.as_ref() }) else {
                return Lookup::Absent(Cursor {
                    prev,
                    cur: ptr::null_mut(),
                    next: Marked::null(),
                });
            };

            let next = node.next.load(SeqCst);
            record.protect(HP_NEXT, next.ptr());
            if node.next.load(SeqCst) != next {
                counters.restart();
                backoff.spin();
                continue 'restart;
            }

            // SAFETY: prev is `head` or the `next` field of the node in HP_PREV
            if unsafe { (*prev).load(SeqCst) } != cur {
                counters.restart();
                backoff.spin();
                continue 'restart;
            }

            // cur is being deleted.
            if next.is_marked() {
                counters.restart();
                backoff.snooze();
                continue 'restart;
            }

            if search.matches(node) {
                return Lookup::Found(Cursor {
                    prev,
                    cur: cur.ptr(),
                    next,
                });
            }
            if node.reverse_key() > search.key {
                return Lookup::Absent(Cursor {
                    prev,
                    cur: cur.ptr(),
                    next,
                });
            }

            prev = &node.next;
            record.protect(HP_PREV, cur.ptr());
            cur = next;
            record.protect(HP_CUR, cur.ptr());
        }
    }
}

/// Links `node` in front of the first node ordered after it.
///
/// On success `HP_CUR` protects `node`. If a matching node is already
/// present it is returned instead, protected by `HP_CUR`, and `node` is left
/// untouched for the caller to free.
///
/// # Safety
///
/// As for [`find`]. `node` must be exclusively owned and not yet linked.
pub(crate) unsafe fn insert<V, A: ?Sized>(
    head: &Link<Entry<V>>,
    node: NonNull<Entry<V>>,
    search: &Search<'_, V, A>,
    record: &HazardRecord<V>,
    counters: &Counters,
) -> Result<(), NonNull<Entry<V>>> {
    // SAFETY: the caller owns `node`
    let new = unsafe { node.as_ref() };
    loop {
        // SAFETY: forwarded from the caller
        let cursor = match unsafe { find(head, search, record, counters) } {
            Lookup::Found(cursor) => {
                record.clear(HP_NEXT);
                record.clear(HP_PREV);
                // SAFETY: Found never carries a null cur
                return Err(unsafe { NonNull::new_unchecked(cursor.cur) });
            }
            Lookup::Absent(cursor) => cursor,
        };

        new.next.store(Marked::new(cursor.cur), SeqCst);
        // Published before linking, so a racing delete cannot reclaim it.
        record.protect(HP_NEXT, node.as_ptr());
        // SAFETY: prev is protected as in `find`
        let linked = unsafe { &*cursor.prev }
            .compare_exchange(
                Marked::new(cursor.cur),
                Marked::new(node.as_ptr()),
                SeqCst,
                SeqCst,
            )
            .is_ok();
        if linked {
            record.protect(HP_CUR, node.as_ptr());
            record.clear(HP_NEXT);
            record.clear(HP_PREV);
            return Ok(());
        }
        counters.restart();
    }
}

/// Unlinks the first node matching `search`.
///
/// Returns the unlinked node, which the caller now owns and must retire. All
/// hazard slots are cleared on return.
///
/// # Safety
///
/// As for [`find`].
pub(crate) unsafe fn delete<V, A: ?Sized>(
    head: &Link<Entry<V>>,
    search: &Search<'_, V, A>,
    record: &HazardRecord<V>,
    counters: &Counters,
) -> Option<NonNull<Entry<V>>> {
    loop {
        // SAFETY: forwarded from the caller
        let cursor = match unsafe { find(head, search, record, counters) } {
            Lookup::Found(cursor) => cursor,
            Lookup::Absent(_) => {
                record.clear_all();
                return None;
            }
        };
        // SAFETY: cur is protected by HP_CUR
        let node = unsafe { &*cursor.cur };

        if node
            .next
            .compare_exchange(cursor.next, cursor.next.with_mark(), SeqCst, SeqCst)
            .is_err()
        {
            counters.restart();
            continue;
        }

        // SAFETY: prev is protected as in `find`
        let unlinked = unsafe { &*cursor.prev }
            .compare_exchange(Marked::new(cursor.cur), cursor.next, SeqCst, SeqCst)
            .is_ok();
        if unlinked {
            record.clear_all();
            // SAFETY: Found never carries a null cur
            return Some(unsafe { NonNull::new_unchecked(cursor.cur) });
        }

        // Lost the unlink. Nobody else clears our mark, so this cannot fail.
        if node
            .next
            .compare_exchange(cursor.next.with_mark(), cursor.next, SeqCst, SeqCst)
            .is_err()
        {
            panic!(
                "sohash: could not roll back tombstone on entry {:#010x}",
                node.reverse_key()
            );
        }
        counters.restart();
    }
}

/// Key and kind of the node right after `node`, if any.
///
/// # Safety
///
/// `node` must stay linked and allocated for the duration of the call, and
/// `record` must be held by the caller. Uses slot `HP_NEXT`, cleared on
/// return.
pub(crate) unsafe fn peek_next<V>(
    node: &Entry<V>,
    record: &HazardRecord<V>,
) -> Option<(ReverseKey, EntryKind)> {
    let backoff = Backoff::new();
    loop {
        let next = node.next.load(SeqCst);
        if next.is_null() {
            return None;
        }
        record.protect(HP_NEXT, next.ptr());
        if node.next.load(SeqCst) != next {
            backoff.spin();
            continue;
        }
        // SAFETY: reachable from a linked node after publication
        let succ = unsafe { &*next.ptr() };
        let found = (succ.reverse_key(), succ.kind());
        record.clear(HP_NEXT);
        return Some(found);
    }
}
