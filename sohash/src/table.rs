//! The split-ordered hash table.
//!
//! # Structure
//! - **List**: every entry, plus one sentinel per initialized bucket, lives in
//!   a single lock-free list ordered by reverse key.
//! - **Directory**: bucket `i` points at its sentinel; lookups start there.
//!   Buckets are initialized lazily, parent first.
//! - **Growth**: the bucket count doubles with one CAS when the load factor
//!   is exceeded. Nothing moves: new buckets get new sentinels spliced into
//!   the existing list on first use.
//! - **Reclamation**: per-table hazard records; see [`crate::reclaim`].
//!
//! # Teardown
//! [`SoHashTable::destroy`] flips the table to flushing, waits for in-flight
//! operations while deleting entries, then removes the sentinels and releases
//! everything that is not still held by an [`EntryRef`].

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};
use tracing::{debug, trace, warn};

use crate::alloc::Tracker;
use crate::config::{Config, Hooks, INITIAL_SIZE};
use crate::entry::{Entry, EntryKind, EntryRef};
use crate::error::{InsertError, Result, SoHashError};
use crate::hazard::{HazardRecord, HazardRegistry};
use crate::key::{self, SoKey};
use crate::link::Marked;
use crate::list::{self, Search};
use crate::reclaim::RetiredList;
use crate::segment::{Bucket, Directory};
use crate::stats::{Counters, Stats};

const ACTIVE: u8 = 0;
const FLUSHING: u8 = 1;
const DESTROYED: u8 = 2;

/// Lifecycle state of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Accepting operations.
    Active,
    /// Being torn down. New operations are rejected.
    Flushing,
    /// Torn down. Only entry handles that outlived teardown remain.
    Destroyed,
}

/// A resizable, non-blocking hash table keyed by 32-bit keys.
///
/// `V` is the payload type. `A` is the argument type passed to the matcher of
/// tables with non-unique keys; see [`Config::matcher`].
///
/// ```
/// use sohash::{Config, SoHashTable};
///
/// let table = SoHashTable::<&str>::new(Config::new()).unwrap();
/// table.insert(7, "seven").unwrap();
/// assert_eq!(table.get(7), Some("seven"));
/// table.remove(7).unwrap();
/// assert!(table.find(7).is_none());
/// ```
pub struct SoHashTable<V, A: ?Sized = ()> {
    directory: Directory<V>,
    pub(crate) registry: HazardRegistry<V>,
    pub(crate) tracker: Tracker,
    pub(crate) hooks: Hooks<V, A>,
    pub(crate) counters: Counters,
    state: AtomicU8,
    keys_unique: AtomicBool,
    max_load: usize,
    current_size: CachePadded<AtomicU32>,
    /// Signed: teardown can delete an entry before its inserter counts it.
    regular_count: CachePadded<AtomicIsize>,
    sentinel_count: AtomicUsize,
    in_flight: CachePadded<AtomicUsize>,
    /// Retired nodes still protected by entry handles at teardown.
    orphans: UnsafeCell<RetiredList<V>>,
}

// SAFETY: all shared state is atomic; `orphans` is only touched by teardown,
// which excludes every other operation.
unsafe impl<V: Send + Sync, A: ?Sized> Send for SoHashTable<V, A> {}
unsafe impl<V: Send + Sync, A: ?Sized> Sync for SoHashTable<V, A> {}

/// Registration of a running operation, undone on drop.
struct InFlight<'t> {
    count: &'t AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

fn rejected<'t, V>(err: SoHashError, value: V) -> InsertError<'t, V> {
    match err {
        SoHashError::ResourceExhausted(what) => InsertError::ResourceExhausted { value, what },
        _ => InsertError::Busy(value),
    }
}

impl<V, A: ?Sized> SoHashTable<V, A> {
    /// Creates a table with bucket 0 initialized.
    pub fn new(config: Config<V, A>) -> Result<Self> {
        config.validate()?;
        let segment_count = config.resolved_segment_count();
        let segment_size = config.resolved_segment_size();

        let tracker = Tracker::new(config.max_allocations);
        let directory = Directory::new(segment_count, segment_size)?;
        let root = tracker.alloc(Entry::sentinel(0, segment_size), "sentinel")?;
        match directory.slot_or_alloc(0, &tracker) {
            Ok(slot) => slot.store(Marked::new(root.as_ptr()), Ordering::Release),
            Err(err) => {
                // SAFETY: never published
                drop(unsafe { tracker.free(root) });
                return Err(err);
            }
        }

        debug!(
            segment_count,
            segment_size,
            keys_unique = config.keys_unique,
            max_load = config.max_load,
            "table created"
        );
        Ok(Self {
            directory,
            registry: HazardRegistry::new(),
            tracker,
            hooks: config.hooks,
            counters: Counters::default(),
            state: AtomicU8::new(ACTIVE),
            keys_unique: AtomicBool::new(config.keys_unique),
            max_load: config.max_load,
            current_size: CachePadded::new(AtomicU32::new(INITIAL_SIZE)),
            regular_count: CachePadded::new(AtomicIsize::new(0)),
            sentinel_count: AtomicUsize::new(1),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            orphans: UnsafeCell::new(RetiredList::new()),
        })
    }

    /// Inserts `value` under `key`.
    ///
    /// On success the returned handle points at the new entry.
    pub fn insert(&self, key: SoKey, value: V) -> core::result::Result<EntryRef<'_, V>, InsertError<'_, V>> {
        self.insert_with(key, value, None)
    }

    /// Inserts `value` under `key`, passing `arg` to the matcher when looking
    /// for an existing entry.
    pub fn insert_with<'t>(
        &'t self,
        key: SoKey,
        value: V,
        arg: Option<&A>,
    ) -> core::result::Result<EntryRef<'t, V>, InsertError<'t, V>> {
        let Some(_op) = self.enter() else {
            trace!(key, "insert rejected, table not active");
            return Err(InsertError::Busy(value));
        };
        let pinned = match self.registry.pin(&self.tracker) {
            Ok(pinned) => pinned,
            Err(err) => return Err(rejected(err, value)),
        };
        let record = pinned.record();
        let (bucket, hash_index) = match self.bucket_for(key, record) {
            Ok(found) => found,
            Err(err) => return Err(rejected(err, value)),
        };
        let node = match self.tracker.alloc_uninit::<Entry<V>>("entry") {
            Ok(node) => node,
            Err(err) => return Err(rejected(err, value)),
        };
        let entry = Entry::regular(key, hash_index, self.directory.segment_size(), value);
        // SAFETY: freshly allocated for an Entry
        unsafe { node.as_ptr().write(entry) };

        let search = self.search(key, arg);
        // SAFETY: bucket sentinels stay linked while we are in flight
        match unsafe { list::insert(bucket, node, &search, record, &self.counters) } {
            Ok(()) => {
                self.regular_count.fetch_add(1, Ordering::SeqCst);
                trace!(key, hash_index, "inserted");
                self.grow_if_loaded();
                Ok(pinned.into_entry(node))
            }
            Err(existing) => {
                // SAFETY: the rejected node was never linked or published
                unsafe { self.free_entry(node) };
                trace!(key, hash_index, "key already present");
                Err(InsertError::AlreadyExists(pinned.into_entry(existing)))
            }
        }
    }

    /// Looks up `key`.
    pub fn find(&self, key: SoKey) -> Option<EntryRef<'_, V>> {
        self.find_with(key, None)
    }

    /// Looks up `key`, passing `arg` to the matcher.
    ///
    /// Returns `None` when the table is not active.
    pub fn find_with(&self, key: SoKey, arg: Option<&A>) -> Option<EntryRef<'_, V>> {
        let _op = self.enter()?;
        let pinned = match self.registry.pin(&self.tracker) {
            Ok(pinned) => pinned,
            Err(err) => {
                trace!(key, %err, "find: no hazard record");
                return None;
            }
        };
        let record = pinned.record();
        let bucket = match self.bucket_for(key, record) {
            Ok((bucket, _)) => bucket,
            Err(err) => {
                trace!(key, %err, "find: bucket unavailable");
                return None;
            }
        };
        let search = self.search(key, arg);
        // SAFETY: bucket sentinels stay linked while we are in flight
        let found = unsafe { list::find(bucket, &search, record, &self.counters) }.found();
        trace!(key, found = found.is_some(), "find");
        found.map(|node| pinned.into_entry(node))
    }

    /// Clones the payload stored under `key`.
    pub fn get(&self, key: SoKey) -> Option<V>
    where
        V: Clone,
    {
        self.find(key)?.value().cloned()
    }

    /// Removes the entry stored under `key`.
    pub fn remove(&self, key: SoKey) -> Result<()> {
        self.remove_with(key, None)
    }

    /// Removes the entry stored under `key` that the matcher accepts for
    /// `arg`.
    ///
    /// The entry is unlinked at once but its memory, and the payload, are
    /// released only when no thread can still be reading it.
    pub fn remove_with(&self, key: SoKey, arg: Option<&A>) -> Result<()> {
        let Some(_op) = self.enter() else {
            return Err(SoHashError::Busy);
        };
        let pinned = self.registry.pin(&self.tracker)?;
        let record = pinned.record();
        let (bucket, _) = self.bucket_for(key, record)?;
        let search = self.search(key, arg);
        // SAFETY: bucket sentinels stay linked while we are in flight
        let Some(node) = (unsafe { list::delete(bucket, &search, record, &self.counters) }) else {
            trace!(key, "remove: not found");
            return Err(SoHashError::NotFound);
        };
        self.regular_count.fetch_sub(1, Ordering::SeqCst);
        // SAFETY: we unlinked the node and hold the record
        unsafe { self.retire(record, node) };
        trace!(key, "removed");
        Ok(())
    }

    /// Tears the table down.
    ///
    /// Operations racing with teardown either complete before it finishes
    /// (and their entries are then removed) or are rejected. Entry handles
    /// that are still alive keep their entries readable; those entries are
    /// freed when the table is dropped.
    ///
    /// Fails with [`Busy`](SoHashError::Busy) while another thread is tearing
    /// the table down and with [`InvalidState`](SoHashError::InvalidState)
    /// once it has been.
    pub fn destroy(&self) -> Result<()> {
        let Some(op) = self.enter() else {
            return Err(self.inactive_error());
        };
        let pinned = self.registry.pin(&self.tracker)?;
        if self
            .state
            .compare_exchange(ACTIVE, FLUSHING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.inactive_error());
        }
        self.keys_unique.store(true, Ordering::SeqCst);
        debug!(len = self.len(), size = self.current_size(), "teardown started");
        let record = pinned.record();

        // Our own registration is the one left.
        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) > 1 {
            self.sweep(record, false);
            backoff.snooze();
        }
        // No operation can start from here on.
        self.sweep(record, true);

        let live = self.regular_count.load(Ordering::SeqCst);
        let sentinels = self.sentinel_count.load(Ordering::SeqCst);
        if live != 0 || sentinels != 1 {
            panic!("sohash: teardown left {live} entries and {sentinels} sentinels behind");
        }

        // SAFETY: quiescent, and only bucket 0 is left
        unsafe {
            self.release_root();
            self.directory.free_segments(&self.tracker);
        }
        drop(pinned);
        // SAFETY: quiescent
        unsafe { self.reclaim_quiescent() };
        self.state.store(DESTROYED, Ordering::SeqCst);
        drop(op);

        debug!(
            allocated = self.tracker.live(),
            held_records = self.registry.records(),
            "table destroyed"
        );
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.regular_count.load(Ordering::Acquire).max(0) as usize
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count. Starts at 2 and only ever doubles.
    pub fn current_size(&self) -> u32 {
        self.current_size.load(Ordering::Acquire)
    }

    /// Number of initialized buckets.
    pub fn sentinel_count(&self) -> usize {
        self.sentinel_count.load(Ordering::Acquire)
    }

    /// Hazard slots across all records this table has allocated.
    pub fn hazard_slots(&self) -> usize {
        self.registry.total_slots()
    }

    /// Live allocations: entries, sentinels, segments and hazard records.
    pub fn allocated(&self) -> usize {
        self.tracker.live()
    }

    /// Snapshot of the reclamation and growth counters.
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TableState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => TableState::Active,
            FLUSHING => TableState::Flushing,
            _ => TableState::Destroyed,
        }
    }

    /// Whether keys are compared without the matcher. Always true once
    /// teardown has started.
    pub fn keys_unique(&self) -> bool {
        self.keys_unique.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ACTIVE
    }

    fn inactive_error(&self) -> SoHashError {
        match self.state.load(Ordering::SeqCst) {
            DESTROYED => SoHashError::InvalidState,
            _ => SoHashError::Busy,
        }
    }

    /// Registers an operation, unless the table is no longer active.
    ///
    /// The count goes up before the state is checked, so teardown either
    /// sees the operation in flight or the operation sees teardown.
    fn enter(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let op = InFlight {
            count: &self.in_flight,
        };
        self.is_active().then_some(op)
    }

    /// # Safety
    ///
    /// Teardown only: no other thread may access the orphan list.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn orphans(&self) -> &mut RetiredList<V> {
        // SAFETY: exclusivity guaranteed by the caller
        unsafe { &mut *self.orphans.get() }
    }

    fn search<'a>(&'a self, key: SoKey, arg: Option<&'a A>) -> Search<'a, V, A> {
        let matcher = match self.keys_unique.load(Ordering::Acquire) {
            true => None,
            false => self.hooks.matcher.as_deref(),
        };
        Search::regular(key::regular_key(key), matcher, arg)
    }

    /// The initialized bucket `key` hashes to, and its index.
    fn bucket_for(&self, key: SoKey, record: &HazardRecord<V>) -> Result<(&Bucket<V>, u32)> {
        let index = key % self.current_size.load(Ordering::Acquire);
        let bucket = match self.directory.bucket(index) {
            Some(bucket) => bucket,
            None => self.initialize_bucket(index, record)?,
        };
        Ok((bucket, index))
    }

    /// Initializes bucket `index`, parent first.
    ///
    /// Racing initializers converge on one sentinel: whoever links it first
    /// wins, the others free theirs and adopt the linked one.
    fn initialize_bucket(&self, index: u32, record: &HazardRecord<V>) -> Result<&Bucket<V>> {
        if let Some(bucket) = self.directory.bucket(index) {
            return Ok(bucket);
        }
        if index == 0 {
            panic!("sohash: bucket 0 is uninitialized");
        }

        let parent = self.initialize_bucket(key::unset_msb(index), record)?;
        let slot = self.directory.slot_or_alloc(index, &self.tracker)?;
        let sentinel = self
            .tracker
            .alloc(Entry::sentinel(index, self.directory.segment_size()), "sentinel")?;

        let search = Search::<V, A>::sentinel(key::sentinel_key(index));
        // SAFETY: the parent's sentinel stays linked while we are in flight
        let (head, won) = match unsafe { list::insert(parent, sentinel, &search, record, &self.counters) } {
            Ok(()) => (sentinel, true),
            Err(existing) => {
                // SAFETY: never linked or published
                drop(unsafe { self.tracker.free(sentinel) });
                (existing, false)
            }
        };
        // A racing initializer may already have published the same sentinel.
        if let Err(actual) = slot.compare_exchange(
            Marked::null(),
            Marked::new(head.as_ptr()),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            debug_assert_eq!(
                actual.ptr(),
                head.as_ptr(),
                "bucket {index} published with a different sentinel"
            );
        }
        record.clear_all();

        if won {
            self.sentinel_count.fetch_add(1, Ordering::SeqCst);
            debug!(index, parent = key::unset_msb(index), "bucket initialized");
        }
        Ok(slot)
    }

    /// Doubles the bucket count if the load factor is exceeded.
    ///
    /// A lost CAS means another inserter doubled it already.
    fn grow_if_loaded(&self) {
        let size = self.current_size.load(Ordering::Acquire);
        if self.len() / size as usize <= self.max_load {
            return;
        }
        let Some(doubled) = size
            .checked_mul(2)
            .filter(|&doubled| doubled as usize <= self.directory.capacity())
        else {
            debug!(size, capacity = self.directory.capacity(), "bucket directory full");
            return;
        };
        if self
            .current_size
            .compare_exchange(size, doubled, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.counters.resizes.fetch_add(1, Ordering::Relaxed);
            debug!(from = size, to = doubled, "table doubled");
        }
    }

    /// Deletes regular entries bucket by bucket, highest index first, and
    /// with `remove_sentinels` unlinks each bucket's sentinel after emptying
    /// it. Bucket 0 is emptied last and its sentinel kept.
    fn sweep(&self, record: &HazardRecord<V>, remove_sentinels: bool) {
        let size = self.current_size.load(Ordering::SeqCst);
        for index in (1..size).rev() {
            let Some(slot) = self.directory.bucket(index) else {
                continue;
            };
            self.clear_bucket(slot, record);
            if remove_sentinels {
                self.remove_sentinel(index, slot, record);
            }
        }
        if let Some(root) = self.directory.bucket(0) {
            self.clear_bucket(root, record);
        }
    }

    /// Deletes the regular entries between a bucket's sentinel and the next
    /// sentinel in the list.
    fn clear_bucket(&self, slot: &Bucket<V>, record: &HazardRecord<V>) {
        // SAFETY: sentinels are only unlinked by teardown itself
        let Some(sentinel) = (unsafe { slot.load(Ordering::SeqCst).as_ref() }) else {
            return;
        };
        // SAFETY: as above
        while let Some((reverse_key, EntryKind::Regular)) = unsafe { list::peek_next(sentinel, record) } {
            let search = Search::<V, A>::regular(reverse_key, None, None);
            // SAFETY: as above
            if let Some(node) = unsafe { list::delete(slot, &search, record, &self.counters) } {
                self.regular_count.fetch_sub(1, Ordering::SeqCst);
                // SAFETY: we unlinked it
                unsafe { self.retire(record, node) };
            }
        }
    }

    /// Unpublishes bucket `index` and unlinks its sentinel, searching from
    /// the parent bucket.
    fn remove_sentinel(&self, index: u32, slot: &Bucket<V>, record: &HazardRecord<V>) {
        slot.store(Marked::null(), Ordering::SeqCst);
        let parent = self
            .directory
            .bucket(key::unset_msb(index))
            .or_else(|| self.directory.bucket(0));
        let Some(parent) = parent else {
            panic!("sohash: bucket 0 is uninitialized");
        };

        let search = Search::<V, A>::sentinel(key::sentinel_key(index));
        // SAFETY: teardown is quiescent when sentinels are removed
        match unsafe { list::delete(parent, &search, record, &self.counters) } {
            Some(node) => {
                self.sentinel_count.fetch_sub(1, Ordering::SeqCst);
                // SAFETY: we unlinked it
                unsafe { self.retire(record, node) };
            }
            None => panic!("sohash: sentinel for bucket {index} is not linked"),
        }
    }

    /// Unpublishes and frees bucket 0's sentinel.
    ///
    /// # Safety
    ///
    /// Teardown only, after every other node has been unlinked.
    unsafe fn release_root(&self) {
        let root = self
            .directory
            .bucket(0)
            .map(|slot| slot.swap(Marked::null(), Ordering::SeqCst))
            .and_then(|root| NonNull::new(root.ptr()));
        let Some(root) = root else {
            panic!("sohash: bucket 0 is uninitialized");
        };
        // SAFETY: quiescent, the root is still allocated
        if !unsafe { root.as_ref() }.next.load(Ordering::SeqCst).is_null() {
            panic!("sohash: bucket 0 is not empty at teardown");
        }
        self.sentinel_count.fetch_sub(1, Ordering::SeqCst);
        // SAFETY: sentinels are never handed out, so nothing protects it
        unsafe { self.free_entry(root) };
    }

    /// Frees every node still linked from bucket 0, without the teardown
    /// protocol.
    ///
    /// # Safety
    ///
    /// Requires exclusive access and no live entry handle.
    unsafe fn release_exclusive(&mut self) {
        let mut cur = self
            .directory
            .bucket(0)
            .map_or(Marked::null(), |root| root.load(Ordering::Relaxed));
        while let Some(node) = NonNull::new(cur.ptr()) {
            // SAFETY: exclusive access
            cur = unsafe { node.as_ref() }.next.load(Ordering::Relaxed);
            unsafe { self.free_entry(node) };
        }
        // SAFETY: nothing references the segments any more
        unsafe { self.directory.free_segments(&self.tracker) };
        *self.regular_count.get_mut() = 0;
        *self.sentinel_count.get_mut() = 0;
        *self.state.get_mut() = DESTROYED;
    }
}

impl<V, A: ?Sized> Drop for SoHashTable<V, A> {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(err) = self.destroy() {
                warn!(%err, "teardown on drop failed, releasing directly");
                // SAFETY: &mut self, so no operation or handle is alive
                unsafe { self.release_exclusive() };
            }
        }
        if *self.state.get_mut() != DESTROYED {
            warn!("table dropped during teardown, leaking it");
            return;
        }
        // SAFETY: &mut self, so no handle is alive
        unsafe { self.reclaim_all() };
        debug_assert_eq!(self.tracker.live(), 0, "allocations leaked by table");
    }
}

impl<V, A: ?Sized> fmt::Debug for SoHashTable<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoHashTable")
            .field("state", &self.state())
            .field("len", &self.len())
            .field("current_size", &self.current_size())
            .field("sentinels", &self.sentinel_count())
            .field("hazard_slots", &self.hazard_slots())
            .field("allocated", &self.allocated())
            .finish()
    }
}
