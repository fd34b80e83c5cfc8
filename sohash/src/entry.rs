//! List nodes and the handles returned to callers.

use core::fmt;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::AtomicPtr;

use crate::hazard::HazardRecord;
use crate::key::{self, ReverseKey, SoKey};
use crate::link::Link;

/// Role of a node in the shared list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Marks the start of a bucket. Carries no payload.
    Sentinel,
    /// Holds a caller key and payload.
    Regular,
}

/// A node of the split-ordered list.
///
/// Callers only ever see regular entries: through [`EntryRef`], and inside the
/// match and delete callbacks.
pub struct Entry<V> {
    pub(crate) next: Link<Entry<V>>,
    value: Option<V>,
    reverse_key: ReverseKey,
    key: SoKey,
    hash_index: u32,
    segment_index: u32,
    bucket_index: u32,
    kind: EntryKind,
    /// Link in the retired list of the hazard record that unlinked this node.
    pub(crate) retired_next: AtomicPtr<Entry<V>>,
}

impl<V> Entry<V> {
    fn new(
        kind: EntryKind,
        key: SoKey,
        reverse_key: ReverseKey,
        hash_index: u32,
        segment_size: usize,
        value: Option<V>,
    ) -> Self {
        let segment_size = segment_size as u32;
        Self {
            next: Link::null(),
            value,
            reverse_key,
            key,
            hash_index,
            segment_index: hash_index / segment_size,
            bucket_index: hash_index % segment_size,
            kind,
            retired_next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn regular(key: SoKey, hash_index: u32, segment_size: usize, value: V) -> Self {
        Self::new(
            EntryKind::Regular,
            key,
            key::regular_key(key),
            hash_index,
            segment_size,
            Some(value),
        )
    }

    pub(crate) fn sentinel(index: u32, segment_size: usize) -> Self {
        Self::new(
            EntryKind::Sentinel,
            index,
            key::sentinel_key(index),
            index,
            segment_size,
            None,
        )
    }

    /// The caller key (the bucket index, for sentinels).
    #[inline]
    pub fn key(&self) -> SoKey {
        self.key
    }

    /// The split-order key the list is sorted by.
    #[inline]
    pub fn reverse_key(&self) -> ReverseKey {
        self.reverse_key
    }

    /// Sentinel or regular.
    #[inline]
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// True for bucket sentinels.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.kind == EntryKind::Sentinel
    }

    /// The payload. `None` only for sentinels.
    #[inline]
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Bucket the entry was addressed to when it was inserted.
    #[inline]
    pub fn hash_index(&self) -> u32 {
        self.hash_index
    }

    /// Directory segment of [`hash_index`](Entry::hash_index).
    #[inline]
    pub fn segment_index(&self) -> u32 {
        self.segment_index
    }

    /// Slot of [`hash_index`](Entry::hash_index) within its segment.
    #[inline]
    pub fn bucket_index(&self) -> u32 {
        self.bucket_index
    }

    pub(crate) fn into_value(self) -> Option<V> {
        self.value
    }
}

impl<V: fmt::Debug> fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("reverse_key", &format_args!("{:#010x}", self.reverse_key))
            .field("value", &self.value)
            .finish()
    }
}

/// A found or inserted entry, protected from reclamation while held.
///
/// The handle occupies a hazard record of the table. The entry stays readable
/// even if another thread removes it from the table meanwhile; its memory is
/// reclaimed only after the handle is dropped. Hold handles briefly: every
/// live handle is one more record for reclamation scans to inspect.
pub struct EntryRef<'t, V> {
    record: &'t HazardRecord<V>,
    entry: NonNull<Entry<V>>,
}

impl<'t, V> EntryRef<'t, V> {
    /// # Safety
    ///
    /// `record` must be held by the caller and publish `entry` in one of its
    /// hazard slots. Ownership of the record passes to the handle.
    pub(crate) unsafe fn new(record: &'t HazardRecord<V>, entry: NonNull<Entry<V>>) -> Self {
        Self { record, entry }
    }
}

impl<V> Deref for EntryRef<'_, V> {
    type Target = Entry<V>;

    #[inline]
    fn deref(&self) -> &Entry<V> {
        // SAFETY: the entry is published in our hazard record
        unsafe { self.entry.as_ref() }
    }
}

impl<V> Drop for EntryRef<'_, V> {
    fn drop(&mut self) {
        self.record.release();
    }
}

impl<V: fmt::Debug> fmt::Debug for EntryRef<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// NOTE: EntryRef is !Send + !Sync (NonNull). It pins a hazard record that
// other threads may claim the moment it is released.
