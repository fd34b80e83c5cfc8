//! Two-level bucket directory.
//!
//! The directory is a fixed array of segment pointers; each segment is a
//! lazily allocated array of bucket slots. A slot is either null or points at
//! the sentinel that starts its bucket in the shared list. Segments and slots
//! are only ever filled in with a compare-and-swap from null, so racing
//! initializers agree on a single winner.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use tracing::trace;

use crate::alloc::Tracker;
use crate::entry::Entry;
use crate::error::{Result, SoHashError};
use crate::link::Link;

pub(crate) type Bucket<V> = Link<Entry<V>>;

pub(crate) struct Directory<V> {
    segments: Box<[AtomicPtr<Bucket<V>>]>,
    segment_size: usize,
}

impl<V> Directory<V> {
    pub(crate) fn new(segment_count: usize, segment_size: usize) -> Result<Self> {
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(segment_count)
            .map_err(|_| SoHashError::ResourceExhausted("segment directory"))?;
        segments.resize_with(segment_count, || AtomicPtr::new(ptr::null_mut()));
        Ok(Self {
            segments: segments.into_boxed_slice(),
            segment_size,
        })
    }

    #[inline]
    pub(crate) fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Number of buckets the directory can address.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.segments.len() * self.segment_size
    }

    #[inline]
    fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / self.segment_size, index % self.segment_size)
    }

    /// The slot for bucket `index`, if its segment exists.
    pub(crate) fn slot(&self, index: u32) -> Option<&Bucket<V>> {
        let (segment, offset) = self.locate(index);
        let base = self.segments.get(segment)?.load(Ordering::Acquire);
        // SAFETY: segments hold `segment_size` slots and live as long as the
        // directory's owner is not torn down
        unsafe { base.as_ref().map(|_| &*base.add(offset)) }
    }

    /// The slot for bucket `index`, if the bucket has been initialized.
    #[inline]
    pub(crate) fn bucket(&self, index: u32) -> Option<&Bucket<V>> {
        self.slot(index)
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
    }

    /// The slot for bucket `index`, allocating its segment if needed.
    pub(crate) fn slot_or_alloc(&self, index: u32, tracker: &Tracker) -> Result<&Bucket<V>> {
        let (segment, offset) = self.locate(index);
        let Some(entry) = self.segments.get(segment) else {
            return Err(SoHashError::ResourceExhausted("bucket segment"));
        };

        let mut base = entry.load(Ordering::Acquire);
        if base.is_null() {
            let fresh = tracker.alloc_zeroed_slice::<Bucket<V>>(self.segment_size, "bucket segment")?;
            match entry.compare_exchange(
                ptr::null_mut(),
                fresh.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(segment, "segment allocated");
                    base = fresh.as_ptr();
                }
                Err(winner) => {
                    // SAFETY: never published
                    unsafe { tracker.free_slice(fresh, self.segment_size) };
                    base = winner;
                }
            }
        }
        // SAFETY: base points at a live segment of `segment_size` slots
        Ok(unsafe { &*base.add(offset) })
    }

    /// Frees every segment.
    ///
    /// # Safety
    ///
    /// No slot may be used afterwards.
    pub(crate) unsafe fn free_segments(&self, tracker: &Tracker) {
        for entry in self.segments.iter() {
            let base = entry.swap(ptr::null_mut(), Ordering::AcqRel);
            if let Some(base) = NonNull::new(base) {
                // SAFETY: allocated by slot_or_alloc with this size
                unsafe { tracker.free_slice(base, self.segment_size) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Marked;

    #[test]
    fn test_lazy_segments() {
        let tracker = Tracker::new(None);
        let dir = Directory::<u32>::new(4, 251).unwrap();
        assert_eq!(dir.capacity(), 1004);
        assert!(dir.slot(300).is_none());

        let slot = dir.slot_or_alloc(300, &tracker).unwrap();
        assert!(slot.load(Ordering::Relaxed).is_null());
        assert_eq!(tracker.live(), 1);
        assert!(dir.slot(251).is_some());
        assert!(dir.bucket(300).is_none());

        // Same segment, no new allocation.
        dir.slot_or_alloc(260, &tracker).unwrap();
        assert_eq!(tracker.live(), 1);

        unsafe { dir.free_segments(&tracker) };
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_bucket_requires_published_sentinel() {
        let tracker = Tracker::new(None);
        let dir = Directory::<u32>::new(1, 251).unwrap();
        let sentinel = tracker.alloc(Entry::sentinel(3, 251), "sentinel").unwrap();

        let slot = dir.slot_or_alloc(3, &tracker).unwrap();
        slot.store(Marked::new(sentinel.as_ptr()), Ordering::Release);
        let bucket = dir.bucket(3).unwrap();
        assert_eq!(bucket.load(Ordering::Acquire).ptr(), sentinel.as_ptr());

        unsafe {
            dir.free_segments(&tracker);
            drop(tracker.free(sentinel));
        }
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_out_of_range_index() {
        let tracker = Tracker::new(None);
        let dir = Directory::<u32>::new(1, 251).unwrap();
        assert!(dir.slot(251).is_none());
        assert_eq!(
            dir.slot_or_alloc(251, &tracker).unwrap_err(),
            SoHashError::ResourceExhausted("bucket segment")
        );
    }
}
