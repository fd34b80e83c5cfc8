//! Fallible, counted allocation.
//!
//! Every node, segment and hazard record of a table is allocated here. Running
//! out of memory (or out of the table's allocation budget) is reported as
//! [`SoHashError::ResourceExhausted`] instead of aborting, and the number of
//! live allocations is tracked so teardown can be checked for leaks.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use tracing::warn;

use crate::error::{Result, SoHashError};

#[cfg(debug_assertions)]
const POISON: u8 = 0xa5;

pub(crate) struct Tracker {
    live: CachePadded<AtomicUsize>,
    limit: usize,
}

impl Tracker {
    /// `limit` caps the number of simultaneously live allocations.
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            live: CachePadded::new(AtomicUsize::new(0)),
            limit: limit.unwrap_or(usize::MAX),
        }
    }

    /// Number of live allocations.
    #[inline]
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn reserve(&self, what: &'static str) -> Result<()> {
        let prev = self.live.fetch_add(1, Ordering::AcqRel);
        if prev >= self.limit {
            self.live.fetch_sub(1, Ordering::AcqRel);
            warn!(what, limit = self.limit, "allocation budget exhausted");
            return Err(SoHashError::ResourceExhausted(what));
        }
        Ok(())
    }

    fn unreserve(&self) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allocation counter underflow");
    }

    /// Moves `value` to the heap.
    pub(crate) fn alloc<T>(&self, value: T, what: &'static str) -> Result<NonNull<T>> {
        let ptr = self.alloc_uninit::<T>(what)?;
        // SAFETY: freshly allocated for T
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Reserves memory for one `T` without initializing it.
    ///
    /// Lets callers keep ownership of what they were going to store when the
    /// allocation fails. The pointer must be written before it is freed.
    pub(crate) fn alloc_uninit<T>(&self, what: &'static str) -> Result<NonNull<T>> {
        let layout = Layout::new::<T>();
        debug_assert!(layout.size() > 0);
        self.reserve(what)?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc(layout) } as *mut T;
        match NonNull::new(raw) {
            Some(ptr) => Ok(ptr),
            None => {
                self.unreserve();
                warn!(what, size = layout.size(), "allocation failed");
                Err(SoHashError::ResourceExhausted(what))
            }
        }
    }

    /// Moves the value back off the heap and releases its memory.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Tracker::alloc`] on this tracker and must not be
    /// used afterwards.
    pub(crate) unsafe fn free<T>(&self, ptr: NonNull<T>) -> T {
        // SAFETY: caller guarantees ptr is a live allocation we own
        let value = unsafe { ptr.as_ptr().read() };
        // Stale readers of a reclaimed node see garbage, not plausible keys.
        #[cfg(debug_assertions)]
        unsafe {
            ptr.as_ptr().cast::<u8>().write_bytes(POISON, size_of::<T>())
        };
        unsafe { alloc::dealloc(ptr.as_ptr().cast(), Layout::new::<T>()) };
        self.unreserve();
        value
    }

    /// Allocates `len` zeroed elements.
    ///
    /// Only for types whose all-zero bit pattern is a valid value.
    pub(crate) fn alloc_zeroed_slice<T>(&self, len: usize, what: &'static str) -> Result<NonNull<T>> {
        let layout =
            Layout::array::<T>(len).map_err(|_| SoHashError::ResourceExhausted(what))?;
        debug_assert!(layout.size() > 0);
        self.reserve(what)?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) } as *mut T;
        match NonNull::new(raw) {
            Some(ptr) => Ok(ptr),
            None => {
                self.unreserve();
                warn!(what, len, "zeroed allocation failed");
                Err(SoHashError::ResourceExhausted(what))
            }
        }
    }

    /// Releases a slice from [`Tracker::alloc_zeroed_slice`] without running
    /// element destructors.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must match a previous `alloc_zeroed_slice` call.
    pub(crate) unsafe fn free_slice<T>(&self, ptr: NonNull<T>, len: usize) {
        // SAFETY: the same layout was validated by `Layout::array` at allocation
        let layout = unsafe {
            Layout::from_size_align_unchecked(size_of::<T>() * len, align_of::<T>())
        };
        // SAFETY: caller guarantees ptr/len match the allocation
        unsafe { alloc::dealloc(ptr.as_ptr().cast(), layout) };
        self.unreserve();
    }
}
