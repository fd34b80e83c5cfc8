//! Tagged atomic pointers.
//!
//! A [`Link<T>`] is a pointer to `T` that carries a one-bit tombstone mark in
//! its lowest bit. Pointer and mark are loaded, stored and compared-and-swapped
//! together as one word, so marking a node's successor and swinging a
//! predecessor past it can never be observed half done.

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

const MARK: usize = 1;

/// Atomic pointer with a tombstone bit.
///
/// Bucket slots and `next` fields share this type so a list cursor can point
/// at either one. The all-zero bit pattern is a valid null link, which lets
/// segments be allocated zeroed.
#[repr(transparent)]
pub(crate) struct Link<T> {
    data: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send + Sync> Send for Link<T> {}
unsafe impl<T: Send + Sync> Sync for Link<T> {}

impl<T> Link<T> {
    /// Creates an unmarked link to `ptr`.
    #[cfg(test)]
    pub(crate) fn new(ptr: *mut T) -> Self {
        Self {
            data: AtomicUsize::new(ptr as usize),
            _marker: PhantomData,
        }
    }

    /// Creates a null link.
    #[inline]
    pub(crate) const fn null() -> Self {
        Self {
            data: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Marked<T> {
        Marked::from_usize(self.data.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, value: Marked<T>, order: Ordering) {
        self.data.store(value.data, order);
    }

    #[inline]
    pub(crate) fn swap(&self, value: Marked<T>, order: Ordering) -> Marked<T> {
        Marked::from_usize(self.data.swap(value.data, order))
    }

    /// Swaps `current` for `new` if the link still holds exactly `current`,
    /// mark bit included.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: Marked<T>,
        new: Marked<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Marked<T>, Marked<T>> {
        self.data
            .compare_exchange(current.data, new.data, success, failure)
            .map(Marked::from_usize)
            .map_err(Marked::from_usize)
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

/// A snapshot of a [`Link`]: pointer plus mark.
///
/// Holding a `Marked<T>` does not keep the pointee alive. Dereferencing it is
/// only sound while a hazard slot protects the pointer, or while the caller
/// owns the node outright.
pub(crate) struct Marked<T> {
    data: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> Marked<T> {
    #[inline]
    fn from_usize(data: usize) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    /// Unmarked pointer value.
    #[inline]
    pub(crate) fn new(ptr: *mut T) -> Self {
        debug_assert_eq!(ptr as usize & MARK, 0, "unaligned node pointer");
        Self::from_usize(ptr as usize)
    }

    #[inline]
    pub(crate) fn null() -> Self {
        Self::from_usize(0)
    }

    /// The pointer with the mark stripped.
    #[inline]
    pub(crate) fn ptr(self) -> *mut T {
        (self.data & !MARK) as *mut T
    }

    #[inline]
    pub(crate) fn is_null(self) -> bool {
        self.ptr().is_null()
    }

    #[inline]
    pub(crate) fn is_marked(self) -> bool {
        self.data & MARK != 0
    }

    /// Same pointer with the tombstone set.
    #[inline]
    pub(crate) fn with_mark(self) -> Self {
        Self::from_usize(self.data | MARK)
    }

    /// Same pointer with the tombstone cleared.
    #[cfg(test)]
    pub(crate) fn without_mark(self) -> Self {
        Self::from_usize(self.data & !MARK)
    }

    /// Converts to a shared reference.
    ///
    /// # Safety
    ///
    /// The pointer must be protected by a hazard slot or otherwise known not
    /// to be reclaimed for `'a`.
    #[inline]
    pub(crate) unsafe fn as_ref<'a>(self) -> Option<&'a T> {
        // SAFETY: caller guarantees the pointee is live for 'a
        unsafe { self.ptr().as_ref() }
    }
}

impl<T> Clone for Marked<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Marked<T> {}

impl<T> PartialEq for Marked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T> Eq for Marked<T> {}

impl<T> fmt::Debug for Marked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_marked() {
            write!(f, "Marked({:p}, deleted)", self.ptr())
        } else {
            write!(f, "Marked({:p})", self.ptr())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_roundtrip() {
        let raw = Box::into_raw(Box::new(7u64));
        let link = Link::new(raw);

        let cur = link.load(Ordering::Acquire);
        assert!(!cur.is_marked());
        assert_eq!(cur.ptr(), raw);

        assert!(
            link.compare_exchange(cur, cur.with_mark(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        );
        let marked = link.load(Ordering::Acquire);
        assert!(marked.is_marked());
        assert_eq!(marked.ptr(), raw);

        // An unmarked expectation no longer matches.
        assert!(
            link.compare_exchange(cur, Marked::null(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        );
        assert_eq!(marked.without_mark(), cur);

        unsafe { drop(Box::from_raw(raw)) };
    }

    #[test]
    fn test_null_link() {
        let link: Link<u64> = Link::default();
        assert!(link.load(Ordering::Relaxed).is_null());
        assert!(Marked::<u64>::null().with_mark().is_null());
    }
}
