use core::sync::atomic::Ordering;

use portable_atomic::AtomicU64;

/// Running totals kept by a table.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) scans: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
    pub(crate) restarts: AtomicU64,
    pub(crate) resizes: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            scans: self.scans.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a table's counters.
///
/// Counters are updated with relaxed ordering and read one by one, so a
/// snapshot taken under load is only approximately consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Reclamation scans run.
    pub scans: u64,
    /// Nodes freed by scans and by teardown.
    pub reclaimed: u64,
    /// List traversals restarted after losing a race.
    pub restarts: u64,
    /// Times the bucket count doubled.
    pub resizes: u64,
}
