//! Table configuration.

use core::fmt;

use tracing::error;

use crate::entry::Entry;
use crate::error::{Result, SoHashError};
use crate::list::MatchFn;

/// Bucket count of a new table.
pub const INITIAL_SIZE: u32 = 2;
/// Segments in the bucket directory unless configured.
pub const DEFAULT_SEGMENT_COUNT: usize = 511;
/// Buckets per segment unless configured.
pub const DEFAULT_SEGMENT_SIZE: usize = 511;
/// Smallest accepted segment count.
pub const MIN_SEGMENT_COUNT: usize = 1;
/// Smallest accepted segment size.
pub const MIN_SEGMENT_SIZE: usize = 251;
/// Average entries per bucket tolerated before the table doubles.
pub const DEFAULT_MAX_LOAD: usize = 1;

/// Buckets are addressed with 32-bit indices and the bucket count is a power
/// of two, so the directory never needs more than this.
const MAX_CAPACITY: usize = 1 << 31;

pub(crate) type FreeFn<V> = dyn Fn(V) + Send + Sync;
pub(crate) type DeleteFn<V> = dyn Fn(&Entry<V>) + Send + Sync;

/// Caller callbacks of a table.
pub(crate) struct Hooks<V, A: ?Sized> {
    pub(crate) on_free: Option<Box<FreeFn<V>>>,
    pub(crate) matcher: Option<Box<MatchFn<V, A>>>,
    pub(crate) on_delete: Option<Box<DeleteFn<V>>>,
}

/// Builder for [`SoHashTable`](crate::SoHashTable).
///
/// ```
/// use sohash::{Config, SoHashTable};
///
/// let table: SoHashTable<String, str> = SoHashTable::new(
///     Config::new()
///         .keys_unique(false)
///         .segment_size(Some(251))
///         .matcher(|entry, name| entry.value().map(String::as_str) == name),
/// )
/// .unwrap();
/// # drop(table);
/// ```
pub struct Config<V, A: ?Sized = ()> {
    pub(crate) segment_count: Option<usize>,
    pub(crate) segment_size: Option<usize>,
    pub(crate) keys_unique: bool,
    pub(crate) max_load: usize,
    pub(crate) max_allocations: Option<usize>,
    pub(crate) hooks: Hooks<V, A>,
}

impl<V, A: ?Sized> Default for Config<V, A> {
    fn default() -> Self {
        Self {
            segment_count: None,
            segment_size: None,
            keys_unique: true,
            max_load: DEFAULT_MAX_LOAD,
            max_allocations: None,
            hooks: Hooks {
                on_free: None,
                matcher: None,
                on_delete: None,
            },
        }
    }
}

impl<V, A: ?Sized> Config<V, A> {
    /// Defaults: 511 segments of 511 buckets, unique keys, max load 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments in the bucket directory. `None` keeps the default.
    pub fn segment_count(mut self, count: Option<usize>) -> Self {
        self.segment_count = count;
        self
    }

    /// Buckets per segment. `None` keeps the default.
    pub fn segment_size(mut self, size: Option<usize>) -> Self {
        self.segment_size = size;
        self
    }

    /// Whether two entries may share a key. Tables with non-unique keys need
    /// a [`matcher`](Config::matcher).
    pub fn keys_unique(mut self, unique: bool) -> Self {
        self.keys_unique = unique;
        self
    }

    /// Average entries per bucket above which the table doubles.
    pub fn max_load(mut self, load: usize) -> Self {
        self.max_load = load;
        self
    }

    /// Caps the number of simultaneously live nodes, segments and hazard
    /// records. Allocations past the cap fail with
    /// [`ResourceExhausted`](SoHashError::ResourceExhausted).
    pub fn max_allocations(mut self, limit: Option<usize>) -> Self {
        self.max_allocations = limit;
        self
    }

    /// Receives every payload the table discards: rejected duplicates and
    /// reclaimed entries. Without it payloads are dropped.
    pub fn on_free<F>(mut self, f: F) -> Self
    where
        F: Fn(V) + Send + Sync + 'static,
    {
        self.hooks.on_free = Some(Box::new(f));
        self
    }

    /// Decides whether an entry with an equal key is the one the caller
    /// means. Gets the argument passed to the `_with` operations.
    pub fn matcher<F>(mut self, f: F) -> Self
    where
        F: Fn(&Entry<V>, Option<&A>) -> bool + Send + Sync + 'static,
    {
        self.hooks.matcher = Some(Box::new(f));
        self
    }

    /// Runs on every removed entry after it is unlinked and before it is
    /// queued for reclamation.
    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Entry<V>) + Send + Sync + 'static,
    {
        self.hooks.on_delete = Some(Box::new(f));
        self
    }

    pub(crate) fn resolved_segment_count(&self) -> usize {
        self.segment_count.unwrap_or(DEFAULT_SEGMENT_COUNT)
    }

    pub(crate) fn resolved_segment_size(&self) -> usize {
        self.segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let reason = if self.resolved_segment_count() < MIN_SEGMENT_COUNT {
            Some("segment count below minimum")
        } else if self.resolved_segment_size() < MIN_SEGMENT_SIZE {
            Some("segment size below minimum")
        } else if self
            .resolved_segment_count()
            .checked_mul(self.resolved_segment_size())
            .is_none_or(|capacity| capacity > MAX_CAPACITY)
        {
            Some("directory addresses more than 2^31 buckets")
        } else if self.max_load == 0 {
            Some("max load must be at least 1")
        } else if !self.keys_unique && self.hooks.matcher.is_none() {
            Some("non-unique keys need a matcher")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                error!(reason, "invalid table configuration");
                Err(SoHashError::ConfigInvalid(reason))
            }
            None => Ok(()),
        }
    }
}

impl<V, A: ?Sized> fmt::Debug for Config<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("segment_count", &self.resolved_segment_count())
            .field("segment_size", &self.resolved_segment_size())
            .field("keys_unique", &self.keys_unique)
            .field("max_load", &self.max_load)
            .field("max_allocations", &self.max_allocations)
            .field("on_free", &self.hooks.on_free.is_some())
            .field("matcher", &self.hooks.matcher.is_some())
            .field("on_delete", &self.hooks.on_delete.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::<u64>::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolved_segment_count(), 511);
        assert_eq!(config.resolved_segment_size(), 511);
    }

    #[test]
    fn test_minimums() {
        let small = Config::<u64>::new().segment_size(Some(250));
        assert_eq!(
            small.validate(),
            Err(SoHashError::ConfigInvalid("segment size below minimum"))
        );
        let empty = Config::<u64>::new().segment_count(Some(0));
        assert!(matches!(empty.validate(), Err(SoHashError::ConfigInvalid(_))));
        assert!(Config::<u64>::new().max_load(0).validate().is_err());
    }

    #[test]
    fn test_oversized_directory() {
        let config = Config::<u64>::new()
            .segment_count(Some(1 << 20))
            .segment_size(Some(1 << 12));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_unique_requires_matcher() {
        let config = Config::<u64, u64>::new().keys_unique(false);
        assert_eq!(
            config.validate(),
            Err(SoHashError::ConfigInvalid("non-unique keys need a matcher"))
        );
        let config = config.matcher(|entry, arg| entry.value() == arg);
        assert!(config.validate().is_ok());
    }
}
