use core::fmt;

use thiserror::Error;

use crate::entry::EntryRef;

/// Errors returned by table operations.
///
/// Broken internal invariants are not represented here. They abort the
/// current thread with a panic instead of being reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoHashError {
    /// The configuration passed to [`SoHashTable::new`](crate::SoHashTable::new)
    /// is missing a mandatory callback or has an out-of-range parameter.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(&'static str),
    /// An allocation failed while creating a node, segment or hazard record.
    #[error("out of memory allocating {0}")]
    ResourceExhausted(&'static str),
    /// The table is being torn down.
    #[error("table is busy")]
    Busy,
    /// The table has already been torn down.
    #[error("table is not in a valid state for this operation")]
    InvalidState,
    /// An entry with the same key (and matching caller argument) exists.
    #[error("key already exists")]
    AlreadyExists,
    /// No entry with the given key (and matching caller argument) exists.
    #[error("key not found")]
    NotFound,
}

/// Result type for table operations.
pub type Result<T> = core::result::Result<T, SoHashError>;

/// Failure of [`SoHashTable::insert`](crate::SoHashTable::insert).
///
/// `Busy` and `ResourceExhausted` hand the rejected payload back: the caller
/// still owns it. `AlreadyExists` carries the entry that won; the rejected
/// payload has already been passed to the table's free callback.
#[derive(Error)]
pub enum InsertError<'t, V> {
    /// The table is not active.
    #[error("table is busy")]
    Busy(V),
    /// Allocating the node, a segment or a hazard record failed.
    #[error("out of memory allocating {what}")]
    ResourceExhausted {
        /// The payload that could not be stored.
        value: V,
        /// What could not be allocated.
        what: &'static str,
    },
    /// An entry with the same key already exists.
    #[error("key already exists")]
    AlreadyExists(EntryRef<'t, V>),
}

impl<'t, V> InsertError<'t, V> {
    /// The plain error kind, without payload or entry.
    pub fn kind(&self) -> SoHashError {
        match self {
            InsertError::Busy(_) => SoHashError::Busy,
            InsertError::ResourceExhausted { what, .. } => SoHashError::ResourceExhausted(*what),
            InsertError::AlreadyExists(_) => SoHashError::AlreadyExists,
        }
    }

    /// Takes back the rejected payload, if the caller still owns it.
    pub fn into_value(self) -> Option<V> {
        match self {
            InsertError::Busy(value) | InsertError::ResourceExhausted { value, .. } => Some(value),
            InsertError::AlreadyExists(_) => None,
        }
    }

    /// The entry that already holds the key, for `AlreadyExists`.
    pub fn existing(&self) -> Option<&EntryRef<'t, V>> {
        match self {
            InsertError::AlreadyExists(entry) => Some(entry),
            _ => None,
        }
    }
}

impl<V> fmt::Debug for InsertError<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::Busy(_) => f.write_str("Busy(..)"),
            InsertError::ResourceExhausted { what, .. } => f
                .debug_struct("ResourceExhausted")
                .field("what", what)
                .finish_non_exhaustive(),
            InsertError::AlreadyExists(entry) => f
                .debug_tuple("AlreadyExists")
                .field(&entry.key())
                .finish(),
        }
    }
}
