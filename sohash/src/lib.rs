//! Sohash: a resizable, non-blocking hash table built on split-ordered lists.
//!
//! All entries live in one lock-free linked list sorted by the bit-reversed
//! key. Buckets are shortcuts into that list: each points at a sentinel node
//! that marks where its keys start. Doubling the table never moves an entry;
//! new buckets are created lazily by splicing a sentinel in front of the keys
//! they take over from their parent bucket.
//!
//! Unlinked nodes are reclaimed with hazard pointers owned by each table, so
//! independent tables share no global state.
//!
//! # Key Features
//!
//! - **Non-blocking**: inserts, lookups and removals never take a lock.
//! - **Incremental growth**: one CAS doubles the table; buckets fill in on use.
//! - **Handles**: lookups return an [`EntryRef`] that keeps the entry readable
//!   even if it is removed concurrently.
//! - **Fallible**: allocation failure is an error, not an abort.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use sohash::{Config, SoHashTable};
//!
//! let table = Arc::new(SoHashTable::<u64>::new(Config::new()).unwrap());
//!
//! let handles: Vec<_> = (0..4u32)
//!     .map(|t| {
//!         let table = Arc::clone(&table);
//!         thread::spawn(move || {
//!             for key in t * 100..(t + 1) * 100 {
//!                 table.insert(key, u64::from(key) * 2).unwrap();
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(table.len(), 400);
//! assert_eq!(table.find(123).unwrap().value(), Some(&246));
//! table.destroy().unwrap();
//! ```
//!
//! # Non-unique keys
//!
//! Tables keyed by [`hash_key`] may see distinct values fold onto one key.
//! Such tables are created with `keys_unique(false)` and a matcher that
//! compares the real value, passed through the `_with` operations.

#![warn(missing_docs)]

mod alloc;
mod config;
mod entry;
mod error;
mod hazard;
mod key;
mod link;
mod list;
mod reclaim;
mod segment;
mod stats;
mod table;

pub use config::{
    Config, DEFAULT_MAX_LOAD, DEFAULT_SEGMENT_COUNT, DEFAULT_SEGMENT_SIZE, INITIAL_SIZE,
    MIN_SEGMENT_COUNT, MIN_SEGMENT_SIZE,
};
pub use entry::{Entry, EntryKind, EntryRef};
pub use error::{InsertError, Result, SoHashError};
pub use key::{ReverseKey, SoKey, hash_key, regular_key, reverse_bits, sentinel_key, unset_msb};
pub use stats::Stats;
pub use table::{SoHashTable, TableState};
