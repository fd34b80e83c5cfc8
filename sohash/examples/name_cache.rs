//! A name cache keyed by a 32-bit hash of the name.
//!
//! Distinct names can hash to the same key, so the table is created with
//! non-unique keys and a matcher that compares the stored name.

use sohash::{Config, SoHashTable, hash_key};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

#[derive(Debug)]
struct Name {
    path: String,
    inode: u64,
}

fn main() {
    println!("=== Split-Ordered Name Cache Demo ===\n");

    let evicted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evicted);
    let cache: Arc<SoHashTable<Name, str>> = Arc::new(
        SoHashTable::new(
            Config::<Name, str>::new()
                .keys_unique(false)
                .segment_size(Some(251))
                .matcher(|entry, path| entry.value().map(|name| name.path.as_str()) == path)
                .on_free(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
        )
        .expect("valid configuration"),
    );

    let start = Instant::now();
    let handles: Vec<_> = (0..4u64)
        .map(|dir| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for file in 0..5_000u64 {
                    let path = format!("/vob/dir{dir}/file{file}.c");
                    let name = Name {
                        path: path.clone(),
                        inode: dir * 100_000 + file,
                    };
                    let _ = cache.insert_with(hash_key(path.as_str()), name, Some(path.as_str()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    println!(
        "Cached {} names in {:?} ({} buckets)",
        cache.len(),
        start.elapsed(),
        cache.current_size()
    );

    let path = "/vob/dir2/file42.c";
    if let Some(entry) = cache.find_with(hash_key(path), Some(path)) {
        println!("{path} -> inode {}", entry.value().map_or(0, |name| name.inode));
    }

    // Evict one directory.
    for file in 0..5_000u64 {
        let path = format!("/vob/dir0/file{file}.c");
        let _ = cache.remove_with(hash_key(path.as_str()), Some(path.as_str()));
    }
    println!("After eviction: {} names", cache.len());
    println!("Stats: {:?}", cache.stats());

    cache.destroy().expect("no concurrent teardown");
    println!(
        "Destroyed, {} payloads released",
        evicted.load(Ordering::Relaxed)
    );
}
