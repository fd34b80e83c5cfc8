use rand::Rng;
use sohash::{Config, InsertError, SoHashTable};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Payload that can tell when it is read after being freed.
#[derive(Debug)]
struct Tagged {
    key: u32,
    seal: u64,
}

fn seal(key: u32) -> u64 {
    u64::from(key).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ 0x5eed
}

impl Tagged {
    fn new(key: u32) -> Self {
        Self {
            key,
            seal: seal(key),
        }
    }

    fn verify(&self, key: u32) {
        assert_eq!(self.key, key, "payload of another key");
        assert_eq!(self.seal, seal(key), "payload corrupted, read after free?");
    }
}

fn counting_table<V: Send + Sync + 'static>(freed: &Arc<AtomicUsize>) -> SoHashTable<V> {
    let freed = Arc::clone(freed);
    SoHashTable::new(Config::new().on_free(move |_| {
        freed.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap()
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_same_key_race_has_one_winner() {
    for _ in 0..200 {
        let frees: Arc<[AtomicUsize; 2]> = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
        let counts = Arc::clone(&frees);
        let table: Arc<SoHashTable<usize>> = Arc::new(
            SoHashTable::new(Config::new().on_free(move |id: usize| {
                counts[id].fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap(),
        );
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2usize)
            .map(|id| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    match table.insert(77, id) {
                        Ok(entry) => {
                            assert_eq!(entry.value(), Some(&id));
                            None
                        }
                        Err(InsertError::AlreadyExists(winner)) => Some(*winner.value().unwrap()),
                        Err(other) => panic!("unexpected insert failure: {other:?}"),
                    }
                })
            })
            .collect();

        let outcomes: Vec<Option<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<usize> = (0..2).filter(|&id| outcomes[id].is_none()).collect();
        assert_eq!(winners.len(), 1, "exactly one insert must succeed");
        let winner = winners[0];
        let loser = 1 - winner;
        assert_eq!(outcomes[loser], Some(winner), "loser must see the winner's entry");

        // Only the loser's payload is gone so far.
        assert_eq!(frees[loser].load(Ordering::SeqCst), 1);
        assert_eq!(frees[winner].load(Ordering::SeqCst), 0);

        drop(Arc::try_unwrap(table).ok().unwrap());
        assert_eq!(frees[0].load(Ordering::SeqCst), 1);
        assert_eq!(frees[1].load(Ordering::SeqCst), 1);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_disjoint_inserts_then_destroy() {
    let table = Arc::new(
        SoHashTable::<u64>::new(Config::new().segment_size(Some(251)).segment_count(Some(64)))
            .unwrap(),
    );

    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for key in t * 625..(t + 1) * 625 {
                    table.insert(key, u64::from(key)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(table.len(), 5000);
    for key in (0..5000u32).step_by(37) {
        assert_eq!(table.get(key), Some(u64::from(key)));
    }

    table.destroy().unwrap();
    assert_eq!(table.len(), 0);
    assert_eq!(table.allocated(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_destroy_races_insert() {
    const KEYS: u32 = 2000;

    for round in 0..50 {
        let frees: Arc<Vec<AtomicUsize>> = Arc::new((0..KEYS).map(|_| AtomicUsize::new(0)).collect());
        let counts = Arc::clone(&frees);
        let table: Arc<SoHashTable<u32>> = Arc::new(
            SoHashTable::new(Config::new().on_free(move |key: u32| {
                counts[key as usize].fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap(),
        );

        let inserter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let mut inserted = 0;
                for key in 0..KEYS {
                    match table.insert(key, key) {
                        Ok(_) => {
                            assert_eq!(inserted, key, "insert succeeded after a rejection");
                            inserted += 1;
                        }
                        Err(InsertError::Busy(value)) => assert_eq!(value, key),
                        Err(other) => panic!("unexpected insert failure: {other:?}"),
                    }
                }
                inserted
            })
        };

        // Let the inserter get a varying head start.
        for _ in 0..round * 20 {
            thread::yield_now();
        }
        table.destroy().unwrap();
        let inserted = inserter.join().unwrap();

        drop(Arc::try_unwrap(table).ok().unwrap());
        for key in 0..KEYS {
            let expected = usize::from(key < inserted);
            assert_eq!(
                frees[key as usize].load(Ordering::SeqCst),
                expected,
                "payload {key} (inserted {inserted})"
            );
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_random_operations() {
    const THREADS: usize = 8;
    const KEYS: u32 = 512;
    const OPS: usize = 20_000;

    let freed = Arc::new(AtomicUsize::new(0));
    let table: Arc<SoHashTable<Tagged>> = Arc::new(counting_table(&freed));
    let stored = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            let stored = Arc::clone(&stored);
            let rejected = Arc::clone(&rejected);
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..OPS {
                    let key = rng.random_range(0..KEYS);
                    match rng.random_range(0..10) {
                        0..=3 => match table.insert(key, Tagged::new(key)) {
                            Ok(entry) => {
                                entry.value().unwrap().verify(key);
                                stored.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(InsertError::AlreadyExists(existing)) => {
                                existing.value().unwrap().verify(key);
                                rejected.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(other) => panic!("unexpected insert failure: {other:?}"),
                        },
                        4..=5 => {
                            let _ = table.remove(key);
                        }
                        _ => {
                            if let Some(entry) = table.find(key) {
                                assert_eq!(entry.key(), key);
                                entry.value().unwrap().verify(key);
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(table.len() <= KEYS as usize);
    assert!(table.current_size().is_power_of_two());
    let total = stored.load(Ordering::SeqCst) + rejected.load(Ordering::SeqCst);

    drop(Arc::try_unwrap(table).ok().unwrap());
    assert_eq!(freed.load(Ordering::SeqCst), total);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_readers_hold_handles_under_churn() {
    let table = Arc::new(SoHashTable::<Tagged>::new(Config::new()).unwrap());
    for key in 0..64 {
        table.insert(key, Tagged::new(key)).unwrap();
    }
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = vec![];
    for _ in 0..4 {
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            while !stop.load(Ordering::Relaxed) {
                let key = rng.random_range(0..64);
                if let Some(entry) = table.find(key) {
                    for _ in 0..16 {
                        thread::yield_now();
                        entry.value().unwrap().verify(key);
                    }
                }
            }
        }));
    }
    for t in 0..2u32 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            for round in 0..2000u32 {
                let key = (round * 2 + t) % 64;
                if table.remove(key).is_ok() {
                    let _ = table.insert(key, Tagged::new(key));
                }
            }
        }));
    }

    let writers: Vec<_> = handles.drain(4..).collect();
    for h in writers {
        h.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.join().unwrap();
    }
    assert!(table.stats().scans > 0);
    assert_eq!(table.len(), 64);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_bucket_initialization_converges() {
    for _ in 0..50 {
        let table = Arc::new(SoHashTable::<u32>::new(Config::new()).unwrap());
        // Multiples of 1024 all land in bucket 0 while the table grows to 64.
        for i in 0..64u32 {
            table.insert(i * 1024, i).unwrap();
        }
        assert_eq!(table.current_size(), 64);
        assert_eq!(table.sentinel_count(), 1);

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    assert!(table.find(63).is_none());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // 63, 31, 15, 7, 3, 1 and the root.
        assert_eq!(table.sentinel_count(), 7);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_size_never_shrinks() {
    let table = Arc::new(SoHashTable::<u32>::new(Config::new()).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let watcher = {
        let table = Arc::clone(&table);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = table.current_size();
            while !done.load(Ordering::Relaxed) {
                let size = table.current_size();
                assert!(size >= last, "size went from {last} to {size}");
                assert!(size.is_power_of_two());
                last = size;
            }
        })
    };

    let writers: Vec<_> = (0..4u32)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for key in (0..4000u32).filter(|k| k % 4 == t) {
                    table.insert(key, key).unwrap();
                    if key % 3 == 0 {
                        table.remove(key).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in writers {
        h.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    watcher.join().unwrap();

    let expected = (0..4000u32).filter(|k| k % 3 != 0).count();
    assert_eq!(table.len(), expected);
}
