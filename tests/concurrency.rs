//! Multi-threaded hash table tests

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use linstore::status::Status;
use linstore::table::{HashTable, HashTableConfig};

fn key(thread: u64, i: u64) -> Vec<u8> {
    let mut key = thread.to_be_bytes().to_vec();
    key.extend_from_slice(&i.to_be_bytes());
    key
}

#[test]
fn test_fixed_key_visible_while_writers_split() {
    let table = Arc::new(HashTable::new(HashTableConfig::new().with_initial_buckets(2)).unwrap());
    assert_eq!(table.insert(b"fixed", b"always here"), Status::Ok);

    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(3));

    let writers: Vec<_> = (0..2u64)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..5_000 {
                    assert_eq!(table.insert(&key(t, i), &i.to_le_bytes()), Status::Ok);
                }
            })
        })
        .collect();

    let reader = {
        let table = Arc::clone(&table);
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut reads = 0u64;
            while !done.load(Ordering::Acquire) {
                let mut payload = Vec::new();
                assert_eq!(table.lookup(b"fixed", |p| payload = p.to_vec()), Status::Ok);
                assert_eq!(payload, b"always here");
                reads += 1;
            }
            reads
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    assert!(table.stats().splits > 0);
    assert_eq!(table.len(), 10_001);
    for t in 0..2 {
        for i in 0..5_000 {
            assert_eq!(table.get(&key(t, i)), Some(i.to_le_bytes().to_vec()));
        }
    }
}

#[test]
fn test_concurrent_mixed_operations() {
    const THREADS: u64 = 4;
    const KEYS: u64 = 2_000;

    let table = Arc::new(HashTable::new(HashTableConfig::new().with_initial_buckets(4)).unwrap());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..KEYS {
                    assert_eq!(table.insert(&key(t, i), &[t as u8; 20]), Status::Ok);
                }
                for i in (0..KEYS).step_by(2) {
                    assert_eq!(table.remove(&key(t, i)), Status::Ok);
                }
                for i in (1..KEYS).step_by(2) {
                    assert_eq!(table.upsert(&key(t, i), &[0xFF; 30]), Status::Ok);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.len(), THREADS * KEYS / 2);
    for t in 0..THREADS {
        for i in 0..KEYS {
            let expected = (i % 2 == 1).then(|| vec![0xFF; 30]);
            assert_eq!(table.get(&key(t, i)), expected);
        }
    }

    let mut scanned = 0;
    let status = table.scan(|_, payload| {
        assert_eq!(payload, [0xFF; 30]);
        scanned += 1;
        true
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(scanned, THREADS * KEYS / 2);
}

#[test]
fn test_concurrent_mid_size_inserts_split_full_buckets() {
    const THREADS: u64 = 4;
    const KEYS: u64 = 2_500;

    let table = Arc::new(HashTable::new(HashTableConfig::new().with_initial_buckets(8)).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..KEYS {
                    assert_eq!(table.insert(&key(t, i), &[t as u8; 500]), Status::Ok, "insert {t}/{i}");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = table.stats();
    assert_eq!(stats.splits_skipped, 0);
    assert_eq!(table.len(), THREADS * KEYS);
    assert_eq!(table.num_buckets(), 8 + stats.splits);
    for t in 0..THREADS {
        for i in 0..KEYS {
            assert_eq!(table.get(&key(t, i)), Some(vec![t as u8; 500]));
        }
    }
}

#[test]
fn test_concurrent_updates_to_shared_key() {
    const THREADS: u64 = 4;
    const UPDATES: u64 = 1_000;

    let table = Arc::new(HashTable::new(HashTableConfig::new().with_initial_buckets(2)).unwrap());
    table.insert(b"counter", &0u64.to_le_bytes());
    let filler = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = Arc::clone(&table);
            let filler = Arc::clone(&filler);
            thread::spawn(move || {
                for i in 0..UPDATES {
                    let status = table.update(b"counter", |p| {
                        let value = u64::from_le_bytes(p.try_into().unwrap());
                        p.copy_from_slice(&(value + 1).to_le_bytes());
                    });
                    assert_eq!(status, Status::Ok);
                    // Keep splits going underneath the updates
                    if i % 4 == 0 {
                        table.insert(&key(t + 100, i), &[0; 16]);
                        filler.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        table.get(b"counter"),
        Some((THREADS * UPDATES).to_le_bytes().to_vec())
    );
    assert_eq!(table.len(), 1 + filler.load(Ordering::Relaxed));
}

#[test]
fn test_readers_never_miss_during_growth() {
    let table = Arc::new(HashTable::new(HashTableConfig::new().with_initial_buckets(1)).unwrap());
    for i in 0..500 {
        table.insert(&key(9, i), &i.to_le_bytes());
    }
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for i in (0..500).step_by(7) {
                        assert_eq!(table.get(&key(9, i)), Some(i.to_le_bytes().to_vec()));
                    }
                }
            })
        })
        .collect();

    let writer = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            for i in 0..8_000 {
                table.insert(&key(1, i), &[3; 24]);
            }
        })
    };
    writer.join().unwrap();
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(table.stats().rounds >= 2);
}
