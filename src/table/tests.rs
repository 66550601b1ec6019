use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::*;
use crate::buffer::{PageHooks, ParentRef};
use crate::hash::KeyHash;

fn key(i: u64) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

/// A table that never splits on its own
fn single_bucket() -> HashTable {
    HashTable::new(
        HashTableConfig::new()
            .with_initial_buckets(1)
            .with_split_load_factor(1000.0),
    )
    .unwrap()
}

fn bucket_keys(table: &HashTable, bucket: u64) -> Vec<Vec<u8>> {
    table
        .snapshot_bucket(bucket)
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}

#[test]
fn test_config_validation() {
    assert!(HashTableConfig::default().validate().is_ok());
    assert_eq!(
        HashTableConfig::new().with_initial_buckets(0).validate(),
        Err(Status::InvalidArgument)
    );
    assert_eq!(
        HashTableConfig::new()
            .with_initial_buckets(HashTableConfig::MAX_INITIAL_BUCKETS + 1)
            .validate(),
        Err(Status::InvalidArgument)
    );
    for load_factor in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        assert_eq!(
            HashTableConfig::new()
                .with_split_load_factor(load_factor)
                .validate(),
            Err(Status::InvalidArgument)
        );
    }
    assert_eq!(
        HashTable::new(HashTableConfig::new().with_initial_buckets(0)).unwrap_err(),
        Status::InvalidArgument
    );
}

#[test]
fn test_new_table_publishes_all_buckets() {
    let table = HashTable::new(HashTableConfig::new().with_initial_buckets(600)).unwrap();
    assert_eq!(table.num_buckets(), 600);
    assert_eq!(table.split_state(), SplitState::initial(600));
    assert!(table.is_empty());
    assert_eq!(table.current_load_factor(), 0.0);
    // 600 bucket pages plus two directory pages
    assert_eq!(table.pool().page_count(), 602);
    for bucket in [0, 511, 512, 599] {
        assert!(bucket_keys(&table, bucket).is_empty());
    }
    assert_eq!(table.snapshot_bucket(600).unwrap(), None);
}

#[test]
fn test_basic_operations() {
    let table = HashTable::new(HashTableConfig::default()).unwrap();

    assert_eq!(table.insert(b"alpha", b"one"), Status::Ok);
    assert_eq!(table.insert(b"beta", b"two"), Status::Ok);
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(b"alpha"), Some(b"one".to_vec()));

    let mut seen = Vec::new();
    assert_eq!(table.lookup(b"beta", |p| seen = p.to_vec()), Status::Ok);
    assert_eq!(seen, b"two");
    assert_eq!(table.lookup(b"gamma", |_| panic!("absent")), Status::NotFound);

    assert_eq!(table.update(b"alpha", |p| p.copy_from_slice(b"ONE")), Status::Ok);
    assert_eq!(table.get(b"alpha"), Some(b"ONE".to_vec()));
    assert_eq!(table.update(b"gamma", |_| panic!("absent")), Status::NotFound);

    assert_eq!(table.remove(b"alpha"), Status::Ok);
    assert_eq!(table.remove(b"alpha"), Status::NotFound);
    assert_eq!(table.get(b"alpha"), None);
    assert_eq!(table.len(), 1);

    let stats = table.stats();
    assert_eq!(stats.inserts, 2);
    assert_eq!(stats.updates, 1);
    assert_eq!(stats.removes, 1);
    assert_eq!(stats.lookups, 5);
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 2);
}

#[test]
fn test_empty_key_and_payload() {
    let table = single_bucket();
    assert_eq!(table.insert(b"", b""), Status::Ok);
    assert_eq!(table.get(b""), Some(Vec::new()));
    assert_eq!(table.remove(b""), Status::Ok);
    assert!(table.is_empty());
}

#[test]
fn test_oversized_record_rejected() {
    let table = single_bucket();
    let payload = vec![0u8; MAX_RECORD_SIZE];
    assert_eq!(table.insert(b"k", &payload), Status::InvalidArgument);
    assert_eq!(table.upsert(b"k", &payload), Status::InvalidArgument);
    assert_eq!(table.insert(b"k", &payload[1..]), Status::Ok);
    assert_eq!(table.get(b"k").map(|p| p.len()), Some(MAX_RECORD_SIZE - 1));
}

#[test]
fn test_upsert_inserts_and_replaces() {
    let table = single_bucket();
    assert_eq!(table.upsert(b"k", b"short"), Status::Ok);
    assert_eq!(table.len(), 1);
    let load = table.current_load_factor();

    // Same length: overwritten in place
    assert_eq!(table.upsert(b"k", b"SHORT"), Status::Ok);
    assert_eq!(table.get(b"k"), Some(b"SHORT".to_vec()));
    assert_eq!(table.current_load_factor(), load);

    // Different length: replaced
    assert_eq!(table.upsert(b"k", b"a longer payload"), Status::Ok);
    assert_eq!(table.get(b"k"), Some(b"a longer payload".to_vec()));
    assert_eq!(table.len(), 1);
    assert!(table.current_load_factor() > load);

    assert_eq!(table.upsert(b"k", b"s"), Status::Ok);
    assert!(table.current_load_factor() < load);
    assert_eq!(table.stats().upserts, 4);
}

#[test]
fn test_load_factor_tracks_record_bytes() {
    let table = single_bucket();
    table.insert(b"1234", b"12345678");
    let expected = (4 + 8 + RECORD_SLOT_SIZE) as f64 / BUCKET_CAPACITY as f64;
    assert!((table.current_load_factor() - expected).abs() < 1e-12);
    table.remove(b"1234");
    assert_eq!(table.current_load_factor(), 0.0);
}

#[test]
fn test_overflow_path() {
    let table = single_bucket();
    let payload = [7u8; 100];
    // 116 bytes per record: 34 in the primary area, 8 per overflow page
    for i in 0..80 {
        assert_eq!(table.insert(&key(i), &payload), Status::Ok);
    }
    let stats = table.stats();
    assert!(stats.overflow_allocated >= 1);
    assert_eq!(table.overflow_store().tuple_count(), stats.overflow_allocated);

    for i in 0..80 {
        assert_eq!(table.get(&key(i)), Some(payload.to_vec()), "key {i}");
    }

    for i in 0..80 {
        assert_eq!(table.remove(&key(i)), Status::Ok);
    }
    assert!(table.is_empty());
    assert_eq!(table.overflow_store().tuple_count(), 0);
    assert_eq!(table.stats().overflow_freed, stats.overflow_allocated);
}

#[test]
fn test_update_in_overflow_page() {
    let table = single_bucket();
    let payload = [1u8; 900];
    for i in 0..6 {
        assert_eq!(table.insert(&key(i), &payload), Status::Ok);
    }
    // Records 4 and 5 live in overflow pages
    assert_eq!(table.update(&key(5), |p| p[0] = 42), Status::Ok);
    assert_eq!(table.get(&key(5)).map(|p| p[0]), Some(42));
    assert_eq!(table.upsert(&key(4), &[2u8; 900]), Status::Ok);
    assert_eq!(table.get(&key(4)), Some(vec![2u8; 900]));
}

#[test]
fn test_full_bucket_splits_to_make_room() {
    let table = single_bucket();
    let payload = [0u8; 900];
    // 916 bytes per record: 4 in the primary area, 1 per overflow page
    let full = 4 + OVERFLOW_SLOTS as u64;
    for i in 0..full {
        assert_eq!(table.insert(&key(i), &payload), Status::Ok, "key {i}");
    }
    assert_eq!(table.num_buckets(), 1);
    assert_eq!(table.overflow_store().tuple_count(), OVERFLOW_SLOTS as u64);

    // The load factor is far below the threshold; only the full bucket splits
    assert_eq!(table.insert(&key(100), &payload), Status::Ok);
    assert!(table.num_buckets() >= 2);
    assert!(table.stats().splits >= 1);
    assert_eq!(table.upsert(&key(101), &payload), Status::Ok);

    assert_eq!(table.len(), full + 2);
    for i in (0..full).chain([100, 101]) {
        assert_eq!(table.get(&key(i)), Some(payload.to_vec()), "key {i}");
    }
}

#[test]
fn test_overflow_slot_reused_after_remove() {
    let table = single_bucket();
    let payload = [3u8; 900];
    for i in 0..5 {
        table.insert(&key(i), &payload);
    }
    assert_eq!(table.stats().overflow_allocated, 1);

    assert_eq!(table.remove(&key(4)), Status::Ok);
    assert_eq!(table.stats().overflow_freed, 1);
    assert_eq!(table.insert(&key(9), &payload), Status::Ok);
    assert_eq!(table.get(&key(9)), Some(payload.to_vec()));
    assert_eq!(table.stats().overflow.slot_reuses, 1);
}

#[test]
fn test_overflow_store_full_reports_not_enough_space() {
    let table = HashTable::new(
        HashTableConfig::new()
            .with_initial_buckets(1)
            .with_split_load_factor(1000.0)
            .with_overflow(HeapConfig::new().with_growable(false)),
    )
    .unwrap();
    let payload = [0u8; 900];
    for i in 0..4 {
        assert_eq!(table.insert(&key(i), &payload), Status::Ok);
    }
    assert_eq!(table.insert(&key(4), &payload), Status::NotEnoughSpace);
    assert_eq!(table.get(&key(4)), None);
    assert_eq!(table.len(), 4);
}

#[test]
fn test_split_partitions_bucket() {
    let table = single_bucket();
    let payload = [5u8; 40];
    let keys: HashSet<Vec<u8>> = (0..200).map(key).collect();
    for k in &keys {
        assert_eq!(table.insert(k, &payload), Status::Ok);
    }
    assert!(table.stats().overflow_allocated > 0);

    assert!(table.split_one());
    assert_eq!(table.num_buckets(), 2);
    // One bucket at power 0: the single split completes the round
    assert_eq!(table.split_state(), SplitState::new(1, 2));
    assert_eq!(table.stats().rounds, 1);

    let kept = bucket_keys(&table, 0);
    let moved = bucket_keys(&table, 1);
    assert_eq!(kept.len() + moved.len(), keys.len());
    let union: HashSet<Vec<u8>> = kept.iter().chain(&moved).cloned().collect();
    assert_eq!(union, keys);
    for k in &kept {
        assert_eq!(KeyHash::of(k).bucket(1, 1), 0);
    }
    for k in &moved {
        assert_eq!(KeyHash::of(k).bucket(1, 1), 1);
    }
    for k in &keys {
        assert_eq!(table.get(k), Some(payload.to_vec()));
    }
}

#[test]
fn test_split_reuses_overflow_tuples() {
    let table = single_bucket();
    let payload = [9u8; 60];
    for i in 0..150 {
        table.insert(&key(i), &payload);
    }
    let before = table.overflow_store().tuple_count();
    assert!(before >= 2);

    assert!(table.split_one());
    let stats = table.stats();
    // Two half-full buckets need no more overflow pages than one full one
    assert!(table.overflow_store().tuple_count() <= before);
    assert!(stats.overflow_freed > 0);
    for i in 0..150 {
        assert_eq!(table.get(&key(i)), Some(payload.to_vec()));
    }
    assert_eq!(
        table.overflow_store().tuple_count(),
        stats.overflow_allocated - stats.overflow_freed
    );
}

#[test]
fn test_inserts_trigger_splits() {
    let table = HashTable::new(HashTableConfig::new().with_initial_buckets(2)).unwrap();
    let count = 5_000u64;
    for i in 0..count {
        assert_eq!(table.insert(&key(i), &i.to_le_bytes()), Status::Ok);
    }
    let stats = table.stats();
    assert!(stats.splits > 0);
    assert!(stats.rounds > 0);
    assert!(table.num_buckets() > 2);
    assert!(table.current_load_factor() <= table.config().split_load_factor + 0.01);
    assert_eq!(table.len(), count);

    // Every record sits in the bucket its key routes to
    let state = table.split_state();
    let mut total = 0;
    for bucket in 0..table.num_buckets() {
        for k in bucket_keys(&table, bucket) {
            assert_eq!(state.route(KeyHash::of(&k), 2), bucket);
            total += 1;
        }
    }
    assert_eq!(total, count);

    for i in 0..count {
        assert_eq!(table.get(&key(i)), Some(i.to_le_bytes().to_vec()));
    }
}

#[test]
fn test_table_never_shrinks() {
    let table = HashTable::new(HashTableConfig::new().with_initial_buckets(1)).unwrap();
    for i in 0..1_000 {
        table.insert(&key(i), &[0u8; 16]);
    }
    let grown = table.split_state();
    for i in 0..1_000 {
        assert_eq!(table.remove(&key(i)), Status::Ok);
    }
    assert!(table.is_empty());
    assert_eq!(table.split_state(), grown);
}

#[test]
fn test_scan_visits_every_record_once() {
    let table = HashTable::new(HashTableConfig::new().with_initial_buckets(4)).unwrap();
    let mut expected = BTreeMap::new();
    for i in 0..2_000u64 {
        table.insert(&key(i), &[i as u8; 12]);
        expected.insert(key(i), vec![i as u8; 12]);
    }

    let mut seen = BTreeMap::new();
    let status = table.scan(|k, p| {
        assert!(seen.insert(k.to_vec(), p.to_vec()).is_none());
        true
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(seen, expected);

    let mut visited = 0;
    let status = table.scan(|_, _| {
        visited += 1;
        visited < 10
    });
    assert_eq!(status, Status::Ok);
    assert_eq!(visited, 10);
}

#[test]
fn test_scan_reports_unreadable_bucket() {
    let table = single_bucket();
    for i in 0..50 {
        assert_eq!(table.insert(&key(i), &[7u8; 100]), Status::Ok);
    }
    let mut overflow = Vec::new();
    table.overflow_store().scan(|tid, _| {
        overflow.push(tid);
        true
    });
    assert!(!overflow.is_empty());

    // Drop an overflow page behind the bucket's back
    assert_eq!(table.overflow_store().remove(overflow[0]), Status::Ok);
    let mut visited = 0;
    let status = table.scan(|_, _| {
        visited += 1;
        true
    });
    assert_eq!(status, Status::NotFound);
    assert_eq!(visited, 0);
}

#[test]
fn test_concurrent_splitters_claim_distinct_buckets() {
    let base = 16u64;
    let table = HashTable::new(
        HashTableConfig::new()
            .with_initial_buckets(base)
            .with_split_load_factor(1000.0),
    )
    .unwrap();
    let count = 1_500u64;
    for i in 0..count {
        assert_eq!(table.insert(&key(i), &[4u8; 40]), Status::Ok);
    }
    assert_eq!(table.num_buckets(), base);

    // One call per bucket of the round, spread over four threads
    let splits: u64 = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| (0..base / 4).filter(|_| table.split_one()).count() as u64))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert_eq!(splits, base);
    assert_eq!(table.num_buckets(), base * 2);
    assert_eq!(table.split_state(), SplitState::initial(base).next_round());
    let stats = table.stats();
    assert_eq!(stats.splits, base);
    assert_eq!(stats.rounds, 1);
    assert_eq!(stats.splits_skipped, 0);

    let state = table.split_state();
    let mut total = 0;
    for bucket in 0..table.num_buckets() {
        for k in bucket_keys(&table, bucket) {
            assert_eq!(state.route(KeyHash::of(&k), base), bucket);
            total += 1;
        }
    }
    assert_eq!(total, count);
    for i in 0..count {
        assert_eq!(table.get(&key(i)), Some(vec![4u8; 40]));
    }
}

#[test]
fn test_scan_callback_may_reenter() {
    let table = single_bucket();
    for i in 0..10 {
        table.insert(&key(i), b"v");
    }
    table.scan(|k, _| {
        assert_eq!(table.update(k, |p| p[0] = b'w'), Status::Ok);
        true
    });
    for i in 0..10 {
        assert_eq!(table.get(&key(i)), Some(b"w".to_vec()));
    }
}

#[test]
fn test_page_hooks() {
    let table = HashTable::new(HashTableConfig::new().with_initial_buckets(3)).unwrap();
    let nodes = table.directory.node_page_ids();
    assert_eq!(nodes.len(), 1);
    let node = nodes[0];
    assert!(table.keep_in_memory(node));
    assert_eq!(table.find_parent(node), ParentRef::Root { slot: 0 });

    let mut children = Vec::new();
    table.iterate_children(node, &mut |pid| {
        children.push(pid);
        true
    });
    assert_eq!(children.len(), 3);
    for (slot, &pid) in children.iter().enumerate() {
        assert!(!table.keep_in_memory(pid));
        assert_eq!(table.find_parent(pid), ParentRef::Page { page: node, slot });
        let mut grandchildren = 0;
        table.iterate_children(pid, &mut |_| {
            grandchildren += 1;
            true
        });
        assert_eq!(grandchildren, 0);
    }
    assert_eq!(table.find_parent(u64::MAX), ParentRef::NotFound);
}

#[test]
fn test_drop_releases_pool_pages() {
    let pool = Arc::new(BufferPool::new());
    let table = HashTable::with_pool(
        Arc::clone(&pool),
        HashTableConfig::new().with_initial_buckets(8),
    )
    .unwrap();
    for i in 0..3_000 {
        table.insert(&key(i), &[1u8; 24]);
    }
    assert!(pool.page_count() > 9);
    drop(table);
    assert_eq!(pool.page_count(), 0);
}
