//! Crate-level scenario tests.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use crate::keys::{box_key, KeyOps};
use crate::map::Map;
use crate::sentinel::MATCH_ANY;
use crate::table::BLOCK_SIZE;

/// Cook a distinctive value pointer.
///
/// Values are opaque to the map, so tests can use any non-null address that stays clear of the
/// tag pointers.
fn value(n: usize) -> *mut u8 {
    (0x1000 + n * 8) as *mut u8
}

/// A borrowable probe key for `get`.
fn probe(key: &u64) -> *const u8 {
    key as *const u64 as *const u8
}

#[test]
fn singleton() {
    unsafe {
        let map = Map::new(KeyOps::boxed::<u64>());
        let k = 1u64;

        assert!(map.put_if(box_key(1u64), value(1), MATCH_ANY).is_null());
        assert_eq!(map.get(probe(&k)), value(1));

        assert_eq!(map.put_if(box_key(1u64), value(2), value(1)), value(1));
        assert_eq!(map.get(probe(&k)), value(2));

        assert_eq!(map.put_if(box_key(1u64), ptr::null_mut(), MATCH_ANY), value(2));
        assert!(map.get(probe(&k)).is_null());
        assert_eq!(map.size(), 0);
    }
}

#[test]
fn cas_miss() {
    unsafe {
        let map = Map::new(KeyOps::boxed::<u64>());
        let k = 7u64;

        assert!(map.put_if(box_key(7u64), value(1), MATCH_ANY).is_null());
        // The expected prior does not match, so nothing changes.
        assert_eq!(map.put_if(box_key(7u64), value(3), value(2)), value(1));
        assert_eq!(map.get(probe(&k)), value(1));
        assert_eq!(map.size(), 1);
    }
}

#[test]
fn cas_chain() {
    unsafe {
        let map = Map::new(KeyOps::boxed::<u64>());
        let k = 3u64;

        assert!(map.put_if(box_key(3u64), value(1), MATCH_ANY).is_null());
        assert_eq!(map.put_if(box_key(3u64), value(2), value(1)), value(1));
        // Expecting the value before last fails and leaves the mapping alone.
        assert_eq!(map.put_if(box_key(3u64), value(3), value(1)), value(2));
        assert_eq!(map.get(probe(&k)), value(2));
    }
}

#[test]
fn insert_if_absent() {
    unsafe {
        let map = Map::new(KeyOps::boxed::<u64>());
        let k = 5u64;

        // Null as the expected prior means "only when absent".
        assert!(map.put_if(box_key(5u64), value(1), ptr::null_mut()).is_null());
        assert_eq!(map.put_if(box_key(5u64), value(2), ptr::null_mut()), value(1));
        assert_eq!(map.get(probe(&k)), value(1));
    }
}

#[test]
fn reinsert_is_idempotent() {
    unsafe {
        let map = Map::new(KeyOps::boxed::<u64>());
        let k = 9u64;

        assert!(map.insert(box_key(9u64), value(1)).is_null());
        assert_eq!(map.insert(box_key(9u64), value(1)), value(1));
        assert_eq!(map.get(probe(&k)), value(1));
        assert_eq!(map.size(), 1);

        // Deleting twice nets out to a single delete.
        assert_eq!(map.remove(box_key(9u64)), value(1));
        assert!(map.remove(box_key(9u64)).is_null());
        assert_eq!(map.size(), 0);
    }
}

#[test]
fn delete_absent_destroys_key() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe fn count_destroy(key: *mut u8) {
        DESTROYED.fetch_add(1, Ordering::Relaxed);
        let _ = key;
    }

    unsafe {
        let mut ops = KeyOps::boxed::<u64>();
        ops.destroy = count_destroy;
        let map = Map::new(ops);

        // Deleting what is not there is a no-op, but the key is absorbed regardless.
        assert!(map.remove(box_key(11u64)).is_null());
        assert_eq!(DESTROYED.load(Ordering::Relaxed), 1);
        assert_eq!(map.size(), 0);
    }
}

#[test]
fn mismatch_absorbs_key() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe fn count_destroy(key: *mut u8) {
        DESTROYED.fetch_add(1, Ordering::Relaxed);
        let _ = key;
    }

    unsafe {
        let mut ops = KeyOps::boxed::<u64>();
        ops.destroy = count_destroy;
        let map = Map::new(ops);
        let k = 2u64;

        assert!(map.insert(box_key(2u64), value(1)).is_null());
        // A failed conditional update destroys the redundant caller key right away.
        assert_eq!(map.put_if(box_key(2u64), value(3), value(2)), value(1));
        assert_eq!(DESTROYED.load(Ordering::Relaxed), 1);
        assert_eq!(map.get(probe(&k)), value(1));

        // A failed conditional insert of an absent key parks it as a dead entry instead; the
        // mapping stays absent either way.
        assert_eq!(map.put_if(box_key(4u64), value(1), value(2)), ptr::null_mut());
        let k = 4u64;
        assert!(map.get(probe(&k)).is_null());
        assert_eq!(map.size(), 1);

        drop(map);
        // Every key ever passed in has been destroyed exactly once by now.
        assert_eq!(DESTROYED.load(Ordering::Relaxed), 3);
    }
}

#[test]
fn zero_hash_is_remapped() {
    unsafe fn zero_hash(_key: *const u8) -> u32 {
        0
    }

    unsafe {
        let mut ops = KeyOps::boxed::<u64>();
        ops.hash = zero_hash;
        let map = Map::new(ops);

        // Everything collides on the remapped hash, and still works.
        for i in 0..3u64 {
            assert!(map.insert(box_key(i), value(i as usize + 1)).is_null());
        }
        for i in 0..3u64 {
            assert_eq!(map.get(probe(&i)), value(i as usize + 1));
        }
        assert_eq!(map.size(), 3);
    }
}

#[test]
fn forced_resize() {
    // All hashes collide modulo the initial capacity, but spread at higher bits.
    unsafe fn aligned_hash(key: *const u8) -> u32 {
        ((*(key as *const u64) as u32) + 1) << 2
    }

    unsafe {
        let mut ops = KeyOps::boxed::<u64>();
        ops.hash = aligned_hash;
        let map = Map::new(ops);

        for i in 0..64u64 {
            assert!(map.insert(box_key(i), value(i as usize + 1)).is_null());
        }

        assert_eq!(map.size(), 64);
        for i in 0..64u64 {
            assert_eq!(map.get(probe(&i)), value(i as usize + 1));
        }
        // Growing from 4 slots, the chains only untangle at 128.
        assert!(map.capacity() >= 128);
    }
}

#[test]
fn multi_block_resize() {
    // Everything lands on one home slot of the big table, forcing a resize whose zeroing and
    // migration span several work blocks.
    unsafe fn block_hash(key: *const u8) -> u32 {
        ((*(key as *const u64) as u32) + 1) << 14
    }

    unsafe {
        let mut ops = KeyOps::boxed::<u64>();
        ops.hash = block_hash;
        let map = Map::with_capacity(ops, BLOCK_SIZE * 2);
        assert_eq!(map.capacity(), BLOCK_SIZE * 2);

        for i in 0..24u64 {
            assert!(map.insert(box_key(i), value(i as usize + 1)).is_null());
        }

        assert_eq!(map.capacity(), BLOCK_SIZE * 4);
        assert_eq!(map.size(), 24);
        for i in 0..24u64 {
            assert_eq!(map.get(probe(&i)), value(i as usize + 1));
        }
    }
}

#[test]
fn compaction_keeps_capacity() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe fn count_destroy(key: *mut u8) {
        DESTROYED.fetch_add(1, Ordering::Relaxed);
        let _ = key;
    }

    unsafe {
        let mut ops = KeyOps::boxed::<u64>();
        ops.destroy = count_destroy;
        let map = Map::with_capacity(ops, 16);

        // Insert-and-delete churn at a live size of one: the dead entries pile up until the
        // table is rebuilt at the same length, over and over.
        for round in 0..2000u64 {
            map.insert(box_key(round), value(1));
            assert_eq!(map.remove(box_key(round)), value(1));
        }

        assert_eq!(map.size(), 0);
        assert_eq!(map.capacity(), 16);

        drop(map);
        // Two keys per round, each destroyed exactly once.
        assert_eq!(DESTROYED.load(Ordering::Relaxed), 4000);
    }
}

#[test]
fn spam_insert() {
    let map = Arc::new(Map::new(KeyOps::boxed::<u64>()));
    let mut joins = Vec::new();

    for t in 0..10u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || unsafe {
            for i in t * 1000..(t + 1) * 1000 {
                assert!(map.insert(box_key(i), value(i as usize + 1)).is_null());
                assert_eq!(map.insert(box_key(i), value(i as usize + 2)), value(i as usize + 1));
            }
        }));
    }

    for join in joins.drain(..) {
        join.join().unwrap();
    }

    for t in 0..5u64 {
        let map = map.clone();
        joins.push(thread::spawn(move || unsafe {
            for i in t * 2000..(t + 1) * 2000 {
                assert_eq!(map.get(probe(&i)), value(i as usize + 2));
            }
        }));
    }

    for join in joins {
        join.join().unwrap();
    }

    assert_eq!(map.size(), 10_000);
}

#[test]
fn hammer() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe fn count_destroy(key: *mut u8) {
        DESTROYED.fetch_add(1, Ordering::Relaxed);
        let _ = key;
    }

    const THREADS: u64 = 5;
    const KEYS: u64 = 50_000;

    let mut ops = KeyOps::boxed::<u64>();
    ops.destroy = count_destroy;
    let map = Arc::new(Map::new(ops));

    let mut joins = Vec::new();
    for t in 0..THREADS {
        let map = map.clone();
        joins.push(thread::spawn(move || unsafe {
            for i in t * KEYS..(t + 1) * KEYS {
                assert!(map.insert(box_key(i), value(i as usize + 1)).is_null());
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }

    assert_eq!(map.size(), (THREADS * KEYS) as usize);
    unsafe {
        for i in 0..THREADS * KEYS {
            assert_eq!(map.get(probe(&i)), value(i as usize + 1));
        }
    }

    // Distinct keys, no updates: nothing has died yet.
    assert_eq!(DESTROYED.load(Ordering::Relaxed), 0);

    drop(map);
    assert_eq!(DESTROYED.load(Ordering::Relaxed), (THREADS * KEYS) as usize);
}

#[test]
fn churn() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe fn count_destroy(key: *mut u8) {
        DESTROYED.fetch_add(1, Ordering::Relaxed);
        let _ = key;
    }

    const THREADS: usize = 5;
    const OPS: usize = 50_000;
    const KEY_SPACE: u64 = 200;

    let mut ops = KeyOps::boxed::<u64>();
    ops.destroy = count_destroy;
    let map = Arc::new(Map::new(ops));

    let mut joins = Vec::new();
    for _ in 0..THREADS {
        let map = map.clone();
        joins.push(thread::spawn(move || unsafe {
            let mut rng = rand::thread_rng();
            for _ in 0..OPS {
                let key = rng.gen_range(0..KEY_SPACE);
                if rng.gen::<bool>() {
                    map.insert(box_key(key), value(key as usize + 1));
                } else {
                    map.remove(box_key(key));
                }
            }
        }));
    }
    for join in joins {
        join.join().unwrap();
    }

    // After quiescence, the size counter agrees with the observable live set.
    let live = unsafe {
        (0..KEY_SPACE)
            .filter(|key| !map.get(probe(key)).is_null())
            .count()
    };
    assert_eq!(map.size(), live);

    drop(map);
    // One key per operation, each absorbed and destroyed exactly once.
    assert_eq!(DESTROYED.load(Ordering::Relaxed), THREADS * OPS);
}

#[test]
fn probe_under_resize() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    unsafe fn count_destroy(key: *mut u8) {
        DESTROYED.fetch_add(1, Ordering::Relaxed);
        let _ = key;
    }

    let mut ops = KeyOps::boxed::<u64>();
    ops.destroy = count_destroy;
    let map = Arc::new(Map::new(ops));
    let stop = Arc::new(AtomicBool::new(false));

    unsafe {
        map.insert(box_key(0u64), value(1));
    }

    let mut joins = Vec::new();

    // Two writers cycle the probed mapping through three values.
    for _ in 0..2 {
        let map = map.clone();
        let stop = stop.clone();
        joins.push(thread::spawn(move || unsafe {
            let mut n = 1;
            while !stop.load(Ordering::Relaxed) {
                n = n % 3 + 1;
                assert!(!map.insert(box_key(0u64), value(n)).is_null());
            }
        }));
    }

    // One reader continuously verifies it only ever sees one of the three values.
    {
        let map = map.clone();
        let stop = stop.clone();
        joins.push(thread::spawn(move || unsafe {
            let key = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let val = map.get(probe(&key));
                assert!(
                    val == value(1) || val == value(2) || val == value(3),
                    "probed mapping vanished mid-resize"
                );
            }
        }));
    }

    // Two inserters force resize after resize underneath all of the above.
    let mut inserters = Vec::new();
    for t in 1..3u64 {
        let map = map.clone();
        inserters.push(thread::spawn(move || unsafe {
            for i in t * 30_000..(t + 1) * 30_000 {
                assert!(map.insert(box_key(i), value(4)).is_null());
            }
        }));
    }
    for join in inserters {
        join.join().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for join in joins {
        join.join().unwrap();
    }

    assert_eq!(map.size(), 60_001);
}
