use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use atomicmap_rs::{AtomicHashArray, AtomicHashMap, Config};

#[test]
fn concurrent_mixed_ops_string_keys() {
    let m: Arc<AtomicHashMap<String, usize>> = Arc::new(AtomicHashMap::new(1024));
    let n_threads = 6;
    let iters = 3_000;
    let barrier = Arc::new(Barrier::new(n_threads));

    let mut handles = Vec::new();
    for t in 0..n_threads {
        let b = barrier.clone();
        let map = m.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..iters {
                let k = format!("k:{}:{}", t, i % 1024);
                match i % 4 {
                    0 => {
                        map.insert(k, i).unwrap();
                    }
                    1 => {
                        let _ = map.find(k.as_str());
                    }
                    2 => {
                        let _ = map.insert_with(k, || i).unwrap();
                    }
                    _ => {
                        let _ = map.erase(k.as_str());
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(m.len() <= n_threads * 1024);
    assert_eq!(m.iter().count(), m.len());
}

#[test]
fn concurrent_counters() {
    // Key k is incremented k * MULT times by racing threads.
    const NUM_KEYS: i64 = 10;
    const MULT: i64 = 10;
    let m: Arc<AtomicHashMap<i64, AtomicI64>> = Arc::new(AtomicHashMap::new(NUM_KEYS as usize));

    let mut handles = Vec::new();
    for key in 1..NUM_KEYS {
        for _ in 0..key * MULT {
            let map = m.clone();
            handles.push(thread::spawn(move || {
                let (e, _) = map.insert_with(key, || AtomicI64::new(0)).unwrap();
                e.value().fetch_add(1, Ordering::Relaxed);
            }));
        }
    }
    for h in handles {
        h.join().unwrap();
    }

    for key in 1..NUM_KEYS {
        let v = m.find(&key).map(|e| e.value().load(Ordering::Relaxed));
        assert_eq!(v, Some(key * MULT));
    }
    assert_eq!(m.len(), (NUM_KEYS - 1) as usize);
}

#[test]
fn insert_with_runs_once_under_race() {
    let m: Arc<AtomicHashMap<i32, i32>> = Arc::new(AtomicHashMap::new(16));
    let called = Arc::new(AtomicUsize::new(0));
    let inserted = Arc::new(AtomicUsize::new(0));

    let workers = std::cmp::max(
        2,
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2),
    );
    let barrier = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();
    for _ in 0..workers {
        let map = m.clone();
        let c = called.clone();
        let ins = inserted.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            let (e, fresh) = map
                .insert_with(999, || {
                    c.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    777
                })
                .unwrap();
            assert_eq!(*e.value(), 777);
            if fresh {
                ins.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert_eq!(inserted.load(Ordering::SeqCst), 1);
    assert_eq!(m.find(&999).map(|e| *e.value()), Some(777));
}

#[test]
fn concurrent_inserts_across_growth_are_unique() {
    // Tiny first submap so every thread races through several growth steps.
    let m: Arc<AtomicHashMap<u64, u64>> = Arc::new(AtomicHashMap::new(8));
    let n_threads = 8;
    let n_keys = 20_000u64;
    let barrier = Arc::new(Barrier::new(n_threads));
    let fresh = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for t in 0..n_threads {
        let map = m.clone();
        let b = barrier.clone();
        let f = fresh.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            // Every thread inserts every key, in a different order.
            for i in 0..n_keys {
                let k = (i + t as u64 * 2_503) % n_keys;
                let (e, inserted) = map.insert(k, k * 2).unwrap();
                assert_eq!(*e.key(), k);
                assert_eq!(*e.value(), k * 2);
                if inserted {
                    f.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(fresh.load(Ordering::Relaxed), n_keys as usize);
    assert_eq!(m.len(), n_keys as usize);
    let seen: HashSet<u64> = m.iter().map(|e| *e.key()).collect();
    assert_eq!(seen.len(), n_keys as usize);
    assert_eq!(m.iter().count(), n_keys as usize);
    assert!(m.num_submaps() > 1);
}

#[test]
fn collision_test_disjoint_ranges() {
    let m: Arc<AtomicHashMap<u64, u64>> = Arc::new(AtomicHashMap::new(2_000));
    let n_threads = 8u64;
    let per_thread = 5_000u64;
    let barrier = Arc::new(Barrier::new(n_threads as usize));

    let mut handles = Vec::new();
    for t in 0..n_threads {
        let map = m.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for k in t * per_thread..(t + 1) * per_thread {
                assert!(map.insert(k, k ^ 0xff).unwrap().1);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for k in 0..n_threads * per_thread {
        assert_eq!(m.find(&k).map(|e| *e.value()), Some(k ^ 0xff));
    }
}

#[test]
fn race_insert_iterate() {
    let m: Arc<AtomicHashMap<u64, u64>> = Arc::new(AtomicHashMap::new(64));
    let done = Arc::new(AtomicBool::new(false));
    let total = 30_000u64;

    let writer = {
        let map = m.clone();
        let d = done.clone();
        thread::spawn(move || {
            for k in 0..total {
                map.insert(k, k + 1).unwrap();
            }
            d.store(true, Ordering::Release);
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let map = m.clone();
        let d = done.clone();
        readers.push(thread::spawn(move || {
            while !d.load(Ordering::Acquire) {
                let mut seen = HashSet::new();
                for e in map.iter() {
                    assert_eq!(*e.value(), *e.key() + 1);
                    // Entries never move, so none is yielded twice.
                    assert!(seen.insert(*e.key()));
                }
            }
        }));
    }

    writer.join().unwrap();
    for h in readers {
        h.join().unwrap();
    }
    assert_eq!(m.iter().count(), total as usize);
}

#[test]
fn thread_erase_insert_race() {
    const INSERTIONS: u64 = 20_000;
    const ERASERS: usize = 10;
    let m: Arc<AtomicHashMap<u64, u64>> = Arc::new(AtomicHashMap::new(INSERTIONS as usize / 4));
    let inserted_up_to = Arc::new(AtomicU64::new(0));
    let erased = Arc::new(AtomicUsize::new(0));

    let inserter = {
        let map = m.clone();
        let up_to = inserted_up_to.clone();
        thread::spawn(move || {
            for k in 1..=INSERTIONS {
                assert!(map.insert(k, k).unwrap().1);
                up_to.store(k, Ordering::Release);
            }
        })
    };

    let mut erasers = Vec::new();
    for _ in 0..ERASERS {
        let map = m.clone();
        let up_to = inserted_up_to.clone();
        let er = erased.clone();
        erasers.push(thread::spawn(move || {
            let mut next = 1u64;
            while next <= INSERTIONS {
                if next > up_to.load(Ordering::Acquire) {
                    thread::yield_now();
                    continue;
                }
                if map.erase(&next) {
                    er.fetch_add(1, Ordering::Relaxed);
                }
                next += 1;
            }
        }));
    }

    inserter.join().unwrap();
    for h in erasers {
        h.join().unwrap();
    }

    // Each key was erased by exactly one of the racing erasers.
    assert_eq!(erased.load(Ordering::Relaxed), INSERTIONS as usize);
    assert!(m.is_empty());
    assert_eq!(m.len(), 0);
    assert_eq!(m.iter().count(), 0);
}

#[test]
fn array_insert_race() {
    let mut arr: AtomicHashArray<i32, i32> =
        AtomicHashArray::with_config(2, Config::default()).unwrap();
    let n_threads = 4;

    for _ in 0..500 {
        arr.clear();
        let barrier = Barrier::new(n_threads);
        let statuses: Vec<usize> = thread::scope(|s| {
            let handles: Vec<_> = (0..n_threads)
                .map(|_| {
                    let arr = &arr;
                    let b = &barrier;
                    s.spawn(move || {
                        b.wait();
                        (0..2).filter(|&k| arr.insert(k, 0).is_some()).count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // A key is either present for every thread or for none of them.
        assert!(arr.len() >= 1);
        for found in statuses {
            assert_eq!(found, arr.len());
        }
    }
}

#[test]
fn erase_find_race() {
    // Values equal their keys; the map holds one or two consecutive keys at any moment.
    const LIMIT: u64 = 10_000;
    let m: Arc<AtomicHashMap<u64, u64>> = Arc::new(AtomicHashMap::new(LIMIT as usize + 10));
    let key = Arc::new(AtomicU64::new(1));

    let writer = {
        let map = m.clone();
        let key = key.clone();
        thread::spawn(move || loop {
            let k = key.fetch_add(1, Ordering::SeqCst) + 1;
            if k > LIMIT {
                break;
            }
            map.insert(k + 1, k + 1).unwrap();
            map.erase(&k);
        })
    };

    let reader = {
        let map = m.clone();
        let key = key.clone();
        thread::spawn(move || loop {
            let k = key.load(Ordering::SeqCst);
            if k > LIMIT {
                break;
            }
            if let Some(e) = map.find(&k) {
                assert_eq!(*e.value(), k);
            }
        })
    };

    reader.join().unwrap();
    writer.join().unwrap();
}

#[test]
fn erase_after_insert_race() {
    let m: Arc<AtomicHashMap<u64, u64>> = Arc::new(AtomicHashMap::new(10_010));
    let n_threads = 16;
    let iters = 500;
    let barrier = Arc::new(Barrier::new(n_threads));

    let mut handles = Vec::new();
    for _ in 0..n_threads {
        let map = m.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for _ in 0..iters {
                map.erase(&1);
                map.insert(1, 1).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(m.find(&1).map(|e| *e.value()), Some(1));
    assert_eq!(m.len(), 1);
}

#[test]
fn readers_never_see_partial_values() {
    #[derive(Clone, Copy)]
    struct Pair {
        x: u64,
        y: u64,
    }

    let m: Arc<AtomicHashMap<u64, Pair>> = Arc::new(AtomicHashMap::new(256));
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for _ in 0..4 {
        let map = m.clone();
        let s = stop.clone();
        handles.push(thread::spawn(move || {
            while !s.load(Ordering::Relaxed) {
                for e in map.iter() {
                    let p = e.value();
                    assert_eq!(p.x, !p.y);
                    assert_eq!(p.x, *e.key());
                }
            }
        }));
    }

    {
        let map = m.clone();
        let s = stop.clone();
        handles.push(thread::spawn(move || {
            for k in 0..20_000u64 {
                map.insert(k, Pair { x: k, y: !k }).unwrap();
                if k % 3 == 0 {
                    map.erase(&(k / 2));
                }
            }
            s.store(true, Ordering::Relaxed);
        }));
    }

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn concurrent_string_counters_by_ref() {
    // Every thread bumps the same counters through borrowed keys.
    let m: Arc<AtomicHashMap<String, AtomicU64>> = Arc::new(AtomicHashMap::new(4));
    let names: Arc<Vec<String>> = Arc::new((0..64).map(|i| format!("counter-{i}")).collect());
    let n_threads = 8;
    let rounds = 50u64;
    let barrier = Arc::new(Barrier::new(n_threads));

    let handles: Vec<_> = (0..n_threads)
        .map(|_| {
            let map = m.clone();
            let names = names.clone();
            let b = barrier.clone();
            thread::spawn(move || {
                b.wait();
                for _ in 0..rounds {
                    for name in names.iter() {
                        let (e, _) = map.insert_ref_with(name.as_str(), || AtomicU64::new(0)).unwrap();
                        e.value().fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(m.len(), names.len());
    for name in names.iter() {
        let count = m.find(name.as_str()).map(|e| e.value().load(Ordering::Relaxed));
        assert_eq!(count, Some(n_threads as u64 * rounds));
    }
}

#[test]
fn overlapping_inserts_and_erases_across_growth_stay_unique() {
    let n_threads = 8;

    for round in 0..200u64 {
        let m: AtomicHashMap<u64, u64> = AtomicHashMap::new(2);
        let barrier = Barrier::new(n_threads);

        thread::scope(|s| {
            for t in 0..n_threads as u64 {
                let map = &m;
                let b = &barrier;
                s.spawn(move || {
                    b.wait();
                    // Neighbouring threads share half their keys.
                    let base = t * 32;
                    for k in base..base + 64 {
                        let (e, _) = map.insert(k, k + round).unwrap();
                        assert_eq!(*e.key(), k);
                        if k % 5 == t % 5 {
                            map.erase(&k);
                        }
                    }
                });
            }
        });

        let keys: Vec<u64> = m.iter().map(|e| *e.key()).collect();
        let unique: HashSet<u64> = keys.iter().copied().collect();
        assert_eq!(unique.len(), keys.len(), "round {round}: key live twice");
        assert_eq!(m.len(), keys.len());
        for k in keys {
            assert_eq!(m.count(&k), 1);
        }
        assert!(m.num_submaps() > 1);
    }
}
