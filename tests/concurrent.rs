use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;

use bwtree::{BwTree, Config};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8)
        * 2
}

#[test]
fn concurrent_tree() {
    let n: u32 = 1024;
    let concurrency = concurrency();

    let run = |mut tree: BwTree<u32, u32, 8>, barrier: &Barrier, gc_id: usize| {
        let shift = concurrency.next_power_of_two().trailing_zeros();
        let low_bits = u32::try_from(gc_id).unwrap();
        let unique_key = |key| (key << shift) | low_bits;

        tree.assign_gc_id(gc_id);
        barrier.wait();

        for key in 0..n {
            let i = unique_key(key);
            assert!(tree.get_value(&i).is_empty());
            assert!(tree.insert(i, i));
            assert_eq!(tree.get_value(&i), BTreeSet::from([i]), "failed to get key {i}");
        }
        for key in 0..n {
            let i = unique_key(key);
            assert!(tree.insert(i, i + 1), "failed to add a second value to {i}");
        }
        for key in 0..n {
            let i = unique_key(key);
            assert_eq!(tree.get_value(&i), BTreeSet::from([i, i + 1]), "failed to get key {i}");
            assert!(tree.delete(&i, &i));
        }
        for key in 0..n {
            let i = unique_key(key);
            assert!(tree.delete(&i, &(i + 1)));
            assert!(tree.get_value(&i).is_empty(), "key {i} survived deletion");
        }

        tree.unregister_thread(gc_id);
    };

    let tree = BwTree::with_config(
        Config::default()
            .with_leaf_size(2, 16)
            .with_inner_size(2, 8),
    );
    tree.update_thread_local(concurrency);

    std::thread::scope(|s| {
        for _ in 0..16 {
            let barrier = std::sync::Arc::new(Barrier::new(concurrency));
            let mut threads = vec![];
            for gc_id in 0..concurrency {
                let tree_2 = tree.clone();
                let barrier_2 = barrier.clone();

                let thread = s.spawn(move || run(tree_2, &barrier_2, gc_id));
                threads.push(thread);
            }
            for thread in threads {
                thread.join().unwrap();
            }
        }
    });

    let stats = tree.stats();
    assert!(stats.splits > 0);
    assert!(stats.merges > 0);
    assert_eq!(stats.inserts, stats.deletes);
}

#[test]
fn uniform_random_workload() {
    let concurrency = concurrency();
    let ops_per_thread = 16 * 1024;
    let key_space: u64 = 4096;

    let tree = BwTree::<u64, u64>::with_config(Config::default().with_leaf_size(4, 32));
    tree.update_thread_local(concurrency + 1);
    let barrier = Barrier::new(concurrency);

    std::thread::scope(|s| {
        let mut threads = vec![];
        for gc_id in 0..concurrency {
            let mut tree = tree.clone();
            let barrier = &barrier;

            threads.push(s.spawn(move || {
                tree.assign_gc_id(gc_id);
                let mut rng = StdRng::seed_from_u64(gc_id as u64);
                // every thread owns the values equal to its id, so it can
                // check its own pairs while the others race on the same keys
                let value = gc_id as u64;
                let mut mine = BTreeSet::new();

                barrier.wait();
                for _ in 0..ops_per_thread {
                    let key = rng.gen_range(0..key_space);
                    if rng.gen_bool(0.5) {
                        assert_eq!(tree.insert(key, value), mine.insert(key));
                    } else {
                        assert_eq!(tree.delete(&key, &value), mine.remove(&key));
                    }
                }

                for key in 0..key_space {
                    assert_eq!(
                        tree.contains(&key, &value),
                        mine.contains(&key),
                        "thread {gc_id} disagrees about key {key}"
                    );
                }

                tree.unregister_thread(gc_id);
                mine
            }));
        }

        let mut tree = tree.clone();
        tree.assign_gc_id(concurrency);
        let mut expected = vec![BTreeSet::new(); key_space as usize];
        for (gc_id, thread) in threads.into_iter().enumerate() {
            for key in thread.join().unwrap() {
                expected[key as usize].insert(gc_id as u64);
            }
        }
        for key in 0..key_space {
            assert_eq!(tree.get_value(&key), expected[key as usize]);
        }
    });
}

#[test]
fn skewed_single_key() {
    const KEY: u64 = 0xABCD;

    let concurrency = concurrency();
    let values_per_thread: u64 = 256;

    let tree = BwTree::<u64, u64>::with_config(Config::default().with_leaf_size(2, 8));
    tree.update_thread_local(concurrency + 1);
    let barrier = Barrier::new(concurrency);

    std::thread::scope(|s| {
        let mut threads = vec![];
        for gc_id in 0..concurrency {
            let mut tree = tree.clone();
            let barrier = &barrier;

            threads.push(s.spawn(move || {
                tree.assign_gc_id(gc_id);
                let base = gc_id as u64 * values_per_thread;

                barrier.wait();
                for value in base..base + values_per_thread {
                    assert!(tree.insert(KEY, value));
                }
                for value in (base..base + values_per_thread).step_by(2) {
                    assert!(tree.delete(&KEY, &value));
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
    });

    let mut tree = tree.clone();
    tree.assign_gc_id(concurrency);

    let expected: BTreeSet<u64> = (0..concurrency as u64 * values_per_thread)
        .filter(|value| value % 2 == 1)
        .collect();
    assert_eq!(tree.get_value(&KEY), expected);
    assert!(tree.get_value(&(KEY - 1)).is_empty());
    assert!(tree.get_value(&(KEY + 1)).is_empty());
}

#[test]
fn readers_never_see_torn_pages() {
    let writers = concurrency() / 2;
    let readers = concurrency() - writers;
    let n: u64 = 8 * 1024;

    let tree = BwTree::<u64, u64>::with_config(Config::default().with_leaf_size(2, 16));
    tree.update_thread_local(writers + readers + 1);

    let mut setup = tree.clone();
    setup.assign_gc_id(writers + readers);
    // keys below n are never touched by writers, so readers can check them
    for key in 0..n {
        assert!(setup.insert(key, key));
    }

    let barrier = Barrier::new(writers + readers);
    std::thread::scope(|s| {
        for gc_id in 0..writers {
            let mut tree = tree.clone();
            let barrier = &barrier;
            s.spawn(move || {
                tree.assign_gc_id(gc_id);
                barrier.wait();
                for i in 0..n {
                    let key = n + i * writers as u64 + gc_id as u64;
                    assert!(tree.insert(key, key));
                }
                for i in 0..n {
                    let key = n + i * writers as u64 + gc_id as u64;
                    assert!(tree.delete(&key, &key));
                }
            });
        }

        for gc_id in writers..writers + readers {
            let mut tree = tree.clone();
            let barrier = &barrier;
            s.spawn(move || {
                tree.assign_gc_id(gc_id);
                barrier.wait();
                for _ in 0..4 {
                    for key in 0..n {
                        assert_eq!(tree.get_value(&key), BTreeSet::from([key]));
                    }
                }
            });
        }
    });

    for key in n..n * (writers as u64 + 1) {
        assert!(setup.get_value(&key).is_empty());
    }
}

#[test]
fn gc_slots_can_be_reused() {
    let mut tree = BwTree::<u32, u32>::default();
    tree.update_thread_local(2);
    tree.assign_gc_id(0);

    for round in 0..8 {
        std::thread::scope(|s| {
            let mut other = tree.clone();
            s.spawn(move || {
                other.assign_gc_id(1);
                assert!(other.insert(round, round));
                other.unregister_thread(1);
            });
        });
        assert_eq!(tree.active_gc_slots(), 1);
    }

    for round in 0..8 {
        assert_eq!(tree.get_value(&round), BTreeSet::from([round]));
    }

    tree.unregister_thread(0);
    tree.update_thread_local(1);
    assert_eq!(tree.gc_slots(), 1);
}

#[test]
fn collecting_garbage_while_others_operate() {
    let writers = concurrency() / 2;
    let readers = concurrency() - writers;
    let n: u64 = 2 * 1024;

    let tree = BwTree::<u64, u64, 2>::with_config(
        Config::default()
            .with_leaf_size(1, 4)
            .with_inner_size(1, 4)
            .with_delta_chain_length(2, 2)
            .with_gc_threshold(8),
    );
    tree.update_thread_local(writers + readers + 1);

    let mut setup = tree.clone();
    setup.assign_gc_id(writers + readers);
    for key in 0..n {
        assert!(setup.insert(key, key));
    }

    let finished = AtomicUsize::new(0);
    let barrier = Barrier::new(writers + readers + 1);

    std::thread::scope(|s| {
        for gc_id in 0..writers {
            let mut tree = tree.clone();
            let (barrier, finished) = (&barrier, &finished);
            s.spawn(move || {
                tree.assign_gc_id(gc_id);
                barrier.wait();
                for round in 0..4 {
                    for i in 0..n {
                        let key = n + i * writers as u64 + gc_id as u64;
                        assert!(tree.insert(key, round));
                    }
                    for i in 0..n {
                        let key = n + i * writers as u64 + gc_id as u64;
                        assert!(tree.delete(&key, &round));
                    }
                }
                finished.fetch_add(1, Ordering::Release);
            });
        }

        for gc_id in writers..writers + readers {
            let mut tree = tree.clone();
            let (barrier, finished) = (&barrier, &finished);
            s.spawn(move || {
                tree.assign_gc_id(gc_id);
                barrier.wait();
                for _ in 0..4 {
                    for key in 0..n {
                        assert_eq!(tree.get_value(&key), BTreeSet::from([key]));
                    }
                }
                finished.fetch_add(1, Ordering::Release);
            });
        }

        // never registered, so it never pins while reclaiming
        let collector = tree.clone();
        barrier.wait();
        while finished.load(Ordering::Acquire) < writers + readers {
            collector.collect_garbage();
        }
    });

    for key in 0..n {
        assert_eq!(setup.get_value(&key), BTreeSet::from([key]));
    }
    for key in n..n * (writers as u64 + 1) {
        assert!(setup.get_value(&key).is_empty());
    }

    let stats = tree.stats();
    assert!(stats.merges > 0);
    assert!(stats.reclaimed > 0);
}

#[test]
#[ignore]
fn million_keys_leave_nothing_behind() {
    let n: u64 = 1024 * 1024;

    let mut tree = BwTree::<u64, u64>::default();
    tree.assign_gc_id(0);

    for i in 0..n {
        assert!(tree.insert(i, i), "failed to insert {i}");
    }
    for i in 0..n {
        assert_eq!(tree.get_value(&i), BTreeSet::from([i]), "failed to get key {i}");
    }
    for i in 0..n {
        assert!(tree.delete(&i, &i), "failed to delete {i}");
    }
    for i in 0..n {
        assert!(tree.get_value(&i).is_empty(), "key {i} survived deletion");
    }

    tree.unregister_thread(0);
    tree.collect_garbage();
    assert_eq!(tree.pending_garbage(), 0);
}
