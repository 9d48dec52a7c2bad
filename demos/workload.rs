use std::thread::scope;
use std::time::Instant;

use bwtree::BwTree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 1024 * 1024;
const KEY_SPACE: u64 = 1024 * 1024;
const SKEWED_KEY: u64 = 0xABCD;
// every value lives in the same leaf, which can never be split
const SKEWED_VALUES: u64 = 1024;

fn uniform(mut tree: BwTree<u64, u64>, gc_id: usize) {
    tree.assign_gc_id(gc_id);
    let mut rng = StdRng::seed_from_u64(gc_id as u64);

    for _ in 0..OPS_PER_THREAD {
        let key = rng.gen_range(0..KEY_SPACE);
        if rng.gen_bool(0.5) {
            tree.insert(key, key);
        } else {
            tree.delete(&key, &key);
        }
    }

    tree.unregister_thread(gc_id);
}

fn skewed(mut tree: BwTree<u64, u64>, gc_id: usize) {
    tree.assign_gc_id(gc_id);
    let mut rng = StdRng::seed_from_u64(gc_id as u64);

    for _ in 0..OPS_PER_THREAD {
        let value = rng.gen_range(0..SKEWED_VALUES);
        if rng.gen_bool(0.5) {
            tree.insert(SKEWED_KEY, value);
        } else {
            tree.delete(&SKEWED_KEY, &value);
        }
    }

    tree.unregister_thread(gc_id);
}

fn run(name: &str, work: fn(BwTree<u64, u64>, usize)) {
    let tree = BwTree::default();
    tree.update_thread_local(THREADS);

    let before = Instant::now();
    scope(|s| {
        let mut handles = vec![];
        for gc_id in 0..THREADS {
            let tree = tree.clone();
            handles.push(s.spawn(move || work(tree, gc_id)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    });
    let elapsed = before.elapsed();

    let total = (THREADS * OPS_PER_THREAD) as u64;
    println!(
        "{name}: {} ops/s, total {total} ops in {elapsed:?}",
        (total * 1000) / u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX).max(1),
    );
    println!("{name}: {:?}", tree.stats());
}

fn main() {
    run("uniform", uniform);
    run("skewed", skewed);
}
