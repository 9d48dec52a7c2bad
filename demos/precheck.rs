use std::collections::BTreeSet;
use std::time::Instant;

use bwtree::BwTree;

const N: u64 = 1024 * 1024;

fn main() {
    let mut tree = BwTree::<u64, u64>::default();
    tree.update_thread_local(1);
    tree.assign_gc_id(0);

    let before = Instant::now();
    for i in 0..N {
        assert!(tree.insert(i, i), "failed to insert {i}");
    }
    for i in 0..N {
        assert_eq!(tree.get_value(&i), BTreeSet::from([i]), "failed to get {i}");
    }
    println!("inserted and verified {N} keys in {:?}", before.elapsed());

    let before = Instant::now();
    for i in 0..N {
        assert!(tree.delete(&i, &i), "failed to delete {i}");
    }
    for i in 0..N {
        assert!(tree.get_value(&i).is_empty(), "key {i} survived deletion");
    }
    println!("deleted and verified {N} keys in {:?}", before.elapsed());

    println!("{:?}", tree.stats());
    tree.unregister_thread(0);

    println!("[SUCCESS]");
}
