#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate bwtree;

use std::collections::BTreeSet;

use arbitrary::Arbitrary;

const KEYSPACE: u64 = 128;
const VALUESPACE: u64 = 4;

#[derive(Debug)]
enum Op {
    Insert { key: u64, value: u64 },
    Delete { key: u64, value: u64 },
    Get { key: u64 },
    CollectGarbage,
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(if u.ratio(1, 2)? {
            Op::Insert {
                key: u.int_in_range(0..=KEYSPACE)?,
                value: u.int_in_range(0..=VALUESPACE)?,
            }
        } else if u.ratio(2, 3)? {
            Op::Delete {
                key: u.int_in_range(0..=KEYSPACE)?,
                value: u.int_in_range(0..=VALUESPACE)?,
            }
        } else if u.ratio(3, 4)? {
            Op::Get {
                key: u.int_in_range(0..=KEYSPACE)?,
            }
        } else {
            Op::CollectGarbage
        })
    }
}

fn values_of(model: &BTreeSet<(u64, u64)>, key: u64) -> BTreeSet<u64> {
    model
        .range((key, u64::MIN)..=(key, u64::MAX))
        .map(|(_, v)| *v)
        .collect()
}

fuzz_target!(|ops: Vec<Op>| {
    let mut tree = bwtree::BwTree::<_, _, 8>::default();
    tree.assign_gc_id(0);
    let mut model = BTreeSet::new();

    for op in ops {
        match op {
            Op::Insert { key, value } => {
                assert_eq!(tree.insert(key, value), model.insert((key, value)));
            }
            Op::Delete { key, value } => {
                assert_eq!(tree.delete(&key, &value), model.remove(&(key, value)));
            }
            Op::Get { key } => {
                assert_eq!(tree.get_value(&key), values_of(&model, key));
            }
            Op::CollectGarbage => {
                tree.collect_garbage();
            }
        };

        for (key, value) in &model {
            assert!(tree.contains(key, value), "lost pair ({key}, {value})");
        }
    }

    for key in 0..=KEYSPACE {
        assert_eq!(tree.get_value(&key), values_of(&model, key));
    }

    tree.unregister_thread(0);
});
