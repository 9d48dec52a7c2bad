use std::collections::{BTreeMap, BTreeSet};

use bwtree::{BwTree, Config};
use proptest::prelude::*;

const KEYSPACE: u8 = 64;

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, u8),
    Delete(u8, u8),
    Get(u8),
    Collect,
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    let key = || 0..KEYSPACE;
    // few values per key, so deletes and duplicate inserts hit often
    let value = || 0_u8..4;

    prop::collection::vec(
        prop_oneof![
            4 => (key(), value()).prop_map(|(k, v)| Op::Insert(k, v)),
            3 => (key(), value()).prop_map(|(k, v)| Op::Delete(k, v)),
            2 => key().prop_map(Op::Get),
            1 => Just(Op::Collect),
        ],
        0..=max_ops,
    )
}

fn tiny_pages() -> Config {
    Config::default()
        .with_leaf_size(1, 4)
        .with_inner_size(1, 4)
        .with_delta_chain_length(2, 2)
        .with_gc_threshold(8)
}

fn model_values(model: &BTreeSet<(u8, u8)>, key: u8) -> BTreeSet<u8> {
    model
        .range((key, u8::MIN)..=(key, u8::MAX))
        .map(|(_, v)| *v)
        .collect()
}

fn pairs_with_shared_keys() -> impl Strategy<Value = Vec<(u16, u16)>> {
    prop::collection::vec((0_u16..512, any::<u16>()), 0..1024)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn matches_btreeset_model(ops in operations(512)) {
        let mut tree = BwTree::<u8, u8, 4>::with_config(tiny_pages());
        tree.assign_gc_id(0);
        let mut model = BTreeSet::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => prop_assert_eq!(tree.insert(k, v), model.insert((k, v))),
                Op::Delete(k, v) => prop_assert_eq!(tree.delete(&k, &v), model.remove(&(k, v))),
                Op::Get(k) => prop_assert_eq!(tree.get_value(&k), model_values(&model, k)),
                Op::Collect => {
                    tree.collect_garbage();
                }
            }
        }

        for k in 0..KEYSPACE {
            prop_assert_eq!(tree.get_value(&k), model_values(&model, k), "key {}", k);
        }

        tree.unregister_thread(0);
    }

    #[test]
    fn get_value_groups_by_key(pairs in pairs_with_shared_keys()) {
        let mut tree = BwTree::<u16, u16>::with_config(tiny_pages());
        tree.assign_gc_id(0);
        let mut model: BTreeMap<u16, BTreeSet<u16>> = BTreeMap::new();

        for (k, v) in pairs {
            let expected = model.entry(k).or_default().insert(v);
            prop_assert_eq!(tree.insert(k, v), expected);
        }

        for (k, values) in &model {
            prop_assert_eq!(&tree.get_value(k), values);
        }
    }
}
