use crate::dedup::dedup_by_key;
use proptest::prelude::*;
use std::collections::HashMap;

#[test]
fn first_occurrence_wins() {
    let items = ["a", "b", "a", "c", "b"];
    let deduplicated = dedup_by_key(&items, |item| item.to_string());

    assert_eq!(deduplicated.unique, vec![0, 1, 3]);
    assert_eq!(deduplicated.keys, vec!["a", "b", "c"]);
    assert_eq!(deduplicated.representative, vec![0, 1, 0, 2, 1]);
    assert_eq!(deduplicated.select(&items), vec!["a", "b", "c"]);
}

#[test]
fn later_duplicates_fold_onto_first() {
    let items = [("nodeA", "x86"), ("nodeA", "arm")];
    let deduplicated = dedup_by_key(&items, |(name, _)| name.to_string());

    assert_eq!(deduplicated.select(&items), vec![("nodeA", "x86")]);
    assert_eq!(deduplicated.expand(&[10]), vec![10, 10]);
}

#[test]
fn empty_batch() {
    let items: [&str; 0] = [];
    let deduplicated = dedup_by_key(&items, |item| item.to_string());

    assert!(deduplicated.unique.is_empty());
    assert!(deduplicated.expand::<i64>(&[]).is_empty());
}

/// Stand-in for a store handing out ids per distinct key in arrival order
fn assign(store: &mut HashMap<u8, i64>, keys: &[u8]) -> Vec<i64> {
    keys.iter()
        .map(|key| {
            let next = store.len() as i64 + 1;
            *store.entry(*key).or_insert(next)
        })
        .collect()
}

proptest! {
    #[test]
    fn mapping_is_independent_of_batch_order(keys in prop::collection::vec(0u8..16, 0..64)) {
        let mut store = HashMap::new();
        let deduplicated = dedup_by_key(&keys, |key| *key);
        let ids = assign(&mut store, &deduplicated.keys);
        let forward = deduplicated.expand(&ids);

        let mut reversed_keys = keys.clone();
        reversed_keys.reverse();
        let reversed = dedup_by_key(&reversed_keys, |key| *key);
        let reversed_ids = assign(&mut store, &reversed.keys);
        let mut backward = reversed.expand(&reversed_ids);
        backward.reverse();

        prop_assert_eq!(forward.len(), keys.len());
        prop_assert_eq!(&forward, &backward);

        for (key, id) in keys.iter().zip(&forward) {
            prop_assert_eq!(store[key], *id);
        }
    }
}
