use std::{collections::HashMap, hash::Hash};

/// Result of folding a batch by natural key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deduplicated<K> {
    /// input index of every first-seen key, in input order
    pub unique: Vec<usize>,
    /// distinct keys, parallel to `unique`
    pub keys: Vec<K>,
    /// for every input, the index into `unique` of its representative
    pub representative: Vec<usize>,
}

impl<K> Deduplicated<K> {
    /// Pick the representatives out of the original batch
    pub fn select<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.unique.iter().map(|index| items[*index].clone()).collect()
    }

    /// Spread one value per distinct key back over the original batch
    pub fn expand<V: Copy>(&self, values: &[V]) -> Vec<V> {
        self.representative
            .iter()
            .map(|index| values[*index])
            .collect()
    }
}

/// Collapse items sharing a key; the first occurrence wins and later duplicates fold onto it.
pub fn dedup_by_key<T, K, F>(items: &[T], mut key: F) -> Deduplicated<K>
where
    K: Eq + Hash + Clone,
    F: FnMut(&T) -> K,
{
    let mut seen: HashMap<K, usize> = HashMap::with_capacity(items.len());
    let mut result = Deduplicated {
        unique: Vec::new(),
        keys: Vec::new(),
        representative: Vec::with_capacity(items.len()),
    };

    for (index, item) in items.iter().enumerate() {
        let item_key = key(item);
        let slot = match seen.get(&item_key) {
            Some(slot) => *slot,
            None => {
                let slot = result.unique.len();
                seen.insert(item_key.clone(), slot);
                result.unique.push(index);
                result.keys.push(item_key);
                slot
            }
        };

        result.representative.push(slot);
    }

    result
}
