//! Shared collection aliases, generalizing `bft::collections`'
//! `HashMap`/`OrderedMap` pair to the two concrete indexes the
//! transaction multiplexer needs (§3: `trans_by_id`, `trans_by_deadline`).

use std::collections::BTreeMap;
use std::collections::HashMap as StdHashMap;
use std::collections::HashSet as StdHashSet;
use std::hash::BuildHasherDefault;

use twox_hash::XxHash64;

/// A `HashMap` keyed on the node's default (non-DoS-resistant, fast)
/// hasher, matching the teacher's `collections_randomstate_twox_hash`
/// default feature. Used for the routing table and peer-address sets,
/// never for anything keyed on attacker-controlled input without a
/// capacity bound.
pub type HashMap<K, V> = StdHashMap<K, V, BuildHasherDefault<XxHash64>>;

/// A `HashSet` using the same hasher as [`HashMap`].
pub type HashSet<T> = StdHashSet<T, BuildHasherDefault<XxHash64>>;

/// Constructs an empty [`HashMap`] with room for `capacity` entries
/// without reallocating.
pub fn hash_map_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, BuildHasherDefault::default())
}

/// Constructs an empty [`HashMap`].
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::with_hasher(BuildHasherDefault::default())
}

/// Constructs an empty [`HashSet`].
pub fn hash_set<T>() -> HashSet<T> {
    HashSet::with_hasher(BuildHasherDefault::default())
}

/// An ordered map, used where iteration/removal order on a key matters
/// (the deadline index, §3's `trans_by_deadline`). A plain `BTreeMap`
/// gives O(log n) insert/remove by key and in-order iteration from the
/// smallest key, which is exactly "wake at the earliest deadline" (§4.3).
pub type OrderedMap<K, V> = BTreeMap<K, V>;
