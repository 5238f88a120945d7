//! Collection types used by `clotho`, parameterized over the
//! configured random state.

use std::collections::BTreeMap;

#[cfg(feature = "collections_randomstate_twox_hash")]
type RandomState = std::hash::BuildHasherDefault<twox_hash::XxHash64>;

#[cfg(feature = "collections_randomstate_std")]
type RandomState = std::collections::hash_map::RandomState;

/// The `HashMap` used throughout this crate.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// The `HashSet` used throughout this crate.
pub type HashSet<T> = std::collections::HashSet<T, RandomState>;

/// A map type with sorted key iteration order.
///
/// The delta wire format requires partition-major sorted traversal of
/// subpartition tables, so this is a plain B-tree map.
pub type OrderedMap<K, V> = BTreeMap<K, V>;

/// Creates a new `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Creates a new `HashMap` with the given capacity.
pub fn hash_map_capacity<K, V>(n: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(n, Default::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<T>() -> HashSet<T> {
    HashSet::default()
}

/// Creates a new `OrderedMap`.
pub fn ordered_map<K: Ord, V>() -> OrderedMap<K, V> {
    OrderedMap::new()
}
