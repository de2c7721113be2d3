use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;


/// A concurrent map with atomic per-key insert and update operations.
///
/// Entries are never evicted. Values are handed out as clones, so large
/// values are usually stored behind an [`Arc`]. A missing value can be
/// cached explicitly by using an [`Option`] as `V`.
///
/// The `factory` and `merge` closures run while the key's shard is locked.
/// They must not access the same [`Cache`] again, or they will deadlock.
pub struct Cache<K, V> {
    map: DashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    /// Creates an empty [`Cache`].
    #[must_use]
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Returns the value stored for `key`, inserting `factory()` first if
    /// there is none.
    ///
    /// `factory` runs at most once, and only if its result is inserted.
    /// Concurrent callers for the same key all observe the resident value.
    pub fn get_or_set<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        self.map.entry(key).or_insert_with(factory).value().clone()
    }

    /// Replaces the value stored for `key` with `merge(current)`, or inserts
    /// `factory()` if there is none. Returns the new value.
    ///
    /// The read-modify-write is atomic per key, so no concurrent update
    /// is lost.
    pub fn update_or_set<F, M>(&self, key: K, factory: F, merge: M) -> V
    where
        F: FnOnce() -> V,
        M: FnOnce(&V) -> V,
    {
        match self.map.entry(key) {
            Entry::Occupied(mut e) => {
                let new = merge(e.get());
                e.insert(new.clone());
                new
            },
            Entry::Vacant(e) => e.insert(factory()).value().clone(),
        }
    }

    /// Returns the value stored for `key` without modifying the [`Cache`].
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|v| v.value().clone())
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Tests whether no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.map.len())
            .finish_non_exhaustive()
    }
}


/// A key in a [`ScriptCache`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The absent key.
    Null,
    Int(i64),
    Str(CompactString),
    Bytes(Vec<u8>),
}

impl From<i64> for CacheKey {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for CacheKey {
    fn from(v: &str) -> Self {
        Self::Str(v.into())
    }
}

impl From<String> for CacheKey {
    fn from(v: String) -> Self {
        Self::Str(v.into())
    }
}

impl From<&[u8]> for CacheKey {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl<T: Into<CacheKey>> From<Option<T>> for CacheKey {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}


/// A type-erased value in a [`ScriptCache`]. [`None`] is a cached absence.
pub type CacheValue = Option<Arc<dyn Any + Send + Sync>>;

/// The cache partition handed to a single script.
pub type ScriptCache = Cache<CacheKey, CacheValue>;

impl ScriptCache {
    /// Typed variant of [`Cache::get_or_set`].
    ///
    /// Returns [`None`] if the stored value is absent or not a `T`.
    pub fn get_or_set_as<T, F>(&self, key: impl Into<CacheKey>, factory: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Option<T>,
    {
        let v = self.get_or_set(key.into(), || erase(factory()));
        v.and_then(|v| v.downcast().ok())
    }

    /// Typed variant of [`Cache::update_or_set`].
    ///
    /// `merge` receives [`None`] if the stored value is absent or not a `T`.
    pub fn update_or_set_as<T, F, M>(
        &self,
        key: impl Into<CacheKey>,
        factory: F,
        merge: M,
    ) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Option<T>,
        M: FnOnce(Option<&T>) -> Option<T>,
    {
        let v = self.update_or_set(
            key.into(),
            || erase(factory()),
            |old| erase(merge(old.as_deref().and_then(|v| v.downcast_ref()))),
        );
        v.and_then(|v| v.downcast().ok())
    }
}

fn erase<T: Any + Send + Sync>(v: Option<T>) -> CacheValue {
    v.map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
}


/// Maps each script to its own [`ScriptCache`] partition.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    partitions: Cache<PathBuf, Arc<ScriptCache>>,
}

impl CacheRegistry {
    /// Creates an empty [`CacheRegistry`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the partition of the script at `script`, creating it on
    /// first use. `script` should be a canonical path.
    #[must_use]
    pub fn partition(&self, script: &Path) -> Arc<ScriptCache> {
        self.partitions.get_or_set(script.to_path_buf(), Arc::default)
    }

    /// Returns the number of scripts with a partition.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Tests whether no partitions exist yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
