//! The bounded in-memory store a [`Group`](crate::group::Group) keeps its values in.

use std::fmt;

use crate::value::ByteView;

/// A concurrency-safe, bounded key-value store.
///
/// Implementations decide on their own replacement policy. Callers never assume that a `get`
/// followed by an `add` is atomic.
pub trait EvictionCache: Send + Sync + fmt::Debug {
    /// Looks up the value for `key`.
    fn get(&self, key: &str) -> Option<ByteView>;

    /// Inserts or replaces the value for `key`.
    fn add(&self, key: &str, value: ByteView);

    /// The number of bytes currently accounted for.
    fn weighted_size(&self) -> u64;

    /// The number of entries currently held.
    fn entry_count(&self) -> u64;
}

/// An [`EvictionCache`] backed by a [`moka`] cache, weighted by the bytes of keys and values.
///
/// A `capacity` of `0` disables eviction altogether.
pub struct InMemoryCache {
    cache: moka::sync::Cache<String, ByteView>,
    capacity: u64,
}

impl fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl InMemoryCache {
    pub fn new(name: &str, capacity: u64) -> Self {
        let mut builder = moka::sync::Cache::builder()
            .name(name)
            .weigher(|k: &String, v: &ByteView| {
                (k.len() + v.len()).try_into().unwrap_or(u32::MAX)
            });
        if capacity > 0 {
            builder = builder.max_capacity(capacity);
        }

        Self {
            cache: builder.build(),
            capacity,
        }
    }

    /// The configured byte budget, `0` meaning unbounded.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Applies pending evictions and bookkeeping right away.
    ///
    /// moka applies these lazily, which makes sizes observed right after an insert approximate.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}

impl EvictionCache for InMemoryCache {
    fn get(&self, key: &str) -> Option<ByteView> {
        self.cache.get(key)
    }

    fn add(&self, key: &str, value: ByteView) {
        self.cache.insert(key.to_owned(), value);
    }

    fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }

    fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
