use crate::codec::DecodedImage;

use super::cache_key::CacheKey;

type InMemoryCache = moka::sync::Cache<CacheKey, DecodedImage>;

/// The in-memory tier, mapping keys to decoded images.
///
/// Removing entries is always safe, the disk tier is authoritative for persistence. The whole
/// tier is dropped by [`purge`](Self::purge), which the host calls on memory pressure.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    cache: InMemoryCache,
}

impl MemoryStore {
    /// Creates a new store.
    ///
    /// With a `capacity` (in bytes of decoded pixels), least recently used images are evicted
    /// once the limit is exceeded. Without one, entries stay until removed or purged.
    pub fn new(capacity: Option<u64>) -> Self {
        let mut builder = InMemoryCache::builder().name("images");
        if let Some(capacity) = capacity {
            builder = builder
                .max_capacity(capacity)
                // NOTE: we count the key to the weight as well
                .weigher(|k: &CacheKey, v: &DecodedImage| {
                    let weight = k.as_str().len() as u64 + v.byte_size();
                    weight.try_into().unwrap_or(u32::MAX)
                });
        }
        Self {
            cache: builder.build(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<DecodedImage> {
        self.cache.get(key)
    }

    pub fn put(&self, key: CacheKey, image: DecodedImage) {
        self.cache.insert(key, image);
    }

    /// Inserts `image` unless `key` already has an entry, returning the entry's image.
    pub fn put_if_absent(&self, key: CacheKey, image: DecodedImage) -> DecodedImage {
        self.cache.entry(key).or_insert(image).into_value()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    /// Drops all entries.
    pub fn purge(&self) {
        self.cache.invalidate_all();
    }

    /// The approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}
