use super::Store;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

#[cfg(feature = "ahash")]
type BuildHasher = ahash::RandomState;
#[cfg(not(feature = "ahash"))]
type BuildHasher = std::collections::hash_map::RandomState;

const DEFAULT_MAX_KEYS: usize = 65_536;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process store bounded by a least-recently-used key count
///
/// Entries carry an expiry and are treated as absent once it passes. When the
/// store is full, inserting a new key evicts the least recently used one. An
/// evicted key simply starts over with a full burst on its next request.
/// Inserts also sweep out expired keys at most once per cleanup interval, so
/// an unbounded store does not keep keys that are never seen again.
///
/// # Example
///
/// ```
/// use scopecrab::LruStore;
///
/// // Keep at most 10 000 keys
/// let store = LruStore::builder().max_keys(10_000).build();
/// assert_eq!(store.capacity(), Some(10_000));
///
/// // Zero or negative means unbounded
/// let store = LruStore::builder().max_keys(0).build();
/// assert_eq!(store.capacity(), None);
/// ```
pub struct LruStore {
    data: Mutex<Data>,
    cleanup_interval: Duration,
    evictions: AtomicU64,
}

struct Data {
    entries: LruCache<String, Entry, BuildHasher>,
    next_cleanup: SystemTime,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: SystemTime,
}

impl Entry {
    fn new(value: i64, ttl: Duration, now: SystemTime) -> Self {
        // Saturate instead of panicking on absurd TTLs
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));
        Entry { value, expires_at }
    }

    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

/// Builder for configuring an [`LruStore`]
pub struct LruStoreBuilder {
    max_keys: i64,
    cleanup_interval: Duration,
}

impl LruStore {
    /// Create a store holding at most 65 536 keys
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the store
    pub fn builder() -> LruStoreBuilder {
        LruStoreBuilder {
            max_keys: DEFAULT_MAX_KEYS as i64,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    /// Maximum number of keys, or `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        let cap = self.data.lock().entries.cap().get();
        (cap != usize::MAX).then_some(cap)
    }

    /// Number of keys currently held, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.data.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live keys pushed out because the store was full
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn insert(&self, data: &mut Data, key: &str, entry: Entry, now: SystemTime) {
        self.maybe_clean_expired(data, now);
        if let Some((evicted, old)) = data.entries.push(key.to_string(), entry) {
            if evicted != key && old.is_live(now) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn maybe_clean_expired(&self, data: &mut Data, now: SystemTime) {
        if now < data.next_cleanup {
            return;
        }
        let expired: Vec<String> = data
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            data.entries.pop(key);
        }
        data.next_cleanup = now + self.cleanup_interval;
    }
}

impl Default for LruStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LruStoreBuilder {
    /// Maximum number of keys; `0` or negative means unbounded
    pub fn max_keys(mut self, max_keys: i64) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Minimum time between sweeps of expired keys
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn build(self) -> LruStore {
        let hasher = BuildHasher::default();
        let data = match usize::try_from(self.max_keys)
            .ok()
            .and_then(NonZeroUsize::new)
        {
            Some(cap) => LruCache::with_hasher(cap, hasher),
            None => LruCache::unbounded_with_hasher(hasher),
        };

        LruStore {
            data: Mutex::new(Data {
                entries: data,
                next_cleanup: SystemTime::now() + self.cleanup_interval,
            }),
            cleanup_interval: self.cleanup_interval,
            evictions: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Store for LruStore {
    async fn get(&self, key: &str, now: SystemTime) -> Result<Option<i64>, String> {
        let mut data = self.data.lock();
        match data.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value)),
            Some(_) => {
                data.entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn compare_and_swap_with_ttl(
        &self,
        key: &str,
        old: i64,
        new: i64,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, String> {
        let mut data = self.data.lock();
        match data.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == old => {
                *entry = Entry::new(new, ttl, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_if_not_exists_with_ttl(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, String> {
        let mut data = self.data.lock();
        if data.entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        self.insert(&mut data, key, Entry::new(value, ttl, now), now);
        Ok(true)
    }
}
