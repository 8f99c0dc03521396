use std::time::Duration;

use tokio::time::Instant;

use super::CacheKey;

/// A response saved in the in-memory moka cache.
///
/// Entries are never mutated in place. A refresh replaces the entry wholesale.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    /// The actual data.
    pub data: T,
    /// When this entry was created.
    pub stored_at: Instant,
    /// When this entry stops being served.
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    /// Creates an entry that is valid for `ttl` starting now.
    pub fn new(data: T, ttl: Duration) -> Self {
        let stored_at = Instant::now();
        Self {
            data,
            stored_at,
            expires_at: stored_at + ttl,
        }
    }

    /// Whether the entry may still be served at `now`.
    pub fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// The time-to-live this entry was created with.
    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.stored_at)
    }
}

pub(super) type InMemoryCache<T> = moka::sync::Cache<CacheKey, CacheEntry<T>>;

/// A struct implementing [`moka::Expiry`] that evicts an entry once its own TTL has passed.
///
/// The TTL is derived from the entry rather than from moka's clock. Lookups check
/// [`CacheEntry::is_valid`] themselves, so eviction only reclaims memory.
pub(super) struct CacheExpiration;

impl<T> moka::Expiry<CacheKey, CacheEntry<T>> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry<T>,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl())
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry<T>,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl())
    }
}

pub(super) fn build_cache<T>(name: &str, capacity: u64) -> InMemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    InMemoryCache::builder()
        .name(name)
        .max_capacity(capacity)
        .expire_after(CacheExpiration)
        .build()
}
