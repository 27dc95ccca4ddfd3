//! Storage backends for the per-key theoretical arrival time
//!
//! A [`Store`] holds one `i64` (nanoseconds since the Unix epoch) per key and
//! must make the compare-and-swap and set-if-absent operations atomic with
//! respect to each other, so that concurrent decisions on one key can never
//! lose an update.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

mod lru_store;

pub use lru_store::{LruStore, LruStoreBuilder};


/// Store trait for rate limiter state storage (similar to redis-cell)
///
/// Implementations take `&self` and synchronize internally. Errors are
/// reported as plain strings and surface as [`CellError::Store`](super::CellError::Store).
#[async_trait]
pub trait Store: Send + Sync {
    /// Get the live value for `key`, ignoring expired entries
    async fn get(&self, key: &str, now: SystemTime) -> Result<Option<i64>, String>;

    /// Replace `old` with `new` if and only if the live value is still `old`
    async fn compare_and_swap_with_ttl(
        &self,
        key: &str,
        old: i64,
        new: i64,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, String>;

    /// Insert `value` if `key` has no live value
    async fn set_if_not_exists_with_ttl(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, String>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get(&self, key: &str, now: SystemTime) -> Result<Option<i64>, String> {
        (**self).get(key, now).await
    }

    async fn compare_and_swap_with_ttl(
        &self,
        key: &str,
        old: i64,
        new: i64,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, String> {
        (**self)
            .compare_and_swap_with_ttl(key, old, new, ttl, now)
            .await
    }

    async fn set_if_not_exists_with_ttl(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
        now: SystemTime,
    ) -> Result<bool, String> {
        (**self)
            .set_if_not_exists_with_ttl(key, value, ttl, now)
            .await
    }
}
