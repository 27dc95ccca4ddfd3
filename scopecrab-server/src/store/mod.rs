//! Storage backends behind per-scope admission controllers
//!
//! # Engines
//!
//! ## memory
//! - In-process [`LruStore`], one per scope
//! - Bounded by `ratelimit.memory.max_keys` (0 or negative: unbounded)
//! - State is lost on restart and not shared between instances
//!
//! ## redis
//! - [`RedisStore`] over a shared connection per URL (`ratelimit.redis.url`)
//! - Compare-and-swap runs as a Lua script, so instances can share buckets
//! - Keys are prefixed with the scope so scopes never collide

use crate::error::Result;
use crate::registry::StorageFactory;
use crate::scope::ScopeId;
use crate::scoped_config::AdmissionController;
use crate::source::ScopedOptions;
use async_trait::async_trait;
use scopecrab::{LruStore, Quota, RateLimiter};
use std::sync::Arc;

mod redis_store;

pub use redis_store::{RedisStorage, RedisStore, URL_OPTION};

pub const MAX_KEYS_OPTION: &str = "ratelimit.memory.max_keys";
pub const DEFAULT_MAX_KEYS: i64 = 65_536;

/// The `memory` engine
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStorage;

#[async_trait]
impl StorageFactory for MemoryStorage {
    async fn create(
        &self,
        scope: ScopeId,
        quota: Quota,
        options: &ScopedOptions<'_>,
    ) -> Result<Arc<dyn AdmissionController>> {
        let max_keys = options.i64(MAX_KEYS_OPTION).await?.unwrap_or(DEFAULT_MAX_KEYS);
        tracing::debug!(scope = %scope, max_keys, quota = %quota, "creating memory store");

        let store = LruStore::builder().max_keys(max_keys).build();
        Ok(Arc::new(RateLimiter::new(store, quota)))
    }
}
