//! Named storage engines
//!
//! The application owns a [`BackendRegistry`] and hands it to whatever builds
//! scoped configs; there is no process-wide registration.

use crate::error::{Error, Result};
use crate::scope::ScopeId;
use crate::scoped_config::AdmissionController;
use crate::source::ScopedOptions;
use crate::store::{MemoryStorage, RedisStorage};
use async_trait::async_trait;
use scopecrab::Quota;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const MEMORY: &str = "memory";
pub const REDIS: &str = "redis";

/// Creates the admission controller of one scope for a storage engine
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn create(
        &self,
        scope: ScopeId,
        quota: Quota,
        options: &ScopedOptions<'_>,
    ) -> Result<Arc<dyn AdmissionController>>;
}

#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, Arc<dyn StorageFactory>>,
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// `memory` and `redis`, with `redis_timeout` per Redis call
    pub fn with_defaults(redis_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(MEMORY, Arc::new(MemoryStorage));
        registry.register(REDIS, Arc::new(RedisStorage::new(redis_timeout)));
        registry
    }

    /// Register `factory` under `name`, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn StorageFactory>) {
        self.factories.insert(name.into().to_ascii_lowercase(), factory);
    }

    /// # Errors
    ///
    /// [`Error::NotFound`] for an unregistered engine name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageFactory>> {
        self.factories
            .get(&name.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "storage engine {name:?} (registered: {})",
                    self.names().join(", ")
                ))
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let registry = BackendRegistry::with_defaults(Duration::from_millis(250));
        assert_eq!(registry.names(), vec!["memory", "redis"]);
        assert!(registry.get("Memory").is_ok());
    }

    #[test]
    fn test_unknown_engine_is_not_found() {
        let registry = BackendRegistry::new();
        let err = registry.get("memcached").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = BackendRegistry::new();
        registry.register("memory", Arc::new(MemoryStorage));
        registry.register("MEMORY", Arc::new(MemoryStorage));
        assert_eq!(registry.names(), vec!["memory"]);
    }
}
