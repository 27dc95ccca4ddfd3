//! Lazy, deduplicated loading of scoped configs
//!
//! On a cache miss the registered [`OptionFactory`] names the scope that owns
//! the target's settings and builds that scope's config. A target without
//! settings of its own is aliased to its owner's config, so it shares the
//! owner's limiter. Concurrent misses for one scope share a single factory
//! call. A failed load is remembered: callers inside the retry backoff get
//! the remembered error without touching the factory again.

use crate::cache::ConfigCache;
use crate::error::{Error, Result};
use crate::inflight::InFlight;
use crate::metrics::Metrics;
use crate::scope::{ScopeContext, ScopeId};
use crate::scoped_config::ScopedConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Builds the config for a scope from some slow external source
#[async_trait]
pub trait OptionFactory: Send + Sync {
    async fn load(&self, ctx: ScopeContext) -> Result<ScopedConfig>;

    /// The scope on `ctx`'s chain whose config `ctx` should use
    ///
    /// Every scope owns itself unless the factory says otherwise.
    async fn owner(&self, ctx: ScopeContext) -> Result<ScopeId> {
        Ok(ctx.scope())
    }
}

#[async_trait]
impl<F, Fut> OptionFactory for F
where
    F: Fn(ScopeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ScopedConfig>> + Send,
{
    async fn load(&self, ctx: ScopeContext) -> Result<ScopedConfig> {
        self(ctx).await
    }
}

/// Exponential retry backoff for failed loads
///
/// The n-th consecutive failure blocks reloads for `initial * 2^(n-1)`,
/// capped at `max`. A zero `initial` retries on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const NONE: Backoff = Backoff {
        initial: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial.saturating_mul(1 << exp).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::NONE
    }
}

struct Failure {
    error: Error,
    failures: u32,
    retry_at: Instant,
}

pub struct ConfigLoader {
    cache: Arc<ConfigCache>,
    factory: Option<Arc<dyn OptionFactory>>,
    inflight: InFlight<Arc<ScopedConfig>>,
    failures: Mutex<HashMap<ScopeId, Failure>>,
    backoff: Backoff,
    timeout: Option<Duration>,
    metrics: Option<Arc<Metrics>>,
}

impl ConfigLoader {
    /// A loader without a factory; every miss is [`Error::NotFound`]
    pub fn new(cache: Arc<ConfigCache>) -> Self {
        Self {
            cache,
            factory: None,
            inflight: InFlight::new(),
            failures: Mutex::new(HashMap::new()),
            backoff: Backoff::NONE,
            timeout: None,
            metrics: None,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn OptionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Give up on a factory call after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn has_factory(&self) -> bool {
        self.factory.is_some()
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    /// Load and install the config for the target scope of `ctx`
    ///
    /// Concurrent calls for the same scope share one factory call and all
    /// receive the same outcome. When the factory names an ancestor as the
    /// owner, the ancestor's config is loaded (or reused) and the target is
    /// aliased to it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no factory is registered
    /// - [`Error::LoadFailed`] wrapping the factory's error
    pub async fn load(&self, ctx: &ScopeContext) -> Result<Arc<ScopedConfig>> {
        let target = ctx.scope();
        let Some(factory) = &self.factory else {
            return Err(Error::NotFound(format!(
                "no configuration cached for {target} and no loader registered"
            )));
        };

        let owner = self
            .bounded(target, factory.owner(*ctx))
            .await
            .map_err(|e| Error::load_failed(target, e))?;
        let config = self.load_scope(factory, ctx.up_to(owner)).await?;
        if owner != target {
            tracing::debug!(scope = %target, owner = %owner, "sharing ancestor configuration");
            self.cache.alias(target, owner, Arc::clone(&config));
        }
        Ok(config)
    }

    /// Forget all remembered failures, e.g. after the source was reloaded
    pub fn reset_failures(&self) {
        self.failures.lock().clear();
    }

    async fn load_scope(
        &self,
        factory: &Arc<dyn OptionFactory>,
        ctx: ScopeContext,
    ) -> Result<Arc<ScopedConfig>> {
        let scope = ctx.scope();
        if let Some(config) = self.cache.get_direct(scope).filter(|c| c.is_valid()) {
            return Ok(config);
        }
        if let Some(err) = self.pending_failure(scope) {
            tracing::trace!(scope = %scope, "load suppressed until retry deadline");
            return Err(err);
        }

        let (result, shared) = self
            .inflight
            .run(&scope.to_string(), || self.load_uncached(factory.as_ref(), ctx))
            .await;

        if shared {
            if let Some(metrics) = &self.metrics {
                metrics.record_shared_load();
            }
        }
        result
    }

    async fn load_uncached(
        &self,
        factory: &dyn OptionFactory,
        ctx: ScopeContext,
    ) -> Result<Arc<ScopedConfig>> {
        let scope = ctx.scope();

        // Another leader may have finished between our miss and now
        if let Some(config) = self.cache.get_direct(scope).filter(|c| c.is_valid()) {
            return Ok(config);
        }
        if let Some(err) = self.pending_failure(scope) {
            return Err(err);
        }

        tracing::debug!(scope = %scope, "loading configuration");
        if let Some(metrics) = &self.metrics {
            metrics.record_load();
        }

        let loaded = self.bounded(scope, factory.load(ctx)).await;

        let checked = loaded.and_then(|config| {
            if config.is_valid() {
                Ok(config)
            } else {
                Err(config.last_error().cloned().unwrap_or_else(|| {
                    Error::NotValid(format!("{scope} loaded without an admission controller"))
                }))
            }
        });

        match checked {
            Ok(config) => {
                let config = Arc::new(config);
                self.cache.set(scope, Arc::clone(&config));
                self.failures.lock().remove(&scope);
                tracing::info!(scope = %scope, disabled = config.is_disabled(), "configuration loaded");
                Ok(config)
            }
            Err(source) => {
                let err = Error::load_failed(scope, source);
                self.record_failure(scope, &err);
                self.cache
                    .set(scope, Arc::new(ScopedConfig::failed(scope, err.clone())));
                if let Some(metrics) = &self.metrics {
                    metrics.record_load_failure();
                }
                tracing::warn!(scope = %scope, error = %err, "configuration load failed");
                Err(err)
            }
        }
    }

    /// Run a factory call under the configured timeout
    async fn bounded<T>(&self, scope: ScopeId, call: impl Future<Output = Result<T>>) -> Result<T> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(Error::Unavailable(format!(
                    "loading {scope} took longer than {limit:?}"
                )))
            }),
            None => call.await,
        }
    }

    fn pending_failure(&self, scope: ScopeId) -> Option<Error> {
        let failures = self.failures.lock();
        failures
            .get(&scope)
            .filter(|f| f.retry_at > Instant::now())
            .map(|f| f.error.clone())
    }

    fn record_failure(&self, scope: ScopeId, err: &Error) {
        let mut failures = self.failures.lock();
        let count = failures.get(&scope).map_or(1, |f| f.failures.saturating_add(1));
        let delay = self.backoff.delay(count);
        failures.insert(
            scope,
            Failure {
                error: err.clone(),
                failures: count,
                retry_at: Instant::now() + delay,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::scoped_config::AdmissionController;
    use scopecrab::{LruStore, Period, Quota, RateLimiter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn valid(scope: ScopeId) -> ScopedConfig {
        let limiter: Arc<dyn AdmissionController> = Arc::new(RateLimiter::new(
            LruStore::new(),
            Quota::new(10, Period::Second, 1).unwrap(),
        ));
        ScopedConfig::builder(scope).limiter(limiter).build()
    }

    /// Factory that fails the first `fail_first` calls
    fn counting_factory(
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    ) -> Arc<dyn OptionFactory> {
        Arc::new(move |ctx: ScopeContext| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                if n < fail_first {
                    Err(Error::NotValid("ratelimit.requests must be positive".into()))
                } else {
                    Ok(valid(ctx.scope()))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_no_factory_is_not_found() {
        let loader = ConfigLoader::new(Arc::new(ConfigCache::new()));
        let err = loader.load(&ScopeContext::website(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_load_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ConfigCache::new());
        let loader = Arc::new(
            ConfigLoader::new(Arc::clone(&cache)).with_factory(counting_factory(Arc::clone(&calls), 0)),
        );

        let mut handles = Vec::new();
        for _ in 0..25 {
            let loader = Arc::clone(&loader);
            handles.push(tokio::spawn(async move {
                loader.load(&ScopeContext::website(2)).await
            }));
        }

        let mut configs = Vec::new();
        for handle in handles {
            configs.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for config in &configs {
            assert!(Arc::ptr_eq(config, &configs[0]));
        }
        let cached = cache.get(&ScopeContext::website(2)).unwrap();
        assert!(Arc::ptr_eq(&cached, &configs[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_then_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ConfigCache::new());
        let loader = Arc::new(
            ConfigLoader::new(Arc::clone(&cache)).with_factory(counting_factory(Arc::clone(&calls), 1)),
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let loader = Arc::clone(&loader);
            handles.push(tokio::spawn(async move {
                loader.load(&ScopeContext::website(2)).await
            }));
        }
        let mut errors = Vec::new();
        for handle in handles {
            errors.push(handle.await.unwrap().unwrap_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for err in &errors {
            assert_eq!(err, &errors[0]);
            assert_eq!(err.kind(), ErrorKind::NotValid);
            assert!(matches!(err, Error::LoadFailed { scope, .. } if *scope == ScopeId::website(2)));
        }

        // Cached-Invalid entry recorded
        let entry = cache.get_direct(ScopeId::website(2)).unwrap();
        assert!(!entry.is_valid());

        // No backoff configured: the next request loads again
        let config = loader.load(&ScopeContext::website(2)).await.unwrap();
        assert!(config.is_valid());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_suppresses_reloads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = ConfigLoader::new(Arc::new(ConfigCache::new()))
            .with_factory(counting_factory(Arc::clone(&calls), 2))
            .with_backoff(Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(10),
            });
        let ctx = ScopeContext::website(3);

        assert!(loader.load(&ctx).await.is_err());
        assert!(loader.load(&ctx).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(loader.load(&ctx).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Second failure doubles the wait
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(loader.load(&ctx).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(loader.load(&ctx).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unavailable() {
        let factory: Arc<dyn OptionFactory> = Arc::new(|_ctx: ScopeContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(valid(ScopeId::DEFAULT))
        });
        let loader = ConfigLoader::new(Arc::new(ConfigCache::new()))
            .with_factory(factory)
            .with_timeout(Duration::from_secs(5));

        let err = loader.load(&ScopeContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_invalid_config_counts_as_failure() {
        let factory: Arc<dyn OptionFactory> =
            Arc::new(|ctx: ScopeContext| async move { Ok(ScopedConfig::builder(ctx.scope()).build()) });
        let loader = ConfigLoader::new(Arc::new(ConfigCache::new())).with_factory(factory);

        let err = loader.load(&ScopeContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);
    }

    /// Only Default carries settings; everything else shares it
    struct DefaultOnly {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OptionFactory for DefaultOnly {
        async fn load(&self, ctx: ScopeContext) -> Result<ScopedConfig> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(valid(ctx.scope()))
        }

        async fn owner(&self, _ctx: ScopeContext) -> Result<ScopeId> {
            Ok(ScopeId::DEFAULT)
        }
    }

    #[tokio::test]
    async fn test_unconfigured_scopes_share_owner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ConfigCache::new());
        let loader = ConfigLoader::new(Arc::clone(&cache)).with_factory(Arc::new(DefaultOnly {
            calls: Arc::clone(&calls),
        }));

        let first = loader.load(&ScopeContext::website(2)).await.unwrap();
        let second = loader.load(&ScopeContext::new(3, 9).unwrap()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.scope(), ScopeId::DEFAULT);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(cache.get_direct(ScopeId::website(2)).is_none());
        assert_eq!(cache.alias_of(ScopeId::website(2)), Some(ScopeId::DEFAULT));
        assert_eq!(cache.alias_of(ScopeId::store(3, 9)), Some(ScopeId::DEFAULT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_honours_failure_recorded_meanwhile() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(Arc::clone(&calls), 0);
        let loader = ConfigLoader::new(Arc::new(ConfigCache::new()))
            .with_factory(Arc::clone(&factory))
            .with_backoff(Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(10),
            });
        let scope = ScopeId::website(2);

        // A previous leader failed after this caller passed the backoff check
        let failed = Error::load_failed(scope, Error::NotValid("bad".into()));
        loader.record_failure(scope, &failed);

        let err = loader
            .load_uncached(factory.as_ref(), ScopeContext::website(2))
            .await
            .unwrap_err();
        assert_eq!(err, failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(loader.load_uncached(factory.as_ref(), ScopeContext::website(2)).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
        assert_eq!(Backoff::NONE.delay(3), Duration::ZERO);
    }
}
