//! Builds scoped configs from settings
//!
//! Recognised settings, all under `ratelimit.` and resolved with
//! Store → Website → Default fallback:
//!
//! | Setting | Meaning |
//! |---------|---------|
//! | `disabled` | skip admission entirely |
//! | `requests` | requests per `duration` (required unless disabled) |
//! | `duration` | `s`, `i`, `h` or `d` (required unless disabled) |
//! | `burst` | back-to-back requests allowed, default 0 (treated as 1) |
//! | `storage_engine` | registered engine name, default `memory` |
//! | `vary_by.*` | bucket key attributes, see [`keyer_from_options`] |
//!
//! A website or store with none of these set has no config of its own and
//! shares its nearest configured ancestor's, limiter and buckets included.
//! `stores.<id>.website` pins a store to its website; reaching the store
//! through any other website is `NotValid`.

use crate::error::{Error, Result};
use crate::loader::OptionFactory;
use crate::registry::{BackendRegistry, MEMORY};
use crate::scope::{ScopeContext, ScopeId, ScopeKind};
use crate::scoped_config::ScopedConfig;
use crate::source::{ConfigSource, ScopedOptions};
use crate::store::{MAX_KEYS_OPTION, URL_OPTION};
use crate::vary_by::{CompositeKeyer, NullKeyer, VaryByKeyer};
use async_trait::async_trait;
use scopecrab::Quota;
use std::sync::Arc;

pub const DISABLED: &str = "ratelimit.disabled";
pub const REQUESTS: &str = "ratelimit.requests";
pub const DURATION: &str = "ratelimit.duration";
pub const BURST: &str = "ratelimit.burst";
pub const STORAGE_ENGINE: &str = "ratelimit.storage_engine";
/// Owning website of a store, read from the store's own settings only
pub const STORE_WEBSITE: &str = "website";

const VARY_BY: [&str; 9] = [
    "ratelimit.vary_by.remote_addr",
    "ratelimit.vary_by.forwarded_for",
    "ratelimit.vary_by.method",
    "ratelimit.vary_by.path",
    "ratelimit.vary_by.case_fold",
    "ratelimit.vary_by.headers",
    "ratelimit.vary_by.params",
    "ratelimit.vary_by.cookies",
    "ratelimit.vary_by.separator",
];

/// [`OptionFactory`] reading a [`ConfigSource`] and creating limiters through a [`BackendRegistry`]
pub struct SourceFactory {
    source: Arc<dyn ConfigSource>,
    registry: Arc<BackendRegistry>,
}

impl SourceFactory {
    pub fn new(source: Arc<dyn ConfigSource>, registry: Arc<BackendRegistry>) -> Self {
        Self { source, registry }
    }

    async fn quota(options: &ScopedOptions<'_>) -> Result<Quota> {
        let requests = options
            .i64(REQUESTS)
            .await?
            .ok_or_else(|| Error::Empty(format!("{REQUESTS} is not set")))?;
        let duration = options
            .string(DURATION)
            .await?
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| Error::Empty(format!("{DURATION} is not set")))?;
        let burst = options.i64(BURST).await?.unwrap_or(0);

        Ok(Quota::parse(requests, &duration, burst)?)
    }

    /// Whether `scope` sets anything that shapes its config
    async fn has_settings(&self, scope: ScopeId) -> Result<bool> {
        let paths = [
            DISABLED,
            REQUESTS,
            DURATION,
            BURST,
            STORAGE_ENGINE,
            MAX_KEYS_OPTION,
            URL_OPTION,
        ];
        for path in paths.into_iter().chain(VARY_BY) {
            if self.source.lookup(scope, path).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_store_parent(&self, ctx: &ScopeContext) -> Result<()> {
        let scope = ctx.scope();
        let Some(raw) = self.source.lookup(scope, STORE_WEBSITE).await? else {
            return Ok(());
        };
        let website: u32 = raw.trim().parse().map_err(|_| {
            Error::NotValid(format!("stores.{}.{STORE_WEBSITE}: {raw:?} is not a website id", scope.id))
        })?;
        if website != ctx.website_id {
            return Err(Error::NotValid(format!(
                "store {} belongs to website {website}, not {}",
                scope.id, ctx.website_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OptionFactory for SourceFactory {
    async fn load(&self, ctx: ScopeContext) -> Result<ScopedConfig> {
        let scope = ctx.scope();
        let options = ScopedOptions::new(self.source.as_ref(), ctx);

        let disabled = options.bool(DISABLED).await?.unwrap_or(false);
        let mut builder = ScopedConfig::builder(scope)
            .disabled(disabled)
            .keyer(keyer_from_options(&options).await?);

        if !disabled {
            let quota = Self::quota(&options).await?;
            let engine = options
                .string(STORAGE_ENGINE)
                .await?
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| MEMORY.to_string());
            let limiter = self
                .registry
                .get(&engine)?
                .create(scope, quota, &options)
                .await?;
            tracing::debug!(scope = %scope, engine, quota = %quota, "built admission controller");
            builder = builder.limiter(limiter);
        }

        Ok(builder.build())
    }

    async fn owner(&self, ctx: ScopeContext) -> Result<ScopeId> {
        if ctx.scope().kind == ScopeKind::Store {
            self.check_store_parent(&ctx).await?;
        }
        for scope in ctx.chain() {
            if scope == ScopeId::DEFAULT || self.has_settings(scope).await? {
                return Ok(scope);
            }
        }
        Ok(ScopeId::DEFAULT)
    }
}

/// Keyer configured by `ratelimit.vary_by.*`
///
/// Booleans: `remote_addr`, `forwarded_for`, `method`, `path`, `case_fold`.
/// Comma separated name lists: `headers`, `params`, `cookies`. `separator`
/// defaults to a newline. With none of them set the scope uses a single
/// bucket ([`NullKeyer`]).
pub async fn keyer_from_options(options: &ScopedOptions<'_>) -> Result<Arc<dyn VaryByKeyer>> {
    let remote_addr = flag(options, "remote_addr").await?;
    let forwarded_for = flag(options, "forwarded_for").await?;
    let method = flag(options, "method").await?;
    let path = flag(options, "path").await?;
    let case_fold = flag(options, "case_fold").await?;
    let headers = options.list("ratelimit.vary_by.headers").await?;
    let params = options.list("ratelimit.vary_by.params").await?;
    let cookies = options.list("ratelimit.vary_by.cookies").await?;
    let separator = options.string("ratelimit.vary_by.separator").await?;

    let selects_anything = remote_addr
        || forwarded_for
        || method
        || path
        || !headers.is_empty()
        || !params.is_empty()
        || !cookies.is_empty();
    if !selects_anything {
        return Ok(Arc::new(NullKeyer));
    }

    let mut keyer = CompositeKeyer::new()
        .remote_addr(remote_addr)
        .forwarded_for(forwarded_for)
        .method(method)
        .path(path)
        .headers(headers)
        .params(params)
        .cookies(cookies)
        .case_fold(case_fold);
    if let Some(separator) = separator {
        keyer = keyer.separator(separator);
    }
    Ok(Arc::new(keyer))
}

async fn flag(options: &ScopedOptions<'_>, name: &str) -> Result<bool> {
    let value = options.bool(&format!("ratelimit.vary_by.{name}")).await?;
    Ok(value.unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::source::MapSource;
    use axum::http::Request;
    use std::time::Duration;

    fn factory(source: MapSource) -> SourceFactory {
        SourceFactory::new(
            Arc::new(source),
            Arc::new(BackendRegistry::with_defaults(Duration::from_millis(250))),
        )
    }

    fn base() -> MapSource {
        MapSource::new()
            .with("default.ratelimit.requests", "1")
            .with("default.ratelimit.duration", "i")
            .with("default.ratelimit.burst", "3")
    }

    #[tokio::test]
    async fn test_builds_memory_limiter() {
        let config = factory(base()).load(ScopeContext::website(2)).await.unwrap();
        assert!(config.is_valid());
        assert!(!config.is_disabled());

        let limiter = config.limiter().unwrap();
        for _ in 0..3 {
            assert!(!limiter.decide("", 1).await.unwrap().0);
        }
        let (limited, result) = limiter.decide("", 1).await.unwrap();
        assert!(limited);
        assert_eq!(result.limit, 3);
    }

    #[tokio::test]
    async fn test_disabled_needs_no_rate() {
        let source = MapSource::new().with("stores.5.ratelimit.disabled", "true");
        let config = factory(source)
            .load(ScopeContext::new(2, 5).unwrap())
            .await
            .unwrap();
        assert!(config.is_disabled());
        assert!(config.is_valid());
        assert!(config.limiter().is_none());
    }

    #[tokio::test]
    async fn test_missing_rate_is_empty() {
        let source = MapSource::new().with("default.ratelimit.duration", "i");
        let err = factory(source).load(ScopeContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Empty);
    }

    #[tokio::test]
    async fn test_bad_values_are_not_valid() {
        for (key, value) in [
            ("websites.2.ratelimit.duration", "m"),
            ("websites.2.ratelimit.requests", "0"),
            ("websites.2.ratelimit.burst", "-1"),
        ] {
            let source = base().with(key, value);
            let err = factory(source).load(ScopeContext::website(2)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotValid, "{key}={value}");
        }
    }

    #[tokio::test]
    async fn test_unknown_engine_is_not_found() {
        let source = base().with("default.ratelimit.storage_engine", "memcached");
        let err = factory(source).load(ScopeContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_redis_without_url_is_empty() {
        let source = base().with("default.ratelimit.storage_engine", "redis");
        let err = factory(source).load(ScopeContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Empty);
    }

    #[tokio::test]
    async fn test_vary_by_settings() {
        let source = base()
            .with("websites.2.ratelimit.vary_by.method", "true")
            .with("websites.2.ratelimit.vary_by.params", "sku")
            .with("websites.2.ratelimit.vary_by.separator", "|");
        let config = factory(source).load(ScopeContext::website(2)).await.unwrap();

        let (req, ()) = Request::put("/cart?sku=A1").body(()).unwrap().into_parts();
        assert_eq!(config.keyer().key(&req), "PUT|A1|");

        // Default scope has no vary_by settings: one bucket
        let config = factory(base()).load(ScopeContext::default()).await.unwrap();
        assert_eq!(config.keyer().key(&req), "");
    }

    async fn owner_of(factory: &SourceFactory, website: u32, store: u32) -> Result<ScopeId> {
        factory.owner(ScopeContext::new(website, store).unwrap()).await
    }

    #[tokio::test]
    async fn test_owner_is_nearest_configured_scope() {
        let source = base()
            .with("websites.2.ratelimit.burst", "5")
            .with("stores.7.ratelimit.vary_by.path", "true")
            .with("stores.8.website", "2");
        let settings = factory(source);

        assert_eq!(owner_of(&settings, 2, 0).await.unwrap(), ScopeId::website(2));
        assert_eq!(owner_of(&settings, 2, 7).await.unwrap(), ScopeId::store(2, 7));
        // A parent mapping alone is not a setting
        assert_eq!(owner_of(&settings, 2, 8).await.unwrap(), ScopeId::website(2));
        assert_eq!(owner_of(&settings, 9, 0).await.unwrap(), ScopeId::DEFAULT);
        assert_eq!(owner_of(&settings, 9, 4).await.unwrap(), ScopeId::DEFAULT);
        assert_eq!(owner_of(&settings, 0, 0).await.unwrap(), ScopeId::DEFAULT);
    }

    #[tokio::test]
    async fn test_store_reached_through_wrong_website() {
        let pinned = factory(base().with("stores.8.website", "2"));
        assert!(owner_of(&pinned, 2, 8).await.is_ok());
        let err = owner_of(&pinned, 3, 8).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);

        let garbled = factory(base().with("stores.8.website", "two"));
        let err = owner_of(&garbled, 2, 8).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);
    }
}
