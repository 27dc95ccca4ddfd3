//! Per-request admission
//!
//! The [`Dispatcher`] resolves the request's scope, finds (or lazily loads)
//! the scope's config, derives the bucket key and asks the admission
//! controller for a decision. Admitted requests continue to the inner
//! service with rate limit headers attached; everything else is answered by
//! the scope's denied handler or the dispatcher's error handler.
//!
//! Install it with [`admission_middleware`]:
//!
//! ```no_run
//! use axum::{Router, middleware};
//! use scopecrab_server::cache::ConfigCache;
//! use scopecrab_server::loader::ConfigLoader;
//! use scopecrab_server::middleware::{Dispatcher, admission_middleware};
//! use std::sync::Arc;
//!
//! let loader = Arc::new(ConfigLoader::new(Arc::new(ConfigCache::new())));
//! let dispatcher = Arc::new(Dispatcher::new(loader));
//! let app: Router = Router::new()
//!     .fallback(|| async { "hello" })
//!     .layer(middleware::from_fn_with_state(dispatcher, admission_middleware));
//! ```

use crate::cache::ConfigCache;
use crate::error::{Error, ErrorKind, Result};
use crate::handlers::{DeniedHandler, ErrorHandler, ServiceUnavailable};
use crate::loader::ConfigLoader;
use crate::metrics::{Metrics, Outcome};
use crate::scope::{HeaderScopeResolver, ScopeContext, ScopeResolver};
use crate::scoped_config::ScopedConfig;
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;
use scopecrab::RateLimitResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// What admission decided for one request
pub enum Decision {
    /// Admission is disabled for the scope
    Bypass,
    Allowed(RateLimitResult),
    Denied {
        result: RateLimitResult,
        handler: Arc<dyn DeniedHandler>,
    },
    /// No decision could be made
    Failed(Error),
}

impl Decision {
    fn outcome(&self) -> Outcome {
        match self {
            Decision::Bypass => Outcome::Bypassed,
            Decision::Allowed(_) => Outcome::Allowed,
            Decision::Denied { .. } => Outcome::Denied,
            Decision::Failed(_) => Outcome::Error,
        }
    }
}

pub struct Dispatcher {
    cache: Arc<ConfigCache>,
    loader: Arc<ConfigLoader>,
    resolver: Arc<dyn ScopeResolver>,
    error_handler: Arc<dyn ErrorHandler>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// Dispatcher over the loader's cache, resolving scopes from headers and
    /// answering errors with `503`
    pub fn new(loader: Arc<ConfigLoader>) -> Self {
        Self {
            cache: Arc::clone(loader.cache()),
            loader,
            resolver: Arc::new(HeaderScopeResolver::default()),
            error_handler: Arc::new(ServiceUnavailable),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ScopeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    pub fn loader(&self) -> &Arc<ConfigLoader> {
        &self.loader
    }

    /// The config governing `ctx`
    ///
    /// A usable entry under the target scope itself, explicit or aliased,
    /// always wins. With a factory registered, anything else goes to the
    /// loader, which knows whether the target has settings of its own or
    /// shares an ancestor's config. Without a factory the cache falls back
    /// to the nearest valid ancestor.
    pub async fn config_for(&self, ctx: &ScopeContext) -> Result<Arc<ScopedConfig>> {
        if let Some(config) = self.cache.get_cached(ctx.scope()) {
            return Ok(config);
        }
        if self.loader.has_factory() {
            return self.loader.load(ctx).await;
        }
        match self.cache.get(ctx) {
            Err(err) if err.kind() == ErrorKind::NotFound => self.loader.load(ctx).await,
            found => found,
        }
    }

    /// Decide admission for a request without forwarding it
    pub async fn admit(&self, parts: &Parts) -> Decision {
        match self.try_admit(parts).await {
            Ok(decision) => decision,
            Err(err) => Decision::Failed(err),
        }
    }

    async fn try_admit(&self, parts: &Parts) -> Result<Decision> {
        let ctx = self.resolver.resolve(parts)?;
        let config = self.config_for(&ctx).await?;
        if config.is_disabled() {
            tracing::trace!(scope = %ctx, "admission disabled");
            return Ok(Decision::Bypass);
        }

        let admission = config.admission()?;
        let key = admission.keyer.key(parts);
        let (limited, result) = admission.limiter.decide(&key, 1).await?;

        if limited {
            tracing::debug!(
                scope = %ctx,
                key = %key,
                retry_after_ms = result.retry_after.as_millis() as u64,
                "request denied"
            );
            Ok(Decision::Denied {
                result,
                handler: Arc::clone(admission.denied_handler),
            })
        } else {
            tracing::trace!(scope = %ctx, key = %key, remaining = result.remaining, "request allowed");
            Ok(Decision::Allowed(result))
        }
    }

    /// Admit `req` and forward it to `next`, or answer it directly
    pub async fn dispatch(&self, req: Request, next: Next) -> Response {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let decision = self.admit(&parts).await;
        self.metrics.record_request(decision.outcome(), start.elapsed());
        let req = Request::from_parts(parts, body);

        match decision {
            Decision::Bypass => next.run(req).await,
            Decision::Allowed(result) => {
                let mut response = next.run(req).await;
                write_headers(response.headers_mut(), &result, false);
                response
            }
            Decision::Denied { result, handler } => {
                let mut response = handler.deny(&result);
                write_headers(response.headers_mut(), &result, true);
                response
            }
            Decision::Failed(err) => {
                tracing::warn!(error = %err, "admission failed");
                self.error_handler.handle(&err)
            }
        }
    }
}

/// `axum::middleware::from_fn_with_state` entry point
pub async fn admission_middleware(
    State(dispatcher): State<Arc<Dispatcher>>,
    req: Request,
    next: Next,
) -> Response {
    dispatcher.dispatch(req, next).await
}

/// Rate limit headers for `result`; `Retry-After` only when `denied`
pub fn write_headers(headers: &mut HeaderMap, result: &RateLimitResult, denied: bool) {
    if result.limit >= 0 {
        headers.insert(LIMIT_HEADER, HeaderValue::from(result.limit));
    }
    if result.remaining >= 0 {
        headers.insert(REMAINING_HEADER, HeaderValue::from(result.remaining));
    }
    headers.insert(RESET_HEADER, HeaderValue::from(ceil_secs(result.reset_after)));
    if denied {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(ceil_secs(result.retry_after)));
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
