//! Per-scope admission settings
//!
//! A [`ScopedConfig`] bundles everything the dispatcher needs for one scope:
//! the disabled flag, the keyer, the admission controller and the denied
//! handler. A config that carries `last_error` records a failed load.

use crate::error::{Error, Result};
use crate::handlers::{DeniedHandler, TooManyRequests};
use crate::scope::ScopeId;
use crate::vary_by::{NullKeyer, VaryByKeyer};
use async_trait::async_trait;
use scopecrab::{RateLimitResult, RateLimiter, Store};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Decides whether `quantity` cells for `key` may pass
#[async_trait]
pub trait AdmissionController: Send + Sync {
    /// Returns `(limited, result)`; `limited == true` means deny
    async fn decide(&self, key: &str, quantity: i64) -> Result<(bool, RateLimitResult)>;
}

#[async_trait]
impl<S: Store + 'static> AdmissionController for RateLimiter<S> {
    async fn decide(&self, key: &str, quantity: i64) -> Result<(bool, RateLimitResult)> {
        let (allowed, result) = self.rate_limit(key, quantity, SystemTime::now()).await?;
        Ok((!allowed, result))
    }
}

pub struct ScopedConfig {
    scope: ScopeId,
    disabled: bool,
    limiter: Option<Arc<dyn AdmissionController>>,
    keyer: Arc<dyn VaryByKeyer>,
    denied_handler: Arc<dyn DeniedHandler>,
    last_error: Option<Error>,
}

/// The parts of a valid config the dispatcher works with
pub struct Admission<'a> {
    pub limiter: &'a Arc<dyn AdmissionController>,
    pub keyer: &'a Arc<dyn VaryByKeyer>,
    pub denied_handler: &'a Arc<dyn DeniedHandler>,
}

impl ScopedConfig {
    pub fn builder(scope: ScopeId) -> ScopedConfigBuilder {
        ScopedConfigBuilder::new(scope)
    }

    /// A config recording that loading `scope` failed with `error`
    pub fn failed(scope: ScopeId, error: Error) -> Self {
        let mut config = Self::builder(scope).build();
        config.last_error = Some(error);
        config
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// No recorded error and a limiter present, unless admission is disabled
    pub fn is_valid(&self) -> bool {
        self.last_error.is_none() && (self.disabled || self.limiter.is_some())
    }

    pub fn limiter(&self) -> Option<&Arc<dyn AdmissionController>> {
        self.limiter.as_ref()
    }

    pub fn keyer(&self) -> &Arc<dyn VaryByKeyer> {
        &self.keyer
    }

    pub fn denied_handler(&self) -> &Arc<dyn DeniedHandler> {
        &self.denied_handler
    }

    /// Borrow the admission parts, or explain why this config cannot admit
    pub fn admission(&self) -> Result<Admission<'_>> {
        if let Some(err) = &self.last_error {
            return Err(err.clone());
        }
        let limiter = self.limiter.as_ref().ok_or_else(|| {
            Error::NotValid(format!("{} has no admission controller", self.scope))
        })?;
        Ok(Admission {
            limiter,
            keyer: &self.keyer,
            denied_handler: &self.denied_handler,
        })
    }
}

impl fmt::Debug for ScopedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedConfig")
            .field("scope", &self.scope)
            .field("disabled", &self.disabled)
            .field("has_limiter", &self.limiter.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Builder for [`ScopedConfig`]
///
/// Unset fields get their defaults at build time: a [`NullKeyer`], the
/// [`TooManyRequests`] denied handler and `disabled = false`. Anything set
/// explicitly is kept as is.
pub struct ScopedConfigBuilder {
    scope: ScopeId,
    disabled: Option<bool>,
    limiter: Option<Arc<dyn AdmissionController>>,
    keyer: Option<Arc<dyn VaryByKeyer>>,
    denied_handler: Option<Arc<dyn DeniedHandler>>,
}

impl ScopedConfigBuilder {
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            disabled: None,
            limiter: None,
            keyer: None,
            denied_handler: None,
        }
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = Some(disabled);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn AdmissionController>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn keyer(mut self, keyer: Arc<dyn VaryByKeyer>) -> Self {
        self.keyer = Some(keyer);
        self
    }

    pub fn denied_handler(mut self, handler: Arc<dyn DeniedHandler>) -> Self {
        self.denied_handler = Some(handler);
        self
    }

    pub fn build(self) -> ScopedConfig {
        ScopedConfig {
            scope: self.scope,
            disabled: self.disabled.unwrap_or(false),
            limiter: self.limiter,
            keyer: self.keyer.unwrap_or_else(|| Arc::new(NullKeyer)),
            denied_handler: self
                .denied_handler
                .unwrap_or_else(|| Arc::new(TooManyRequests)),
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vary_by::CompositeKeyer;
    use axum::http::StatusCode;
    use scopecrab::{LruStore, Period, Quota};

    fn limiter() -> Arc<dyn AdmissionController> {
        Arc::new(RateLimiter::new(
            LruStore::new(),
            Quota::new(1, Period::Minute, 3).unwrap(),
        ))
    }

    #[test]
    fn test_defaults_fill_unset_fields() {
        let config = ScopedConfig::builder(ScopeId::DEFAULT)
            .limiter(limiter())
            .build();

        assert!(config.is_valid());
        assert!(!config.is_disabled());
        let result = RateLimitResult {
            limit: 3,
            remaining: 0,
            reset_after: Default::default(),
            retry_after: Default::default(),
        };
        assert_eq!(
            config.denied_handler().deny(&result).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_explicit_settings_win() {
        let keyer: Arc<dyn VaryByKeyer> = Arc::new(CompositeKeyer::new().path(true));
        let config = ScopedConfig::builder(ScopeId::website(2))
            .keyer(Arc::clone(&keyer))
            .disabled(true)
            .build();

        assert!(config.is_disabled());
        assert!(Arc::ptr_eq(config.keyer(), &keyer));
    }

    #[test]
    fn test_validity() {
        // Nothing to decide with
        let config = ScopedConfig::builder(ScopeId::DEFAULT).build();
        assert!(!config.is_valid());
        assert_eq!(
            config.admission().err().map(|e| e.kind()),
            Some(crate::error::ErrorKind::NotValid)
        );

        // Disabled scopes never consult a limiter
        let config = ScopedConfig::builder(ScopeId::DEFAULT).disabled(true).build();
        assert!(config.is_valid());

        let err = Error::NotValid("requests".into());
        let config = ScopedConfig::failed(ScopeId::website(2), err.clone());
        assert!(!config.is_valid());
        assert_eq!(config.last_error(), Some(&err));
        assert_eq!(config.admission().err(), Some(err));
    }

    #[tokio::test]
    async fn test_limiter_reports_limited() {
        let limiter = limiter();
        for _ in 0..3 {
            let (limited, _) = limiter.decide("k", 1).await.unwrap();
            assert!(!limited);
        }
        let (limited, result) = limiter.decide("k", 1).await.unwrap();
        assert!(limited);
        assert!(result.retry_after > std::time::Duration::ZERO);
    }
}
