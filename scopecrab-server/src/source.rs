//! Scoped key/value settings behind the lazy loader
//!
//! Values live under a per-scope prefix: `default.<path>`,
//! `websites.<id>.<path>` and `stores.<id>.<path>`. [`ScopedOptions`] reads a
//! path for a request's scope and falls back Store → Website → Default.

use crate::error::{Error, Result};
use crate::scope::{ScopeContext, ScopeId, ScopeKind};
use async_trait::async_trait;
use config::{Config, ConfigError, Environment, File, FileFormat};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const ENV_PREFIX: &str = "SCOPECRAB";

/// Exact, non-inheriting lookup of a single setting
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn lookup(&self, scope: ScopeId, path: &str) -> Result<Option<String>>;
}

/// Full settings key of `path` for `scope`
pub fn scoped_key(scope: ScopeId, path: &str) -> String {
    match scope.kind {
        ScopeKind::Default => format!("default.{path}"),
        ScopeKind::Website => format!("websites.{}.{path}", scope.id),
        ScopeKind::Store => format!("stores.{}.{path}", scope.id),
    }
}

/// Typed reads of settings for one scope with parent fallback
pub struct ScopedOptions<'a> {
    source: &'a dyn ConfigSource,
    ctx: ScopeContext,
}

impl<'a> ScopedOptions<'a> {
    pub fn new(source: &'a dyn ConfigSource, ctx: ScopeContext) -> Self {
        Self { source, ctx }
    }

    pub fn scope(&self) -> ScopeId {
        self.ctx.scope()
    }

    /// The most specific value set for `path`, or `None`
    pub async fn string(&self, path: &str) -> Result<Option<String>> {
        for scope in self.ctx.chain() {
            if let Some(value) = self.source.lookup(scope, path).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub async fn bool(&self, path: &str) -> Result<Option<bool>> {
        let Some(raw) = self.string(path).await? else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(Error::NotValid(format!("{path}: {raw:?} is not a boolean"))),
        }
    }

    pub async fn i64(&self, path: &str) -> Result<Option<i64>> {
        let Some(raw) = self.string(path).await? else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::NotValid(format!("{path}: {raw:?} is not an integer")))
    }

    /// Comma separated list; blank entries are skipped
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .string(path)
            .await?
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory source keyed by full settings key
#[derive(Default)]
pub struct MapSource {
    values: RwLock<HashMap<String, String>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a full key such as `websites.2.ratelimit.burst`
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }
}

#[async_trait]
impl ConfigSource for MapSource {
    async fn lookup(&self, scope: ScopeId, path: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(&scoped_key(scope, path)).cloned())
    }
}

/// Settings file plus `SCOPECRAB__` environment overrides
///
/// Environment keys use `__` as the path separator, so
/// `SCOPECRAB__WEBSITES__2__RATELIMIT__BURST=5` sets
/// `websites.2.ratelimit.burst`.
pub struct SettingsSource {
    path: Option<PathBuf>,
    inline: Option<String>,
    settings: RwLock<Config>,
    reloads: AtomicU64,
}

impl SettingsSource {
    /// Read `path` (any format the `config` crate knows by extension) and the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let settings = Self::build(Some(&path), None)?;
        Ok(Self {
            path: Some(path),
            inline: None,
            settings: RwLock::new(settings),
            reloads: AtomicU64::new(0),
        })
    }

    /// Environment overrides only
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            path: None,
            inline: None,
            settings: RwLock::new(Self::build(None, None)?),
            reloads: AtomicU64::new(0),
        })
    }

    /// Parse TOML text; environment overrides still apply
    pub fn from_toml(toml: &str) -> Result<Self> {
        Ok(Self {
            path: None,
            inline: Some(toml.to_string()),
            settings: RwLock::new(Self::build(None, Some(toml))?),
            reloads: AtomicU64::new(0),
        })
    }

    /// Re-read the file and environment; the old settings stay on error
    pub fn reload(&self) -> Result<()> {
        let fresh = Self::build(self.path.as_deref(), self.inline.as_deref())?;
        *self.settings.write() = fresh;
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    fn build(path: Option<&Path>, inline: Option<&str>) -> Result<Config> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        if let Some(toml) = inline {
            builder = builder.add_source(File::from_str(toml, FileFormat::Toml));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::NotValid(format!("settings: {e}")))
    }
}

#[async_trait]
impl ConfigSource for SettingsSource {
    async fn lookup(&self, scope: ScopeId, path: &str) -> Result<Option<String>> {
        let key = scoped_key(scope, path);
        match self.settings.read().get_string(&key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(Error::NotValid(format!("{key}: {e}"))),
        }
    }
}
