//! # ScopeCrab Server
//!
//! Admission control for multi-tenant HTTP services. Every request belongs to
//! a scope in a three level hierarchy, Default → Website → Store, and each
//! scope may carry its own GCRA rate limit, bucket key policy and storage
//! backend. Scopes without settings of their own inherit their parent's.
//!
//! ## Quick Start
//!
//! ```bash
//! # settings.toml
//! # [default.ratelimit]
//! # requests = 100
//! # duration = "i"
//! # burst = 20
//! #
//! # [websites.2.ratelimit]
//! # requests = 1
//! # duration = "s"
//! # vary_by = { remote_addr = true }
//!
//! scopecrab --settings settings.toml --port 8080
//! curl -i -H 'X-Website-Id: 2' http://127.0.0.1:8080/checkout
//! ```
//!
//! ## How a request is decided
//!
//! ```text
//!  request ──▶ ScopeResolver ──▶ ConfigCache ──miss──▶ ConfigLoader ──▶ OptionFactory
//!                                    │                     (one load per scope,
//!                                    │                      shared by all waiters)
//!                                    ▼
//!                              ScopedConfig
//!                       disabled? ──yes──▶ forward
//!                                    │
//!                              VaryByKeyer ──▶ AdmissionController ──▶ 204 / 429
//! ```
//!
//! 1. [`scope::ScopeResolver`] maps the request to a [`scope::ScopeContext`]
//!    (`X-Website-Id` / `X-Store-Id` by default).
//! 2. A config cached for the target scope itself is used as is. Otherwise
//!    the [`loader::ConfigLoader`] builds it exactly once, however many
//!    requests are waiting for it, with settings inherited along
//!    Store → Website → Default. A scope with no settings of its own shares
//!    the limiter of the nearest ancestor that has some. Without an option
//!    factory the
//!    [`cache::ConfigCache`] serves the nearest valid ancestor instead.
//! 3. A disabled scope is forwarded untouched.
//! 4. The scope's [`vary_by::VaryByKeyer`] derives the bucket key and the
//!    [`scoped_config::AdmissionController`] decides.
//! 5. `X-RateLimit-Limit`, `X-RateLimit-Remaining`, `X-RateLimit-Reset` and,
//!    on denial, `Retry-After` are set on the response.
//!
//! ## Storage engines
//!
//! `ratelimit.storage_engine` picks a [`registry::StorageFactory`] from the
//! [`registry::BackendRegistry`]: `memory` (in-process LRU, the default) or
//! `redis` (shared between instances). Applications can register their own.
//!
//! ## Failure handling
//!
//! Requests are never admitted by accident. A config that cannot be loaded,
//! a backend that cannot be reached or a malformed scope header all end in
//! the [`handlers::ErrorHandler`], `503 Service Unavailable` by default.
//! Failed loads are retried with exponential backoff.

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod handlers;
pub mod inflight;
pub mod loader;
pub mod metrics;
pub mod middleware;
pub mod registry;
pub mod scope;
pub mod scoped_config;
pub mod source;
pub mod store;
pub mod transport;
pub mod vary_by;

pub use error::{Error, ErrorKind, Result};
