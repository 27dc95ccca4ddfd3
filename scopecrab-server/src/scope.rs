//! Scope hierarchy: Default → Website → Store
//!
//! Every store belongs to exactly one website and every website to the
//! default scope. A [`ScopeContext`] is what a [`ScopeResolver`] extracts from
//! a request; it names the target scope and its fallback chain.

use crate::error::{Error, Result};
use axum::http::request::Parts;
use std::fmt;

pub const WEBSITE_HEADER: &str = "x-website-id";
pub const STORE_HEADER: &str = "x-store-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKind {
    Default,
    Website,
    Store,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeKind::Default => "default",
            ScopeKind::Website => "website",
            ScopeKind::Store => "store",
        })
    }
}

/// A single node of the scope hierarchy
///
/// A store is identified together with the website it was reached through,
/// so the same store id under two websites never shares a cache slot.
/// Displays as `default/0`, `website/2` or `website/2/store/5`, which is also
/// the key used to deduplicate concurrent loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId {
    pub kind: ScopeKind,
    pub id: u32,
    /// Owning website of a store, `0` otherwise
    pub website: u32,
}

impl ScopeId {
    pub const DEFAULT: ScopeId = ScopeId {
        kind: ScopeKind::Default,
        id: 0,
        website: 0,
    };

    pub fn website(id: u32) -> Self {
        ScopeId {
            kind: ScopeKind::Website,
            id,
            website: 0,
        }
    }

    pub fn store(website: u32, id: u32) -> Self {
        ScopeId {
            kind: ScopeKind::Store,
            id,
            website,
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScopeKind::Store => write!(f, "website/{}/store/{}", self.website, self.id),
            _ => write!(f, "{}/{}", self.kind, self.id),
        }
    }
}

/// Website and store a request belongs to; `0` means "not set"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeContext {
    pub website_id: u32,
    pub store_id: u32,
}

impl ScopeContext {
    /// Build a context, rejecting a store without its website
    pub fn new(website_id: u32, store_id: u32) -> Result<Self> {
        if store_id > 0 && website_id == 0 {
            return Err(Error::NotValid(format!(
                "store {store_id} has no parent website"
            )));
        }
        Ok(ScopeContext {
            website_id,
            store_id,
        })
    }

    pub fn website(website_id: u32) -> Self {
        ScopeContext {
            website_id,
            store_id: 0,
        }
    }

    /// The most specific scope named by this context
    pub fn scope(&self) -> ScopeId {
        if self.store_id > 0 {
            ScopeId::store(self.website_id, self.store_id)
        } else if self.website_id > 0 {
            ScopeId::website(self.website_id)
        } else {
            ScopeId::DEFAULT
        }
    }

    /// The target scope followed by its ancestors, ending at Default
    pub fn chain(&self) -> Vec<ScopeId> {
        let mut chain = Vec::with_capacity(3);
        if self.store_id > 0 {
            chain.push(ScopeId::store(self.website_id, self.store_id));
        }
        if self.website_id > 0 {
            chain.push(ScopeId::website(self.website_id));
        }
        chain.push(ScopeId::DEFAULT);
        chain
    }

    /// This context cut back to `scope`, one of its own chain members
    pub fn up_to(&self, scope: ScopeId) -> ScopeContext {
        match scope.kind {
            ScopeKind::Store => *self,
            ScopeKind::Website => ScopeContext::website(self.website_id),
            ScopeKind::Default => ScopeContext::default(),
        }
    }
}

impl fmt::Display for ScopeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.scope(), f)
    }
}

/// Maps an inbound request to the scope it should be throttled under
pub trait ScopeResolver: Send + Sync {
    fn resolve(&self, parts: &Parts) -> Result<ScopeContext>;
}

/// Reads `X-Website-Id` and `X-Store-Id`, falling back to fixed defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderScopeResolver {
    default_website: u32,
    default_store: u32,
}

impl HeaderScopeResolver {
    pub fn new(default_website: u32, default_store: u32) -> Self {
        Self {
            default_website,
            default_store,
        }
    }

    fn header(parts: &Parts, name: &str) -> Result<Option<u32>> {
        let Some(value) = parts.headers.get(name) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| Error::NotValid(format!("{name} is not ASCII")))?
            .trim();
        value
            .parse()
            .map(Some)
            .map_err(|_| Error::NotValid(format!("{name}: {value:?} is not a scope id")))
    }
}

impl ScopeResolver for HeaderScopeResolver {
    fn resolve(&self, parts: &Parts) -> Result<ScopeContext> {
        let website = Self::header(parts, WEBSITE_HEADER)?;
        let store = Self::header(parts, STORE_HEADER)?;

        match (website, store) {
            (Some(website), store) => ScopeContext::new(website, store.unwrap_or(0)),
            (None, Some(store)) => ScopeContext::new(self.default_website, store),
            (None, None) => ScopeContext::new(self.default_website, self.default_store),
        }
    }
}
