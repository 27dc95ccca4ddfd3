//! Scope-keyed configuration cache with parent fallback
//!
//! Lookups walk Store → Website → Default and return the first valid entry.
//! A hit on an ancestor is remembered under the target as an alias, so the
//! next lookup for the same target is a single map lookup.

use crate::error::{Error, Result};
use crate::scope::{ScopeContext, ScopeId};
use crate::scoped_config::ScopedConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

enum Slot {
    Explicit(Arc<ScopedConfig>),
    Alias {
        resolved_from: ScopeId,
        config: Arc<ScopedConfig>,
    },
}

impl Slot {
    /// The config this slot can serve, if it is usable
    fn usable(&self) -> Option<(ScopeId, &Arc<ScopedConfig>)> {
        match self {
            Slot::Explicit(config) if config.is_valid() => Some((config.scope(), config)),
            Slot::Explicit(_) => None,
            Slot::Alias {
                resolved_from,
                config,
            } => Some((*resolved_from, config)),
        }
    }
}

/// Aliases kept before further ancestor hits stop being memoized
pub const DEFAULT_MAX_ALIASES: usize = 10_000;

#[derive(Default)]
struct Slots {
    map: HashMap<ScopeId, Slot>,
    aliases: usize,
}

impl Slots {
    fn insert(&mut self, scope: ScopeId, slot: Slot) {
        let added = matches!(slot, Slot::Alias { .. });
        if let Some(Slot::Alias { .. }) = self.map.insert(scope, slot) {
            self.aliases -= 1;
        }
        if added {
            self.aliases += 1;
        }
    }
}

pub struct ConfigCache {
    slots: RwLock<Slots>,
    max_aliases: usize,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            max_aliases: DEFAULT_MAX_ALIASES,
        }
    }
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of memoized aliases
    ///
    /// Past the bound, ancestor hits are still served but not remembered.
    pub fn with_max_aliases(mut self, max_aliases: usize) -> Self {
        self.max_aliases = max_aliases;
        self
    }

    /// Resolve the config for `ctx`, falling back through its parents
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no valid entry exists for the target or any
    /// ancestor up to and including Default.
    pub fn get(&self, ctx: &ScopeContext) -> Result<Arc<ScopedConfig>> {
        let target = ctx.scope();
        let found = {
            let slots = self.slots.read();
            if let Some((_, config)) = slots.map.get(&target).and_then(Slot::usable) {
                return Ok(Arc::clone(config));
            }

            ctx.chain().into_iter().skip(1).find_map(|scope| {
                slots
                    .map
                    .get(&scope)
                    .and_then(Slot::usable)
                    .map(|(from, config)| (from, Arc::clone(config)))
            })
        };

        let Some((resolved_from, config)) = found else {
            return Err(Error::NotFound(format!(
                "no valid configuration for {target} or its parents"
            )));
        };

        self.alias(target, resolved_from, Arc::clone(&config));
        Ok(config)
    }

    /// The usable entry stored under `scope` itself, explicit or alias
    pub fn get_cached(&self, scope: ScopeId) -> Option<Arc<ScopedConfig>> {
        self.slots
            .read()
            .map
            .get(&scope)
            .and_then(Slot::usable)
            .map(|(_, config)| Arc::clone(config))
    }

    /// Serve `scope` with `resolved_from`'s config until the next [`set`](Self::set)
    ///
    /// A usable entry already under `scope` is kept.
    pub fn alias(&self, scope: ScopeId, resolved_from: ScopeId, config: Arc<ScopedConfig>) {
        let mut slots = self.slots.write();
        if slots.map.get(&scope).is_some_and(|slot| slot.usable().is_some()) {
            return;
        }
        if slots.aliases >= self.max_aliases {
            tracing::debug!(scope = %scope, max = self.max_aliases, "alias limit reached, not memoizing");
            return;
        }
        tracing::trace!(scope = %scope, from = %resolved_from, "memoizing alias");
        slots.insert(
            scope,
            Slot::Alias {
                resolved_from,
                config,
            },
        );
    }

    /// Install `config` under `scope`, replacing whatever was there
    ///
    /// Aliases are dropped so later lookups re-resolve against the new entry.
    pub fn set(&self, scope: ScopeId, config: Arc<ScopedConfig>) {
        let mut slots = self.slots.write();
        slots.map.retain(|_, slot| matches!(slot, Slot::Explicit(_)));
        slots.aliases = 0;
        slots.insert(scope, Slot::Explicit(config));
    }

    /// The explicit entry for `scope`, valid or not; aliases are ignored
    pub fn get_direct(&self, scope: ScopeId) -> Option<Arc<ScopedConfig>> {
        match self.slots.read().map.get(&scope) {
            Some(Slot::Explicit(config)) => Some(Arc::clone(config)),
            _ => None,
        }
    }

    /// Where the entry for `scope` came from, if it is an alias
    pub fn alias_of(&self, scope: ScopeId) -> Option<ScopeId> {
        match self.slots.read().map.get(&scope) {
            Some(Slot::Alias { resolved_from, .. }) => Some(*resolved_from),
            _ => None,
        }
    }

    pub fn flush(&self) {
        *self.slots.write() = Slots::default();
    }

    pub fn len(&self) -> usize {
        self.slots.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().map.is_empty()
    }
}
