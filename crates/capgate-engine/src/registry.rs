//! Process-wide memo tables for decoration artefacts.
//!
//! Four caches, all pure memoizations:
//! - method specs, keyed by callable identity
//! - wrapped types, keyed by (class, ordered policy fingerprints)
//! - view types, keyed by (class, policy fingerprint)
//! - merged view types, keyed by the exact ordered list of input view types
//!
//! Lookups fetch first and compile outside any map guard; concurrent misses
//! may both compile, and the first insert wins.

use std::any::Any;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use capgate_core::error::Result;
use capgate_core::SignatureCache;

use crate::obs::metrics;
use crate::view::ViewType;

pub(crate) type AnyWrapped = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct WrappedKey {
    /// Address of the class definition; cached wrapped types keep it alive.
    pub(crate) class: usize,
    pub(crate) layers: Vec<String>,
}

/// Entry counts per cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub signatures: usize,
    pub wrapped: usize,
    pub views: usize,
    pub merged: usize,
}

#[derive(Default)]
pub struct Registry {
    signatures: SignatureCache,
    wrapped: DashMap<WrappedKey, AnyWrapped>,
    views: DashMap<String, Arc<ViewType>>,
    merged: DashMap<Vec<String>, Arc<ViewType>>,
}

impl Registry {
    /// An isolated registry (tests, embedding).
    pub fn new() -> Self {
        Self::default()
    }

    /// The lazily initialised process-wide registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    pub fn signatures(&self) -> &SignatureCache {
        &self.signatures
    }

    pub(crate) fn wrapped<F>(&self, key: WrappedKey, make: F) -> Result<AnyWrapped>
    where
        F: FnOnce() -> Result<AnyWrapped>,
    {
        if let Some(hit) = lookup(&self.wrapped, "wrapped", &key) {
            return Ok(hit);
        }
        Ok(insert(&self.wrapped, key, make()?))
    }

    pub(crate) fn view_type<F>(&self, id: String, make: F) -> Arc<ViewType>
    where
        F: FnOnce(String) -> ViewType,
    {
        if let Some(hit) = lookup(&self.views, "view", &id) {
            return hit;
        }
        insert(&self.views, id.clone(), Arc::new(make(id)))
    }

    /// Merged view type for `parts`, cached by their exact order.
    pub(crate) fn merged_view(&self, parts: &[Arc<ViewType>]) -> Arc<ViewType> {
        let key: Vec<String> = parts.iter().map(|p| p.id().to_string()).collect();
        if let Some(hit) = lookup(&self.merged, "merged_view", &key) {
            return hit;
        }
        insert(&self.merged, key, Arc::new(ViewType::merge(parts)))
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            signatures: self.signatures.len(),
            wrapped: self.wrapped.len(),
            views: self.views.len(),
            merged: self.merged.len(),
        }
    }

    /// Drop every cached artefact. Existing wrapped types and instances keep
    /// working; later decorations compile afresh.
    pub fn clear(&self) {
        self.signatures.clear();
        self.wrapped.clear();
        self.views.clear();
        self.merged.clear();
        tracing::debug!("registry cleared");
    }
}

fn lookup<K: Eq + Hash, V: Clone>(map: &DashMap<K, V>, cache: &'static str, key: &K) -> Option<V> {
    let hit = map.get(key).map(|r| r.value().clone());
    metrics().record_lookup(cache, hit.is_some());
    if hit.is_some() {
        tracing::trace!(cache, "registry hit");
    }
    hit
}

fn insert<K: Eq + Hash, V: Clone>(map: &DashMap<K, V>, key: K, value: V) -> V {
    map.entry(key).or_insert(value).value().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_wins() {
        let map: DashMap<&str, u32> = DashMap::new();
        assert_eq!(insert(&map, "k", 1), 1);
        assert_eq!(insert(&map, "k", 2), 1);
        assert_eq!(lookup(&map, "test", &"k"), Some(1));
        assert_eq!(lookup(&map, "test", &"missing"), None);
    }

    #[test]
    fn clear_resets_every_cache() {
        let reg = Registry::new();
        reg.signatures()
            .resolve(&capgate_core::CallableId::new("Box", "set"), "value", true)
            .unwrap();
        let key = WrappedKey { class: 1, layers: vec!["freezable()".into()] };
        reg.wrapped(key.clone(), || Ok(Arc::new(7u8) as AnyWrapped)).unwrap();
        // Cached: the second factory is never run.
        reg.wrapped(key, || panic!("recompiled")).unwrap();
        assert_eq!(reg.stats().signatures, 1);
        assert_eq!(reg.stats().wrapped, 1);

        reg.clear();
        assert_eq!(reg.stats(), RegistryStats::default());
    }
}
