//! Configuration cache collaborator.
//!
//! Readers cache configuration per domain (a table name or
//! `system_preferences`). A successful import invalidates the domains it
//! touched, strictly after commit. A reader can still load stale data
//! between the commit and the invalidation; [`DomainCache::clear`] is the
//! manual way out.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::info;

/// Receives "configuration changed" notifications. Fire-and-forget.
pub trait CacheSignal: Send + Sync {
    fn invalidate(&self, domain: &str);
}

impl<T: CacheSignal + ?Sized> CacheSignal for Arc<T> {
    fn invalidate(&self, domain: &str) {
        (**self).invalidate(domain)
    }
}

/// Signal used by the CLI, where no in-process cache exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCacheSignal;

impl CacheSignal for LogCacheSignal {
    fn invalidate(&self, domain: &str) {
        info!(target: "cfg_migrate", event = "cache_invalidate", domain = %domain);
    }
}

#[derive(Debug, Default, Clone)]
pub struct DomainCache {
    entries: Arc<RwLock<HashMap<String, HashMap<String, Value>>>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str, key: &str) -> Option<Value> {
        let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
        guard.get(domain).and_then(|entries| entries.get(key)).cloned()
    }

    pub fn insert(&self, domain: &str, key: impl Into<String>, value: Value) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(domain.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn len(&self, domain: &str) -> usize {
        let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
        guard.get(domain).map_or(0, HashMap::len)
    }

    /// Drops every domain.
    pub fn clear(&self) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        guard.clear();
        info!(target: "cfg_migrate", event = "cache_clear");
    }
}

impl CacheSignal for DomainCache {
    fn invalidate(&self, domain: &str) {
        let removed = {
            let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
            guard.remove(domain).map_or(0, |entries| entries.len())
        };
        info!(
            target: "cfg_migrate",
            event = "cache_invalidate",
            domain = %domain,
            removed
        );
    }
}
