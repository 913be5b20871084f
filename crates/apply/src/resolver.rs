//! Session-scoped kind → endpoint resolution.

use cairn_core::{CairnResult, GroupVersionKind, ResourceEndpoint};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::DiscoverySource;

/// Caches discovery answers for one replay. Never shared across sessions, never persisted.
///
/// Only successful lookups are cached; failures go back to the caller untouched and
/// are not retried here.
pub struct Resolver<'a> {
    source: &'a dyn DiscoverySource,
    cache: FxHashMap<GroupVersionKind, ResourceEndpoint>,
}

impl<'a> Resolver<'a> {
    pub fn new(source: &'a dyn DiscoverySource) -> Self {
        Self { source, cache: FxHashMap::default() }
    }

    pub async fn resolve(&mut self, group: &str, kind: &str, version: &str) -> CairnResult<ResourceEndpoint> {
        let key = GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() };
        if let Some(ep) = self.cache.get(&key) {
            counter!("discovery_cache_hits_total", 1u64);
            debug!(gvk = %key, "discovery cache hit");
            return Ok(ep.clone());
        }
        counter!("discovery_queries_total", 1u64);
        let ep = self.source.lookup(&key).await?;
        debug!(gvk = %key, resource = %ep.gvr.resource, namespaced = ep.namespaced, "resolved");
        self.cache.insert(key, ep.clone());
        Ok(ep)
    }

    pub fn cached(&self) -> usize { self.cache.len() }
}
