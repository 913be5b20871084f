#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use cairn_apply::{BackendError, DecodedObject, DiscoverySource, ResourceBackend};
use cairn_core::{CairnError, CairnResult, GroupVersionKind, GroupVersionResource, ResourceEndpoint};
use serde_json::Value as Json;

pub fn endpoint(group: &str, version: &str, kind: &str, resource: &str, namespaced: bool) -> ResourceEndpoint {
    ResourceEndpoint {
        namespaced,
        gvr: GroupVersionResource { group: group.into(), version: version.into(), resource: resource.into() },
        kind: kind.into(),
    }
}

/// Discovery answering from a fixed table and counting every query.
pub struct FakeDiscovery {
    kinds: Vec<ResourceEndpoint>,
    queries: AtomicUsize,
}

impl FakeDiscovery {
    pub fn standard() -> Self {
        Self {
            kinds: vec![
                endpoint("", "v1", "ConfigMap", "configmaps", true),
                endpoint("", "v1", "Secret", "secrets", true),
                endpoint("", "v1", "Namespace", "namespaces", false),
                endpoint("apps", "v1", "Deployment", "deployments", true),
                endpoint("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
            ],
            queries: AtomicUsize::new(0),
        }
    }

    pub fn queries(&self) -> usize { self.queries.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl DiscoverySource for FakeDiscovery {
    async fn lookup(&self, gvk: &GroupVersionKind) -> CairnResult<ResourceEndpoint> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.kinds
            .iter()
            .find(|ep| ep.gvr.group == gvk.group && ep.gvr.version == gvk.version && ep.kind == gvk.kind)
            .cloned()
            .ok_or_else(|| CairnError::NotFound(format!("{} is not served", gvk)))
    }
}

type Key = (String, Option<String>, String);

/// In-memory cluster with apiserver-like identity and resourceVersion rules.
#[derive(Default)]
pub struct FakeBackend {
    objects: Mutex<BTreeMap<Key, Json>>,
    next_rv: AtomicU64,
    pub create_calls: AtomicUsize,
    pub created: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    /// Number of upcoming updates to reject with a conflict.
    pub inject_conflicts: AtomicUsize,
    /// Names whose create fails with a generic error.
    pub reject_names: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn key(ep: &ResourceEndpoint, ns: Option<&str>, name: &str) -> Key {
        (ep.gvr.resource.clone(), ns.map(|s| s.to_string()), name.to_string())
    }

    fn bump_rv(&self, raw: &mut Json) -> String {
        let rv = (self.next_rv.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        raw["metadata"]["resourceVersion"] = Json::String(rv.clone());
        rv
    }

    pub fn object(&self, resource: &str, ns: Option<&str>, name: &str) -> Option<Json> {
        let key = (resource.to_string(), ns.map(|s| s.to_string()), name.to_string());
        self.objects.lock().unwrap().get(&key).cloned()
    }

    pub fn len(&self) -> usize { self.objects.lock().unwrap().len() }

    pub fn creates(&self) -> usize { self.create_calls.load(Ordering::SeqCst) }
    pub fn successful_creates(&self) -> usize { self.created.load(Ordering::SeqCst) }
    pub fn updates(&self) -> usize { self.update_calls.load(Ordering::SeqCst) }
    pub fn gets(&self) -> usize { self.get_calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl ResourceBackend for FakeBackend {
    async fn create(&self, ep: &ResourceEndpoint, ns: Option<&str>, obj: &DecodedObject) -> Result<Json, BackendError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_names.lock().unwrap().iter().any(|n| n == &obj.name) {
            return Err(BackendError::Other(anyhow::anyhow!("admission webhook denied {}", obj.name)));
        }
        if obj.raw().pointer("/metadata/resourceVersion").is_some() {
            return Err(BackendError::Other(anyhow::anyhow!("resourceVersion should not be set on objects to be created")));
        }
        let key = Self::key(ep, ns, &obj.name);
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(BackendError::AlreadyExists(format!("{} {:?} already exists", ep.gvr.resource, obj.name)));
        }
        let mut raw = obj.raw().clone();
        self.bump_rv(&mut raw);
        objects.insert(key, raw.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    async fn get(&self, ep: &ResourceEndpoint, ns: Option<&str>, name: &str) -> Result<Json, BackendError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(&Self::key(ep, ns, name))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("{} {:?} not found", ep.gvr.resource, name)))
    }

    async fn update(&self, ep: &ResourceEndpoint, ns: Option<&str>, obj: &DecodedObject) -> Result<Json, BackendError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.inject_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.inject_conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(BackendError::Conflict("the object has been modified".into()));
        }
        let key = Self::key(ep, ns, &obj.name);
        let mut objects = self.objects.lock().unwrap();
        let live = objects.get(&key).ok_or_else(|| BackendError::NotFound(obj.name.clone()))?;
        let live_rv = live.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or_default();
        if live_rv != obj.resource_version {
            return Err(BackendError::Conflict(format!("stale resourceVersion {:?} (live {:?})", obj.resource_version, live_rv)));
        }
        let mut raw = obj.raw().clone();
        self.bump_rv(&mut raw);
        objects.insert(key, raw.clone());
        Ok(raw)
    }
}

/// Live object without the backend-assigned resourceVersion.
pub fn without_rv(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.shift_remove("resourceVersion");
    }
    v
}
