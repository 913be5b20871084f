//! Cairn kubehub: kube-rs client setup, discovery and the dynamic apply backend.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cairn_apply::{BackendError, DecodedObject, DiscoverySource, ResourceBackend};
use cairn_core::{CairnError, CairnResult, GroupVersionKind, GroupVersionResource, ResourceEndpoint};
use kube::{
    api::{Api, DynamicObject, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::ApiResource,
    discovery::{Discovery, Scope},
    Client, Config,
};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, info};

mod capture;

pub use capture::{archive_name, backup_namespace, export_namespace, is_system_object, list_resources, CapturedObject, ResourceInfo};

/// Build a client from an explicit kubeconfig file, or from the default loading rules
/// (`KUBECONFIG`, `~/.kube/config`, in-cluster) when `kubeconfig` is `None`.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("load kubeconfig {}", path.display()))?
        }
        None => Config::infer().await.context("infer kube config")?,
    };
    info!(cluster = %config.cluster_url, ns = %config.default_namespace, "kube client configured");
    Client::try_from(config).context("build kube client")
}

/// Discovery against the live apiserver, one group per query.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl DiscoverySource for KubeDiscovery {
    async fn lookup(&self, gvk: &GroupVersionKind) -> CairnResult<ResourceEndpoint> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[gvk.group.as_str()])
            .run()
            .await
            .map_err(|e| CairnError::Discovery(format!("{}: {}", gvk, e)))?;
        let kgvk = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let (ar, caps) = discovery
            .resolve_gvk(&kgvk)
            .ok_or_else(|| CairnError::NotFound(format!("{} is not served by the cluster", gvk)))?;
        debug!(gvk = %gvk, plural = %ar.plural, "discovered");
        Ok(ResourceEndpoint {
            namespaced: matches!(caps.scope, Scope::Namespaced),
            gvr: GroupVersionResource { group: ar.group, version: ar.version, resource: ar.plural },
            kind: ar.kind,
        })
    }
}

/// Create/get/update through `Api<DynamicObject>` for any resolved endpoint.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, ep: &ResourceEndpoint, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: ep.gvr.group.clone(),
            version: ep.gvr.version.clone(),
            api_version: ep.api_version(),
            kind: ep.kind.clone(),
            plural: ep.gvr.resource.clone(),
        };
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn to_dynamic(obj: &DecodedObject) -> Result<DynamicObject, BackendError> {
    serde_json::from_value(obj.raw().clone())
        .with_context(|| format!("convert {} to a dynamic object", obj.target()))
        .map_err(BackendError::Other)
}

fn to_json(obj: DynamicObject) -> Result<Json, BackendError> {
    serde_json::to_value(obj).context("serialize server response").map_err(BackendError::Other)
}

fn backend_err(e: kube::Error) -> BackendError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => BackendError::AlreadyExists(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => BackendError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => BackendError::NotFound(ae.message),
        other => {
            counter!("kube_request_err_total", 1u64);
            BackendError::Other(other.into())
        }
    }
}

#[async_trait]
impl ResourceBackend for KubeBackend {
    async fn create(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DecodedObject) -> Result<Json, BackendError> {
        let dynobj = to_dynamic(obj)?;
        let created = self.api(ep, namespace).create(&PostParams::default(), &dynobj).await.map_err(backend_err)?;
        to_json(created)
    }

    async fn get(&self, ep: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<Json, BackendError> {
        let live = self.api(ep, namespace).get(name).await.map_err(backend_err)?;
        to_json(live)
    }

    async fn update(&self, ep: &ResourceEndpoint, namespace: Option<&str>, obj: &DecodedObject) -> Result<Json, BackendError> {
        let dynobj = to_dynamic(obj)?;
        let replaced = self
            .api(ep, namespace)
            .replace(&obj.name, &PostParams::default(), &dynobj)
            .await
            .map_err(backend_err)?;
        to_json(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{} happened", reason), reason: reason.into(), code })
    }

    #[test]
    fn status_codes_map_to_backend_conditions() {
        assert!(matches!(backend_err(api_err(409, "AlreadyExists")), BackendError::AlreadyExists(_)));
        assert!(matches!(backend_err(api_err(409, "Conflict")), BackendError::Conflict(_)));
        assert!(matches!(backend_err(api_err(404, "NotFound")), BackendError::NotFound(_)));
        assert!(matches!(backend_err(api_err(403, "Forbidden")), BackendError::Other(_)));
    }

    #[test]
    fn decoded_objects_convert_to_dynamic() {
        let obj = cairn_apply::decode_document(b"apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: x\nspec:\n  replicas: 2\n").unwrap();
        let dynobj = to_dynamic(&obj).unwrap();
        assert_eq!(dynobj.metadata.name.as_deref(), Some("web"));
        assert_eq!(dynobj.types.as_ref().map(|t| t.kind.as_str()), Some("Deployment"));
        assert_eq!(dynobj.data["spec"]["replicas"], 2);
    }
}
