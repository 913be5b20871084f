//! Namespace capture: enumerate the supported kinds, drop system objects and render YAML manifests.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use cairn_core::NamedPayload;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams};
use kube::{Client, Resource, ResourceExt};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub api_version: String,
}

/// One exported object together with its rendered manifest.
#[derive(Debug, Clone)]
pub struct CapturedObject {
    pub info: ResourceInfo,
    /// `<prefix>-<name>.yaml`
    pub file_name: String,
    pub yaml: String,
}

/// Objects the cluster creates on its own and that must never be captured.
pub fn is_system_object(kind: &str, namespace: &str, name: &str) -> bool {
    if name == "kube-root-ca.crt" || name.starts_with("kube-root-ca.") {
        return true;
    }
    if kind == "Service" && namespace == "default" && name == "kubernetes" {
        return true;
    }
    SYSTEM_NAMESPACES.contains(&namespace)
}

fn file_prefix(kind: &str) -> String {
    match kind {
        "PersistentVolumeClaim" => "pvc".to_string(),
        k => k.to_lowercase(),
    }
}

/// `backup-<ns>-<YYYYmmdd-HHMMSS>.tar.gz`
pub fn archive_name(namespace: &str, at: DateTime<Utc>) -> String {
    format!("backup-{}-{}.tar.gz", namespace, at.format("%Y%m%d-%H%M%S"))
}

/// Render one object, or `None` when it is a system object.
fn capture_object<K>(mut obj: K) -> Result<Option<CapturedObject>>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let kind = K::kind(&()).to_string();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    if is_system_object(&kind, &namespace, &name) {
        debug!(kind = %kind, name = %name, "skipping system object");
        return Ok(None);
    }
    obj.meta_mut().managed_fields = None;
    let yaml = serde_yaml::to_string(&obj).with_context(|| format!("render {}/{}", kind, name))?;
    Ok(Some(CapturedObject {
        file_name: format!("{}-{}.yaml", file_prefix(&kind), name),
        info: ResourceInfo { api_version: K::api_version(&()).to_string(), kind, name, namespace },
        yaml,
    }))
}

async fn collect<K>(client: &Client, namespace: &str, out: &mut Vec<CapturedObject>) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let kind = K::kind(&()).to_string();
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let list = api.list(&ListParams::default()).await.with_context(|| format!("list {} in {}", kind, namespace))?;
    let before = out.len();
    for obj in list.items {
        if let Some(c) = capture_object(obj)? {
            out.push(c);
        }
    }
    debug!(kind = %kind, ns = %namespace, count = out.len() - before, "listed");
    Ok(())
}

/// Every supported object in `namespace`, in kind order, system objects excluded.
pub async fn export_namespace(client: &Client, namespace: &str) -> Result<Vec<CapturedObject>> {
    let mut out = Vec::new();
    collect::<ConfigMap>(client, namespace, &mut out).await?;
    collect::<Secret>(client, namespace, &mut out).await?;
    collect::<Service>(client, namespace, &mut out).await?;
    collect::<Deployment>(client, namespace, &mut out).await?;
    collect::<StatefulSet>(client, namespace, &mut out).await?;
    collect::<DaemonSet>(client, namespace, &mut out).await?;
    collect::<Job>(client, namespace, &mut out).await?;
    collect::<CronJob>(client, namespace, &mut out).await?;
    collect::<PersistentVolumeClaim>(client, namespace, &mut out).await?;
    collect::<Ingress>(client, namespace, &mut out).await?;
    Ok(out)
}

pub async fn list_resources(client: &Client, namespace: &str) -> Result<Vec<ResourceInfo>> {
    Ok(export_namespace(client, namespace).await?.into_iter().map(|c| c.info).collect())
}

fn payloads(namespace: &str, captured: Vec<CapturedObject>) -> Vec<NamedPayload> {
    captured
        .into_iter()
        .map(|c| NamedPayload::new(format!("{}/{}", namespace, c.file_name), c.yaml))
        .collect()
}

/// Capture `namespace` into a fresh archive under `out_dir` and return its path.
pub async fn backup_namespace(client: &Client, namespace: &str, out_dir: &Path) -> Result<PathBuf> {
    let captured = export_namespace(client, namespace).await?;
    if captured.is_empty() {
        return Err(anyhow!("no resources found in namespace {}", namespace));
    }
    let entries = payloads(namespace, captured);
    let path = out_dir.join(archive_name(namespace, Utc::now()));
    cairn_archive::write_archive(&path, &entries).with_context(|| format!("write archive {}", path.display()))?;
    counter!("backup_objects_total", entries.len() as u64);
    info!(ns = %namespace, objects = entries.len(), archive = %path.display(), "backup written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta};
    use k8s_openapi::ByteString;

    fn configmap(ns: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                resource_version: Some("42".into()),
                managed_fields: Some(vec![ManagedFieldsEntry { manager: Some("kubectl".into()), ..Default::default() }]),
                ..Default::default()
            },
            data: Some([("mode".to_string(), "fast".to_string())].into_iter().collect()),
            ..Default::default()
        }
    }

    #[test]
    fn system_objects_are_recognised() {
        assert!(is_system_object("ConfigMap", "team-a", "kube-root-ca.crt"));
        assert!(is_system_object("ConfigMap", "team-a", "kube-root-ca.crt.bak"));
        assert!(is_system_object("Service", "default", "kubernetes"));
        assert!(is_system_object("Deployment", "kube-system", "coredns"));
        assert!(is_system_object("Secret", "kube-node-lease", "x"));
        assert!(!is_system_object("Service", "team-a", "kubernetes"));
        assert!(!is_system_object("ConfigMap", "default", "settings"));
    }

    #[test]
    fn file_names_use_kind_prefix() {
        assert_eq!(file_prefix("ConfigMap"), "configmap");
        assert_eq!(file_prefix("PersistentVolumeClaim"), "pvc");
        assert_eq!(file_prefix("CronJob"), "cronjob");
    }

    #[test]
    fn archive_name_carries_namespace_and_utc_stamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(archive_name("team-a", at), "backup-team-a-20240309-070501.tar.gz");
    }

    #[test]
    fn captured_manifest_is_applyable_yaml() {
        let c = capture_object(configmap("team-a", "settings")).unwrap().unwrap();
        assert_eq!(c.file_name, "configmap-settings.yaml");
        assert_eq!(c.info, ResourceInfo { kind: "ConfigMap".into(), name: "settings".into(), namespace: "team-a".into(), api_version: "v1".into() });
        assert!(!c.yaml.contains("managedFields"));

        let obj = cairn_apply::decode_document(c.yaml.as_bytes()).unwrap();
        assert_eq!(obj.gvk.kind, "ConfigMap");
        assert_eq!(obj.namespace, "team-a");
        assert_eq!(obj.name, "settings");
    }

    #[test]
    fn captured_secret_near_the_data_limit_decodes() {
        let secret = Secret {
            metadata: ObjectMeta { name: Some("big".into()), namespace: Some("team-a".into()), ..Default::default() },
            data: Some([("payload".to_string(), ByteString(vec![7u8; 900 * 1024]))].into_iter().collect()),
            ..Default::default()
        };
        let c = capture_object(secret).unwrap().unwrap();
        assert_eq!(c.file_name, "secret-big.yaml");
        assert!(c.yaml.len() > 1 << 20);
        let obj = cairn_apply::decode_document(c.yaml.as_bytes()).unwrap();
        assert_eq!(obj.gvk.kind, "Secret");
        assert_eq!(obj.name, "big");
    }

    #[test]
    fn system_objects_are_not_captured() {
        assert!(capture_object(configmap("team-a", "kube-root-ca.crt")).unwrap().is_none());
    }

    #[test]
    fn payload_names_are_namespace_scoped_and_archive_safe() {
        let c = capture_object(configmap("team-a", "settings")).unwrap().unwrap();
        let entries = payloads("team-a", vec![c]);
        assert_eq!(entries[0].name, "team-a/configmap-settings.yaml");
        cairn_archive::validate_name(&entries[0].name).unwrap();
    }
}
