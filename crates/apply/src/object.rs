//! Schema-less manifest documents: identity fields extracted, everything else kept opaque.

use cairn_core::{CairnError, CairnResult, GroupVersionKind};
use serde::Deserialize;
use serde_json::Value as Json;

fn max_doc_bytes() -> usize {
    std::env::var("CAIRN_MAX_DOC_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4 << 20) // above the apiserver request-body limit
}

fn max_doc_nodes() -> usize {
    std::env::var("CAIRN_MAX_DOC_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// One decoded manifest.
///
/// `namespace`, `name` and `resource_version` are empty when the document omits them.
/// The setters keep the raw tree in sync, so re-serializing reflects them.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedObject {
    pub gvk: GroupVersionKind,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    raw: Json,
}

impl DecodedObject {
    pub fn raw(&self) -> &Json { &self.raw }

    pub fn generate_name(&self) -> Option<&str> {
        self.raw.pointer("/metadata/generateName").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    /// `Kind/name` for log lines and error messages.
    pub fn target(&self) -> String {
        let name = if self.name.is_empty() { self.generate_name().unwrap_or("<unnamed>") } else { &self.name };
        format!("{}/{}", self.gvk.kind, name)
    }

    pub fn set_namespace(&mut self, ns: &str) {
        self.namespace = ns.to_string();
        self.set_meta("namespace", ns);
    }

    /// An empty `rv` removes `metadata.resourceVersion` entirely.
    pub fn set_resource_version(&mut self, rv: &str) {
        self.resource_version = rv.to_string();
        self.set_meta("resourceVersion", rv);
    }

    fn set_meta(&mut self, key: &str, value: &str) {
        let Some(root) = self.raw.as_object_mut() else { return };
        let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        let Some(meta) = meta.as_object_mut() else { return };
        if value.is_empty() {
            meta.shift_remove(key);
        } else {
            meta.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}

fn str_field<'a>(v: &'a Json, key: &str) -> CairnResult<Option<&'a str>> {
    match v.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(CairnError::Format(format!("{} must be a string, got {}", key, other))),
    }
}

fn check_size(len: usize) -> CairnResult<()> {
    let max_bytes = max_doc_bytes();
    if len > max_bytes {
        return Err(CairnError::Format(format!("document too large (>{} bytes)", max_bytes)));
    }
    Ok(())
}

/// Decode a single YAML (or JSON) document.
///
/// `kind` and `apiVersion` are mandatory; a missing `metadata.name` passes through
/// and is reported at apply time instead.
pub fn decode_document(doc: &[u8]) -> CairnResult<DecodedObject> {
    check_size(doc.len())?;
    let text = std::str::from_utf8(doc).map_err(|e| CairnError::Format(format!("document is not UTF-8: {}", e)))?;
    let raw: Json = serde_yaml::from_str(text).map_err(|e| CairnError::Format(format!("parsing YAML: {}", e)))?;
    decode_value(raw)
}

/// Build a `DecodedObject` from an already parsed document tree.
pub fn decode_value(raw: Json) -> CairnResult<DecodedObject> {
    let max_nodes = max_doc_nodes();
    if node_budget_exceeded(&raw, max_nodes) {
        return Err(CairnError::Format(format!("document too complex (>{} nodes)", max_nodes)));
    }
    if !raw.is_object() {
        return Err(CairnError::Format("document is not a mapping".to_string()));
    }

    let api_version = str_field(&raw, "apiVersion")?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CairnError::Format("document missing apiVersion".to_string()))?;
    let kind = str_field(&raw, "kind")?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CairnError::Format("document missing kind".to_string()))?;
    let gvk = GroupVersionKind::from_api_version(api_version, kind);

    let (namespace, name, resource_version) = match raw.get("metadata") {
        None | Some(Json::Null) => (String::new(), String::new(), String::new()),
        Some(meta @ Json::Object(_)) => (
            str_field(meta, "namespace")?.unwrap_or_default().to_string(),
            str_field(meta, "name")?.unwrap_or_default().to_string(),
            str_field(meta, "resourceVersion")?.unwrap_or_default().to_string(),
        ),
        Some(_) => return Err(CairnError::Format(format!("{}: metadata is not a mapping", gvk))),
    };

    Ok(DecodedObject { gvk, namespace, name, resource_version, raw })
}

/// Parse every document of a YAML stream, in order. Empty (null) documents are dropped.
pub fn split_documents(data: &[u8]) -> CairnResult<Vec<Json>> {
    check_size(data.len())?;
    let mut docs = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_slice(data).enumerate() {
        let value = Json::deserialize(doc).map_err(|e| CairnError::Format(format!("document #{}: parsing YAML: {}", idx, e)))?;
        if value.is_null() {
            continue;
        }
        docs.push(value);
    }
    Ok(docs)
}
