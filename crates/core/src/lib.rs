//! Cairn core types: archive payloads, resolved resource endpoints and the shared error kinds.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// One named byte blob inside an archive.
///
/// `name` is a relative, slash-separated path such as `team-a/configmap-foo.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPayload {
    pub name: String,
    pub data: Vec<u8>,
}

impl NamedPayload {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), data: data.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    /// Split an `apiVersion` ("apps/v1" or "v1") into group and version; an empty group is the core group.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    /// Plural REST resource name, e.g. `deployments`.
    pub resource: String,
}

/// Addressable backend location for a kind, as answered by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEndpoint {
    pub namespaced: bool,
    pub gvr: GroupVersionResource,
    pub kind: String,
}

impl ResourceEndpoint {
    pub fn api_version(&self) -> String {
        if self.gvr.group.is_empty() { self.gvr.version.clone() } else { format!("{}/{}", self.gvr.group, self.gvr.version) }
    }
}

/// Error kinds shared by the archive codec and the apply engine.
#[derive(Debug, thiserror::Error)]
pub enum CairnError {
    /// Unsafe or malformed payload name.
    #[error("validation: {0}")]
    Validation(String),
    /// Corrupt, truncated or unparseable container or document.
    #[error("format: {0}")]
    Format(String),
    #[error("io: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    /// Discovery has no resource for the requested kind.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Discovery itself failed (unreachable, stale, malformed answer).
    #[error("discovery: {0}")]
    Discovery(String),
    /// Update lost an optimistic-concurrency race; the caller decides whether to retry.
    #[error("conflict: {0}")]
    ConflictRetryNeeded(String),
    /// Backend rejected a create, get or update.
    #[error("apply: {0}")]
    Apply(String),
}

impl CairnError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConflictRetryNeeded(_))
    }
}

pub type CairnResult<T> = Result<T, CairnError>;

pub mod prelude {
    pub use super::{CairnError, CairnResult, GroupVersionKind, GroupVersionResource, NamedPayload, ResourceEndpoint};
}
