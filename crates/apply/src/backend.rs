//! Capability seams to the live cluster. The engine never builds a client itself;
//! callers hand in implementations per session.

use cairn_core::{CairnResult, GroupVersionKind, ResourceEndpoint};
use serde_json::Value as Json;

use crate::DecodedObject;

/// Named backend conditions the executor branches on. Everything else is `Other`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency failure on update (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Answers "which REST resource serves this group/kind/version".
#[async_trait::async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Fails with `NotFound` when the kind is not served and `Discovery` when the query itself fails.
    async fn lookup(&self, gvk: &GroupVersionKind) -> CairnResult<ResourceEndpoint>;
}

/// Create/Get/Update against one resolved endpoint. `namespace` is `None` for cluster-scoped kinds.
#[async_trait::async_trait]
pub trait ResourceBackend: Send + Sync {
    async fn create(&self, endpoint: &ResourceEndpoint, namespace: Option<&str>, obj: &DecodedObject) -> Result<Json, BackendError>;

    async fn get(&self, endpoint: &ResourceEndpoint, namespace: Option<&str>, name: &str) -> Result<Json, BackendError>;

    async fn update(&self, endpoint: &ResourceEndpoint, namespace: Option<&str>, obj: &DecodedObject) -> Result<Json, BackendError>;
}
