//! Create-or-update of a single object against a resolved endpoint.

use cairn_core::{CairnError, CairnResult, ResourceEndpoint};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{BackendError, DecodedObject, ResourceBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Created,
    Updated,
}

#[derive(Clone, Copy)]
enum State {
    Creating,
    /// Entered only when Create reported `AlreadyExists`.
    Updating,
}

/// Resolve the namespace the object is addressed in.
///
/// Cluster-scoped endpoints ignore both the object's namespace and the fallback.
fn effective_namespace(endpoint: &ResourceEndpoint, obj: &DecodedObject, fallback: &str) -> CairnResult<Option<String>> {
    if !endpoint.namespaced {
        return Ok(None);
    }
    let ns = if obj.namespace.is_empty() { fallback } else { obj.namespace.as_str() };
    if ns.is_empty() {
        return Err(CairnError::Apply(format!("{}: namespace required for namespaced kind", obj.target())));
    }
    Ok(Some(ns.to_string()))
}

/// Create `obj`, or update it in place when an object with the same identity exists.
///
/// No retries: a lost update race surfaces as `ConflictRetryNeeded` and any other
/// backend failure as `Apply`.
pub async fn apply(
    backend: &dyn ResourceBackend,
    endpoint: &ResourceEndpoint,
    mut obj: DecodedObject,
    fallback_namespace: &str,
) -> CairnResult<ApplyOutcome> {
    let t0 = std::time::Instant::now();
    let ns = effective_namespace(endpoint, &obj, fallback_namespace)?;
    if let Some(ns) = ns.as_deref() {
        obj.set_namespace(ns);
    }
    if obj.name.is_empty() && obj.generate_name().is_none() {
        counter!("apply_err_total", 1u64);
        return Err(CairnError::Apply(format!("{}: missing metadata.name", obj.target())));
    }
    let target = obj.target();
    // A create must not carry a stale concurrency token.
    obj.set_resource_version("");

    let mut state = State::Creating;
    loop {
        match state {
            State::Creating => match backend.create(endpoint, ns.as_deref(), &obj).await {
                Ok(_) => {
                    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    counter!("apply_created_total", 1u64);
                    info!(kind = %obj.gvk.kind, name = %obj.name, ns = ?ns, action = "created", "applied");
                    return Ok(ApplyOutcome::Created);
                }
                Err(BackendError::AlreadyExists(_)) => {
                    debug!(obj = %target, "already exists; switching to update");
                    state = State::Updating;
                }
                Err(e) => {
                    counter!("apply_err_total", 1u64);
                    return Err(CairnError::Apply(format!("create {}: {}", target, e)));
                }
            },
            State::Updating => {
                if obj.name.is_empty() {
                    counter!("apply_err_total", 1u64);
                    return Err(CairnError::Apply(format!("update {}: object has no name to update", target)));
                }
                let live = backend.get(endpoint, ns.as_deref(), &obj.name).await.map_err(|e| {
                    counter!("apply_err_total", 1u64);
                    CairnError::Apply(format!("get existing {}: {}", target, e))
                })?;
                let rv = live.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or_default();
                obj.set_resource_version(rv);
                return match backend.update(endpoint, ns.as_deref(), &obj).await {
                    Ok(_) => {
                        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                        counter!("apply_updated_total", 1u64);
                        info!(kind = %obj.gvk.kind, name = %obj.name, ns = ?ns, action = "updated", "applied");
                        Ok(ApplyOutcome::Updated)
                    }
                    Err(BackendError::Conflict(msg)) => {
                        counter!("apply_err_total", 1u64);
                        Err(CairnError::ConflictRetryNeeded(format!("update {}: {}", target, msg)))
                    }
                    Err(e) => {
                        counter!("apply_err_total", 1u64);
                        Err(CairnError::Apply(format!("update {}: {}", target, e)))
                    }
                };
            }
        }
    }
}
