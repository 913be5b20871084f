//! Replay of archive entries: strictly in entry order, one object at a time, stop at the first failure.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use cairn_core::{CairnError, CairnResult, NamedPayload};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{apply, decode_value, split_documents, ApplyOutcome, DecodedObject, DiscoverySource, ResourceBackend, Resolver};

/// Caller-level handling of `ConflictRetryNeeded`; nothing else is ever retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after a conflict; 0 means fail fast.
    pub conflict_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { conflict_retries: 0, backoff: Duration::from_millis(500) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub entries: usize,
    pub created: usize,
    pub updated: usize,
    /// Entries holding no document to apply.
    pub skipped_empty: usize,
}

/// One replay against one cluster. Owns the discovery cache for its lifetime.
pub struct ApplySession<'a> {
    resolver: Resolver<'a>,
    backend: &'a dyn ResourceBackend,
    fallback_namespace: String,
    retry: RetryPolicy,
}

impl<'a> ApplySession<'a> {
    pub fn new(discovery: &'a dyn DiscoverySource, backend: &'a dyn ResourceBackend, fallback_namespace: impl Into<String>) -> Self {
        Self {
            resolver: Resolver::new(discovery),
            backend,
            fallback_namespace: fallback_namespace.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resolver(&self) -> &Resolver<'a> { &self.resolver }

    /// Resolve and apply one decoded object.
    pub async fn apply_object(&mut self, obj: DecodedObject) -> CairnResult<ApplyOutcome> {
        let ep = self.resolver.resolve(&obj.gvk.group, &obj.gvk.kind, &obj.gvk.version).await?;
        let mut attempt = 0u32;
        loop {
            match apply(self.backend, &ep, obj.clone(), &self.fallback_namespace).await {
                Err(e) if e.is_conflict() && attempt < self.retry.conflict_retries => {
                    attempt += 1;
                    warn!(obj = %obj.target(), attempt, error = %e, "update conflict; retrying");
                    tokio::time::sleep(self.retry.backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Apply every document of every entry in order. The first failure aborts the
    /// rest; objects applied before it stay applied.
    pub async fn replay(&mut self, entries: &[NamedPayload]) -> Result<ReplayReport> {
        let mut report = ReplayReport { entries: entries.len(), ..Default::default() };
        for entry in entries {
            // Every document of an entry must decode before any of them is applied.
            let objects = split_documents(&entry.data)
                .and_then(|docs| docs.into_iter().map(decode_value).collect::<CairnResult<Vec<_>>>())
                .with_context(|| format!("apply manifest {}", entry.name))?;
            if objects.is_empty() {
                report.skipped_empty += 1;
                continue;
            }
            for obj in objects {
                let outcome = self
                    .apply_object(obj)
                    .await
                    .with_context(|| format!("apply manifest {}", entry.name))?;
                match outcome {
                    ApplyOutcome::Created => report.created += 1,
                    ApplyOutcome::Updated => report.updated += 1,
                }
            }
        }
        Ok(report)
    }
}

/// Read the archive at `path` and replay it. An archive without entries is an error.
pub async fn restore_archive(
    path: &Path,
    discovery: &dyn DiscoverySource,
    backend: &dyn ResourceBackend,
    fallback_namespace: &str,
    retry: RetryPolicy,
) -> Result<ReplayReport> {
    let entries = cairn_archive::read_archive(path).context("extract archive")?;
    if entries.is_empty() {
        return Err(CairnError::Format(format!("archive {} is empty", path.display())).into());
    }
    info!(archive = %path.display(), entries = entries.len(), fallback_ns = %fallback_namespace, "restore starting");
    let mut session = ApplySession::new(discovery, backend, fallback_namespace).with_retry(retry);
    let report = session.replay(&entries).await?;
    info!(created = report.created, updated = report.updated, skipped = report.skipped_empty, "restore finished");
    Ok(report)
}
