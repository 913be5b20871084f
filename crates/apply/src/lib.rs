//! Cairn apply: replays archived manifests against a live cluster.
//!
//! Each document is decoded without a schema, its kind resolved through discovery
//! (cached per session), then created, or updated when it already exists.

#![forbid(unsafe_code)]

mod backend;
mod executor;
mod object;
mod resolver;
mod session;

pub use backend::{BackendError, DiscoverySource, ResourceBackend};
pub use executor::{apply, ApplyOutcome};
pub use object::{decode_document, decode_value, split_documents, DecodedObject};
pub use resolver::Resolver;
pub use session::{restore_archive, ApplySession, ReplayReport, RetryPolicy};
