//! BLOB registry contract.
//!
//! The BLOB file store's byte layout lives outside this crate; the only
//! thing the datastore needs is an idempotent way to hear about blob
//! ids referenced by a write. Modeled as a trait rather than a concrete
//! type so an embedding database engine supplies its own registry.

use std::sync::Arc;

use crate::model::BlobId;

pub trait BlobRegistry: Send + Sync {
    /// Register blob ids as referenced. Must be idempotent: calling it
    /// twice with the same ids has the same effect as calling it once.
    fn register(&self, blob_ids: &[BlobId]);
}

/// No-op registry used when the embedder has no BLOB store.
#[derive(Debug, Default)]
pub struct NullBlobRegistry;

impl BlobRegistry for NullBlobRegistry {
    fn register(&self, _blob_ids: &[BlobId]) {}
}

pub fn null_registry() -> Arc<dyn BlobRegistry> {
    Arc::new(NullBlobRegistry)
}
