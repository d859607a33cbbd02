//! Open-time configuration for a [`crate::datastore::Datastore`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::blob::{null_registry, BlobRegistry};
use crate::replica::ReplicaHandle;

/// Ordering of replica notifications relative to the local fsync on
/// session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaOrdering {
    /// Send end/flush messages before the local fsync completes.
    AsyncClose,
    /// Send after the local fsync completes.
    SyncClose,
}

#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    pub directory: PathBuf,
    pub compaction_poll_interval: Duration,
    pub epoch_file_rewrite_threshold: u64,
    pub replica_ordering: ReplicaOrdering,
    pub blob_registry: Arc<dyn BlobRegistry>,
    /// Replica control channel, if the embedder has one. Constructing
    /// the sink from `LIMESTONE_REPLICA_ENDPOINT` (or any other
    /// transport) is the embedder's job; this crate only forwards
    /// events to whatever sink is handed in here.
    pub replica: Option<Arc<ReplicaHandle>>,
}

impl std::fmt::Debug for dyn BlobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<blob registry>")
    }
}

impl DatastoreConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        DatastoreConfig {
            directory: directory.into(),
            compaction_poll_interval: Duration::from_secs(1),
            epoch_file_rewrite_threshold: 100,
            replica_ordering: ReplicaOrdering::SyncClose,
            blob_registry: null_registry(),
            replica: None,
        }
    }

    /// Small rotation thresholds and a fast compaction poll for tests.
    pub fn for_testing(directory: impl Into<PathBuf>) -> Self {
        DatastoreConfig {
            directory: directory.into(),
            compaction_poll_interval: Duration::from_millis(20),
            epoch_file_rewrite_threshold: 4,
            replica_ordering: ReplicaOrdering::SyncClose,
            blob_registry: null_registry(),
            replica: None,
        }
    }

    pub fn with_compaction_poll_interval(mut self, interval: Duration) -> Self {
        self.compaction_poll_interval = interval;
        self
    }

    pub fn with_epoch_file_rewrite_threshold(mut self, threshold: u64) -> Self {
        self.epoch_file_rewrite_threshold = threshold;
        self
    }

    pub fn with_replica_ordering(mut self, ordering: ReplicaOrdering) -> Self {
        self.replica_ordering = ordering;
        self
    }

    pub fn with_blob_registry(mut self, registry: Arc<dyn BlobRegistry>) -> Self {
        self.blob_registry = registry;
        self
    }

    pub fn with_replica(mut self, replica: Arc<ReplicaHandle>) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epoch_file_rewrite_threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("epoch_file_rewrite_threshold must be nonzero")]
    InvalidThreshold,
}
