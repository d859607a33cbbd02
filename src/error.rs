//! Per-component error enums plus the crate-level aggregate.
//!
//! Each component gets its own `thiserror` enum so call sites can match
//! narrowly; [`LimestoneError`] is the aggregate returned from the
//! public `open`/`ready` surface.

use std::path::PathBuf;

use crate::parser::ParseErrorCode;

/// Errors from [`crate::parser`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("parse of {path:?} ended with unrepairable status {code:?}")]
    Unrepairable { path: PathBuf, code: ParseErrorCode },
    #[error("io error scanning {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from [`crate::manifest`].
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("log directory is locked by another process: {path:?}")]
    Locked { path: PathBuf },
    #[error("manifest at {path:?} could not be parsed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported persistent format version {found}, supported versions are {supported:?}")]
    UnsupportedVersion { found: u64, supported: Vec<u64> },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`crate::catalog`].
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog at {path:?} could not be parsed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`crate::channel`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("session already open on this channel")]
    SessionAlreadyOpen,
    #[error("no session open on this channel")]
    NoSessionOpen,
    #[error("cannot rotate a channel with an open session")]
    RotateDuringSession,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the datastore core.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("datastore is not ready")]
    NotReady,
    #[error("datastore channels must be created before calling ready()")]
    AlreadyReady,
    #[error("datastore has been shut down")]
    ShuttingDown,
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the online/offline compaction core.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompactionError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CompactionError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
    }
}

/// Crate-level aggregate returned from [`crate::Datastore::open`] and
/// friends.
#[derive(Debug, thiserror::Error)]
pub enum LimestoneError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
