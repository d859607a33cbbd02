//! Backup manifest construction (`datastore::begin_backup`).
//!
//! The actual transfer of files to a backup destination is a caller
//! responsibility; this module only rotates the active files out of the
//! way and lists what a copier should take.

use std::path::PathBuf;

use crate::catalog::CATALOG_FILE_NAME;
use crate::datastore::epoch::EPOCH_FILE_NAME;
use crate::manifest::MANIFEST_FILE_NAME;

/// Distinguishes a full backup from a transaction-log-only one.
///
/// At the file-selection level both kinds currently select the same
/// set: every file here is already a log file, so there is nothing a
/// "standard" backup would include that a "transaction" backup would
/// not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Standard,
    Transaction,
}

/// One file a backup copier should take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub source: PathBuf,
    pub destination_name: String,
    /// Whether the source may still be mutated after this manifest was
    /// built (the manifest file is rewritten in place on every open).
    pub mutable_source: bool,
}

/// The set of files an external copier should take for one backup.
#[derive(Debug, Clone, Default)]
pub struct BackupManifest {
    pub entries: Vec<BackupEntry>,
    /// The switched epoch observed at manifest-build time.
    pub epoch_id_switched: u64,
}

/// Classify one directory entry's filename the way the original
/// backup builder does, returning `None` for names that should be
/// skipped (the currently-active attached WAL/epoch files).
fn classify(name: &str) -> Option<bool> {
    if let Some(rest) = name.strip_prefix("pwal_") {
        // an attached file has no further '.'-separated suffix; skip it,
        // only detached/compacted files are eligible for backup.
        if !rest.contains('.') {
            return None;
        }
        return Some(false);
    }
    if name == EPOCH_FILE_NAME {
        // the live epoch file is still being appended to; only rotated
        // copies (`epoch.<ts>.<epoch>`) are eligible.
        return None;
    }
    if name.starts_with("epoch.") {
        return Some(false);
    }
    if name == MANIFEST_FILE_NAME {
        return Some(true);
    }
    if name == CATALOG_FILE_NAME {
        return Some(false);
    }
    None
}

/// Build a manifest over every file currently in `dir` plus
/// `epoch_id_switched` captured at the same moment. Callers are
/// expected to have rotated every channel (and the epoch file, if
/// desired) immediately before calling this so the "inactive" set is
/// stable.
pub fn build_manifest(dir: &std::path::Path, _kind: BackupKind, epoch_id_switched: u64) -> std::io::Result<BackupManifest> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(mutable_source) = classify(&name) {
            entries.push(BackupEntry { source: entry.path(), destination_name: name, mutable_source });
        }
    }
    entries.sort_by(|a, b| a.destination_name.cmp(&b.destination_name));
    Ok(BackupManifest { entries, epoch_id_switched })
}
