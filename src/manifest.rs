//! Manifest and directory lifecycle: the format-version gate and the
//! exclusive advisory lock that makes a log directory single-writer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

pub const MANIFEST_FILE_NAME: &str = "limestone-manifest.json";

/// Persistent-format versions this build accepts, and whether accepting
/// them requires rotating every attached WAL before declaring ready.
const SUPPORTED_VERSIONS: &[(u64, bool)] = &[(1, false)];

const CURRENT_FORMAT_VERSION: &str = "1.0";
const CURRENT_PERSISTENT_FORMAT_VERSION: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: String,
    pub persistent_format_version: u64,
}

impl Manifest {
    pub fn current() -> Self {
        Manifest {
            format_version: CURRENT_FORMAT_VERSION.to_string(),
            persistent_format_version: CURRENT_PERSISTENT_FORMAT_VERSION,
        }
    }

    /// Whether opening a directory that carries this manifest requires a
    /// mandatory WAL rotation before the datastore is ready.
    pub fn requires_rotation(&self) -> Result<bool, ManifestError> {
        SUPPORTED_VERSIONS
            .iter()
            .find(|(v, _)| *v == self.persistent_format_version)
            .map(|(_, rotate)| *rotate)
            .ok_or_else(|| ManifestError::UnsupportedVersion {
                found: self.persistent_format_version,
                supported: SUPPORTED_VERSIONS.iter().map(|(v, _)| *v).collect(),
            })
    }
}

/// Holds the exclusive advisory lock on a log directory for as long as
/// it's alive; the directory becomes writable again when this is
/// dropped.
pub struct DirectoryLock {
    _file: File,
    path: PathBuf,
}

impl std::fmt::Debug for DirectoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryLock").field("path", &self.path).finish()
    }
}

fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use fs2::FileExt;
    file.try_lock_exclusive()
}

/// Open (or create) the manifest, validate its version, and take the
/// exclusive directory lock.
///
/// On an empty directory a fresh manifest is written. On a directory
/// whose manifest requires rotation, the caller must rotate before
/// declaring readiness; this function only reports that requirement.
pub fn open_directory(dir: &Path) -> Result<(DirectoryLock, Manifest, bool), ManifestError> {
    std::fs::create_dir_all(dir)?;
    let manifest_path = dir.join(MANIFEST_FILE_NAME);

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&manifest_path)?;
    try_lock_exclusive(&lock_file).map_err(|_| ManifestError::Locked { path: manifest_path.clone() })?;

    let (manifest, created) = if manifest_path.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        let fresh = Manifest::current();
        write_manifest(&manifest_path, &fresh)?;
        (fresh, true)
    } else {
        let content = std::fs::read_to_string(&manifest_path)?;
        let parsed: Manifest = serde_json::from_str(&content)
            .map_err(|source| ManifestError::Parse { path: manifest_path.clone(), source })?;
        (parsed, false)
    };

    let requires_rotation = manifest.requires_rotation()?;

    Ok((
        DirectoryLock { _file: lock_file, path: manifest_path },
        manifest,
        requires_rotation && !created,
    ))
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        let json = serde_json::to_string_pretty(manifest).expect("manifest serializes");
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn opening_empty_directory_creates_manifest() {
        let dir = tempdir().unwrap();
        let (_lock, manifest, rotate) = open_directory(dir.path()).unwrap();
        assert_eq!(manifest.persistent_format_version, CURRENT_PERSISTENT_FORMAT_VERSION);
        assert!(!rotate);
        assert!(dir.path().join(MANIFEST_FILE_NAME).exists());
    }

    #[test]
    fn reopening_same_directory_while_locked_fails() {
        let dir = tempdir().unwrap();
        let (_lock, _m, _r) = open_directory(dir.path()).unwrap();
        let second = open_directory(dir.path());
        assert!(matches!(second, Err(ManifestError::Locked { .. })));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let dir = tempdir().unwrap();
        let manifest_path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(
            &manifest_path,
            serde_json::to_string(&Manifest {
                format_version: "99.0".into(),
                persistent_format_version: 99,
            })
            .unwrap(),
        )
        .unwrap();
        let result = open_directory(dir.path());
        assert!(matches!(result, Err(ManifestError::UnsupportedVersion { found: 99, .. })));
    }
}
