//! Startup recovery: manifest validation, determining the last durable
//! epoch, scanning every WAL file, and building the in-memory snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::blob::BlobRegistry;
use crate::catalog::Catalog;
use crate::codec;
use crate::datastore::epoch::EPOCH_FILE_NAME;
use crate::error::LimestoneError;
use crate::model::{BlobId, LogEntry, StorageId, WriteVersion};
use crate::parser::{self, RepairPolicy, ScanMode};

/// Value stored per `(storage, key)` in the recovered snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotValue {
    pub write_version: WriteVersion,
    pub value: Vec<u8>,
    pub blob_ids: Vec<BlobId>,
}

/// The black-box "external sorted-file" of the distilled design,
/// realized here as an in-memory ordered map: the core's job is to
/// specify the sort/merge/last-write-wins semantics, not a particular
/// storage engine.
///
/// `storage_floor` is a per-storage tombstone version: rows written at
/// or below it are invisible regardless of scan order, so a
/// `remove_storage`/`clear_storage` applied before a file containing an
/// older row (in filename scan order, not write-version order) can't be
/// resurrected by that later file.
#[derive(Debug, Default)]
pub struct Snapshot {
    entries: BTreeMap<(StorageId, Vec<u8>), SnapshotValue>,
    storage_floor: BTreeMap<StorageId, WriteVersion>,
}

impl Snapshot {
    pub fn get(&self, storage: StorageId, key: &[u8]) -> Option<&SnapshotValue> {
        self.entries.get(&(storage, key.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(StorageId, Vec<u8>), &SnapshotValue)> {
        self.entries.iter()
    }

    pub(crate) fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::NormalEntry { storage, key, value, write_version } => {
                self.upsert(storage, key, write_version, value, Vec::new());
            }
            LogEntry::NormalWithBlob { storage, key, value, write_version, blob_ids } => {
                self.upsert(storage, key, write_version, value, blob_ids);
            }
            LogEntry::RemoveEntry { storage, key, write_version } => {
                self.remove_if_newer(storage, key, write_version);
            }
            LogEntry::RemoveStorage { storage, write_version } | LogEntry::ClearStorage { storage, write_version } => {
                self.raise_storage_floor(storage, write_version);
            }
            _ => {}
        }
    }

    fn raise_storage_floor(&mut self, storage: StorageId, write_version: WriteVersion) {
        let floor = self.storage_floor.entry(storage).or_insert(WriteVersion::ZERO);
        if write_version > *floor {
            *floor = write_version;
        }
        let floor = *floor;
        self.entries.retain(|(s, _), v| *s != storage || v.write_version > floor);
    }

    fn upsert(&mut self, storage: StorageId, key: Vec<u8>, wv: WriteVersion, value: Vec<u8>, blob_ids: Vec<BlobId>) {
        if let Some(floor) = self.storage_floor.get(&storage) {
            if wv <= *floor {
                return;
            }
        }
        let entry = self.entries.entry((storage, key));
        match entry {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(SnapshotValue { write_version: wv, value, blob_ids });
            }
            std::collections::btree_map::Entry::Occupied(mut o) => {
                if wv >= o.get().write_version {
                    o.insert(SnapshotValue { write_version: wv, value, blob_ids });
                }
            }
        }
    }

    fn remove_if_newer(&mut self, storage: StorageId, key: Vec<u8>, wv: WriteVersion) {
        if let Some(existing) = self.entries.get(&(storage, key.clone())) {
            if wv < existing.write_version {
                return;
            }
        }
        self.entries.remove(&(storage, key));
    }
}

fn last_durable_epoch_in_dir(dir: &Path) -> std::io::Result<u64> {
    let mut max_epoch = 0u64;
    let epoch_path = dir.join(EPOCH_FILE_NAME);
    if epoch_path.exists() {
        max_epoch = max_epoch.max(scan_epoch_file(&epoch_path)?);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("epoch.") {
            max_epoch = max_epoch.max(scan_epoch_file(&entry.path())?);
        }
    }
    Ok(max_epoch)
}

fn scan_epoch_file(path: &Path) -> std::io::Result<u64> {
    let bytes = std::fs::read(path)?;
    let mut offset = 0;
    let mut max_epoch = 0u64;
    while offset < bytes.len() {
        match codec::decode_one(&bytes[offset..]) {
            codec::Decoded::Ok { entry: LogEntry::MarkerDurable { epoch }, rest } => {
                max_epoch = max_epoch.max(epoch);
                offset = bytes.len() - rest.len();
            }
            _ => break,
        }
    }
    Ok(max_epoch)
}

fn wal_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("pwal_") && !name.contains(".compacted") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

pub struct RecoveryResult {
    pub snapshot: Snapshot,
    pub durable_epoch: u64,
}

/// Run the full startup recovery sequence: determine `L`, scan the
/// existing base file plus every WAL file, and build the snapshot.
/// Durable snippet entries are always accepted; nondurable snippets are
/// marked invalid in place so a restart doesn't see them again.
pub fn recover(dir: &Path, catalog: &Catalog, blob_registry: &dyn BlobRegistry) -> Result<RecoveryResult, LimestoneError> {
    let durable_epoch = last_durable_epoch_in_dir(dir)?;
    let mut snapshot = Snapshot::default();

    if let Some(base) = catalog.active_base_file() {
        let base_path = dir.join(&base.filename);
        if base_path.exists() {
            parser::scan_file(&base_path, durable_epoch, RepairPolicy::inspect(), ScanMode::FailFast, |entry| {
                snapshot.apply(entry);
            })?;
        }
    }

    for path in wal_files(dir)? {
        let filename = path.file_name().unwrap().to_string_lossy().to_string();
        if catalog.is_detached_known(&filename) {
            continue;
        }
        parser::scan_file(&path, durable_epoch, RepairPolicy::startup(), ScanMode::FailFast, |entry| {
            if let LogEntry::NormalWithBlob { blob_ids, .. } = &entry {
                blob_registry.register(blob_ids);
            }
            snapshot.apply(entry);
        })?;
    }

    Ok(RecoveryResult { snapshot, durable_epoch })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::NullBlobRegistry;
    use crate::model::WriteVersion;
    use tempfile::tempdir;

    fn write_wal(path: &Path, entries: &[LogEntry]) {
        let mut buf = Vec::new();
        for e in entries {
            codec::encode_one(e, &mut buf);
        }
        std::fs::write(path, buf).unwrap();
    }

    #[test]
    fn recovers_snapshot_from_two_channels() {
        let dir = tempdir().unwrap();
        write_wal(
            &dir.path().join("pwal_0000"),
            &[
                LogEntry::MarkerBegin { epoch: 1 },
                LogEntry::NormalEntry {
                    storage: 1,
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                    write_version: WriteVersion::new(1, 0),
                },
                LogEntry::MarkerEnd { epoch: 1 },
            ],
        );
        write_wal(
            &dir.path().join("pwal_0001"),
            &[
                LogEntry::MarkerBegin { epoch: 1 },
                LogEntry::NormalEntry {
                    storage: 1,
                    key: b"k2".to_vec(),
                    value: b"v3".to_vec(),
                    write_version: WriteVersion::new(1, 0),
                },
                LogEntry::MarkerEnd { epoch: 1 },
            ],
        );
        codec::encode_one(&LogEntry::MarkerDurable { epoch: 2 }, &mut Vec::new());
        std::fs::write(dir.path().join(EPOCH_FILE_NAME), {
            let mut buf = Vec::new();
            codec::encode_one(&LogEntry::MarkerDurable { epoch: 2 }, &mut buf);
            buf
        })
        .unwrap();

        let catalog = Catalog::empty();
        let result = recover(dir.path(), &catalog, &NullBlobRegistry).unwrap();
        assert_eq!(result.durable_epoch, 2);
        assert_eq!(result.snapshot.len(), 2);
        assert_eq!(result.snapshot.get(1, b"k1").unwrap().value, b"v1");
        assert_eq!(result.snapshot.get(1, b"k2").unwrap().value, b"v3");
    }

    #[test]
    fn remove_storage_wipes_prior_rows() {
        let dir = tempdir().unwrap();
        write_wal(
            &dir.path().join("pwal_0000"),
            &[
                LogEntry::MarkerBegin { epoch: 1 },
                LogEntry::NormalEntry {
                    storage: 1,
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                    write_version: WriteVersion::new(1, 0),
                },
                LogEntry::NormalEntry {
                    storage: 2,
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                    write_version: WriteVersion::new(1, 0),
                },
                LogEntry::MarkerEnd { epoch: 1 },
                LogEntry::MarkerBegin { epoch: 2 },
                LogEntry::RemoveStorage { storage: 1, write_version: WriteVersion::new(2, 0) },
                LogEntry::NormalEntry {
                    storage: 2,
                    key: b"c".to_vec(),
                    value: b"3".to_vec(),
                    write_version: WriteVersion::new(2, 0),
                },
                LogEntry::MarkerEnd { epoch: 2 },
            ],
        );
        std::fs::write(dir.path().join(EPOCH_FILE_NAME), {
            let mut buf = Vec::new();
            codec::encode_one(&LogEntry::MarkerDurable { epoch: 2 }, &mut buf);
            buf
        })
        .unwrap();

        let catalog = Catalog::empty();
        let result = recover(dir.path(), &catalog, &NullBlobRegistry).unwrap();
        assert_eq!(result.snapshot.len(), 2);
        assert!(result.snapshot.get(1, b"a").is_none());
        assert!(result.snapshot.get(2, b"b").is_some());
        assert!(result.snapshot.get(2, b"c").is_some());
    }
}
