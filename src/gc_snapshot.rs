//! BLOB-aware GC snapshot.
//!
//! Collects every `normal_with_blob` entry whose write-version is
//! strictly below a boundary, drops its value payload to bound memory,
//! and keeps the storage/key plus blob ids. Finalizing merges every
//! contributing thread's container and keeps one entry per key: the one
//! with the largest write-version.
//!
//! Each worker owns a local container by value and hands it to a shared
//! collector on completion, rather than reaching into a global registry
//! through a thread-local pointer.

use parking_lot::Mutex;

use crate::container::{merge_sorted_containers, Container};
use crate::model::{BlobId, LogEntry, StorageId, WriteVersion};

/// One `normal_with_blob` entry stripped of its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEntry {
    pub storage: StorageId,
    pub key: Vec<u8>,
    pub write_version: WriteVersion,
    pub blob_ids: Vec<BlobId>,
}

/// A single worker's local buffer; handed to [`GcSnapshot::collect`]
/// when the worker finishes its scan.
#[derive(Debug, Default)]
pub struct GcContainer {
    entries: Vec<GcEntry>,
}

impl GcContainer {
    pub fn new() -> Self {
        GcContainer::default()
    }

    pub fn push(&mut self, entry: GcEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sort descending by `(storage, key, write_version)` via the
    /// shared k-way-merge container, carrying each entry as a
    /// value-less `normal_with_blob` record.
    fn into_container(self) -> Container {
        let entries: Vec<LogEntry> = self
            .entries
            .into_iter()
            .map(|e| LogEntry::NormalWithBlob {
                storage: e.storage,
                key: e.key,
                value: Vec::new(),
                write_version: e.write_version,
                blob_ids: e.blob_ids,
            })
            .collect();
        let mut container: Container = entries.into();
        container.sort();
        container
    }
}

/// Shared collector all worker containers are merged into.
#[derive(Default)]
pub struct GcSnapshot {
    boundary: Mutex<Option<WriteVersion>>,
    collected: Mutex<Vec<GcContainer>>,
}

impl GcSnapshot {
    pub fn new(boundary_version: WriteVersion) -> Self {
        GcSnapshot { boundary: Mutex::new(Some(boundary_version)), collected: Mutex::new(Vec::new()) }
    }

    pub fn boundary(&self) -> Option<WriteVersion> {
        *self.boundary.lock()
    }

    /// Hand ownership of a finished worker's container to the shared
    /// collector.
    pub fn collect(&self, container: GcContainer) {
        if container.is_empty() {
            return;
        }
        self.collected.lock().push(container);
    }

    /// Merge every collected container via the shared k-way merge and
    /// dedup to one entry per `(storage, key)`, keeping the largest
    /// write-version observed (the merge's descending order puts it
    /// first within each key's run).
    pub fn finalize(&self) -> Vec<GcEntry> {
        let containers = std::mem::take(&mut *self.collected.lock());
        let sorted: Vec<Container> = containers.into_iter().map(GcContainer::into_container).collect();
        let merged = merge_sorted_containers(sorted);

        let mut out: Vec<GcEntry> = Vec::new();
        for entry in merged.into_vec() {
            if let LogEntry::NormalWithBlob { storage, key, write_version, blob_ids, .. } = entry {
                if let Some(last) = out.last() {
                    if last.storage == storage && last.key == key {
                        continue;
                    }
                }
                out.push(GcEntry { storage, key, write_version, blob_ids });
            }
        }
        out
    }

    /// Clear all collected state; containers already handed over via
    /// [`GcSnapshot::collect`] are cleared, independent of any container
    /// a worker still holds locally.
    pub fn reset(&self, boundary_version: WriteVersion) {
        *self.boundary.lock() = Some(boundary_version);
        self.collected.lock().clear();
    }
}
