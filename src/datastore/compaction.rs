//! Shared dedup/merge core for both the background online-compaction
//! worker and the offline `tglogutil compaction` subcommand.

use std::path::Path;

use crate::catalog::{Catalog, CompactedFile};
use crate::codec;
use crate::container::{merge_sorted_containers, Container};
use crate::datastore::recovery::Snapshot;
use crate::error::CompactionError;
use crate::model::{LogEntry, WriteVersion};
use crate::parser::{self, RepairPolicy, ScanMode};

pub const BASE_FILE_NAME: &str = "pwal_0000.compacted";
const BASE_FILE_PREV_NAME: &str = "pwal_0000.compacted.prev";

#[derive(Debug, Default)]
pub struct CompactionReport {
    pub inputs_merged: usize,
    pub keys_written: usize,
}

/// Run one compaction pass against `dir`. `rotated_filenames` is the
/// full current set of detached WAL filenames in the directory (the
/// caller is responsible for having rotated every channel first so this
/// set is stable). Returns `None` if there is nothing new to compact.
pub fn run_pass(
    dir: &Path,
    catalog: &Catalog,
    rotated_filenames: &[String],
    durable_epoch: u64,
) -> Result<Option<(Catalog, CompactionReport)>, CompactionError> {
    let input: Vec<&String> = rotated_filenames
        .iter()
        .filter(|f| !catalog.is_detached_known(f))
        .collect();
    if input.is_empty() {
        return Ok(None);
    }

    let mut containers = Vec::new();

    if let Some(base) = catalog.active_base_file() {
        let base_path = dir.join(&base.filename);
        if base_path.exists() {
            let mut c = Container::new();
            parser::scan_file(&base_path, durable_epoch, RepairPolicy::strict_no_repair(), ScanMode::FailFast, |e| {
                c.push(e);
            })?;
            c.sort();
            containers.push(c);
        }
    }

    for filename in &input {
        let path = dir.join(filename.as_str());
        let mut c = Container::new();
        parser::scan_file(&path, durable_epoch, RepairPolicy::strict_no_repair(), ScanMode::FailFast, |e| {
            c.push(e);
        })?;
        c.sort();
        containers.push(c);
    }

    let merged = merge_sorted_containers(containers);
    let mut snapshot = Snapshot::default();
    for entry in merged.into_vec() {
        snapshot.apply(entry);
    }

    let mut buf = Vec::new();
    let mut keys_written = 0usize;
    codec::encode_one(&LogEntry::MarkerBegin { epoch: durable_epoch }, &mut buf);
    for ((storage, key), value) in snapshot.iter() {
        codec::encode_one(
            &LogEntry::NormalEntry {
                storage: *storage,
                key: key.clone(),
                value: value.value.clone(),
                write_version: WriteVersion::ZERO,
            },
            &mut buf,
        );
        keys_written += 1;
    }
    codec::encode_one(&LogEntry::MarkerEnd { epoch: durable_epoch }, &mut buf);

    let tmp_path = dir.join(format!("{BASE_FILE_NAME}.tmp"));
    std::fs::write(&tmp_path, &buf)?;

    let base_path = dir.join(BASE_FILE_NAME);
    let prev_path = dir.join(BASE_FILE_PREV_NAME);
    if base_path.exists() {
        std::fs::rename(&base_path, &prev_path)?;
    }
    std::fs::rename(&tmp_path, &base_path)?;

    let next_version = catalog.active_base_file().map(|f| f.version + 1).unwrap_or(1);
    let mut new_catalog = catalog.clone();
    new_catalog.record_compaction(
        durable_epoch,
        CompactedFile { filename: BASE_FILE_NAME.to_string(), version: next_version },
        input.into_iter().cloned().collect(),
    );

    if prev_path.exists() {
        std::fs::remove_file(&prev_path)?;
    }

    Ok(Some((new_catalog, CompactionReport { inputs_merged: rotated_filenames.len(), keys_written })))
}
