//! End-to-end scenarios exercising the full open -> write -> restart ->
//! compact lifecycle.

use std::time::Duration;

use limestone::backup::BackupKind;
use limestone::codec;
use limestone::config::DatastoreConfig;
use limestone::datastore::Datastore;
use limestone::parser::{self, RepairPolicy, ScanMode};
use limestone::{Catalog, LogEntry, WriteVersion};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> Datastore {
    Datastore::open(DatastoreConfig::for_testing(dir)).unwrap()
}

#[test]
fn scenario_clean_boot() {
    let dir = tempdir().unwrap();
    let datastore = open(dir.path()).ready().unwrap();
    assert_eq!(datastore.durable_epoch(), 0);
    assert_eq!(datastore.snapshot_len(), 0);
    assert!(dir.path().join("limestone-manifest.json").exists());
}

#[test]
fn scenario_two_channels_one_epoch() {
    let dir = tempdir().unwrap();
    let datastore = open(dir.path());
    let mut ch0 = datastore.create_channel().unwrap();
    let mut ch1 = datastore.create_channel().unwrap();
    let datastore = datastore.ready().unwrap();

    datastore.switch_epoch(1);
    ch0.begin_session().unwrap();
    ch0.add_entry(1, b"k1".to_vec(), b"v1".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch0.end_session().unwrap();

    ch1.begin_session().unwrap();
    ch1.add_entry(1, b"k2".to_vec(), b"v3".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch1.end_session().unwrap();

    datastore.switch_epoch(2);
    std::thread::sleep(Duration::from_millis(50));

    datastore.shutdown().wait();

    let reopened = open(dir.path()).ready().unwrap();
    assert_eq!(reopened.snapshot_get(1, b"k1").unwrap().value, b"v1");
    assert_eq!(reopened.snapshot_get(1, b"k2").unwrap().value, b"v3");
}

#[test]
fn scenario_compaction_of_two_files() {
    let dir = tempdir().unwrap();
    let datastore = open(dir.path());
    let mut ch0 = datastore.create_channel().unwrap();
    let mut ch1 = datastore.create_channel().unwrap();
    let datastore = datastore.ready().unwrap();

    datastore.switch_epoch(1);
    ch0.begin_session().unwrap();
    ch0.add_entry(1, b"k1".to_vec(), b"v1".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch0.end_session().unwrap();
    ch1.begin_session().unwrap();
    ch1.add_entry(1, b"k2".to_vec(), b"v3".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch1.end_session().unwrap();
    datastore.switch_epoch(2);
    std::thread::sleep(Duration::from_millis(50));

    datastore.rotate_log_files(&mut [ch0, ch1]).unwrap();
    let report = datastore.run_compaction_pass_now().unwrap();
    assert!(report.is_some());

    datastore.shutdown().wait();

    assert!(dir.path().join("pwal_0000.compacted").exists());
    let catalog = Catalog::load_or_default(dir.path()).unwrap();
    assert_eq!(catalog.detached_pwals.len(), 2);

    let reopened = open(dir.path()).ready().unwrap();
    assert_eq!(reopened.snapshot_get(1, b"k1").unwrap().value, b"v1");
    assert_eq!(reopened.snapshot_get(1, b"k2").unwrap().value, b"v3");
}

#[test]
fn scenario_remove_then_add() {
    let dir = tempdir().unwrap();
    let datastore = open(dir.path());
    let mut ch0 = datastore.create_channel().unwrap();
    let datastore = datastore.ready().unwrap();

    datastore.switch_epoch(1);
    ch0.begin_session().unwrap();
    ch0.add_entry(1, b"k3".to_vec(), b"v1".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch0.end_session().unwrap();

    ch0.begin_session().unwrap();
    ch0.remove_entry(1, b"k3".to_vec(), WriteVersion::new(1, 1)).unwrap();
    ch0.end_session().unwrap();

    datastore.switch_epoch(6);
    ch0.begin_session().unwrap();
    ch0.add_entry(1, b"k3".to_vec(), b"v23".to_vec(), WriteVersion::new(5, 0)).unwrap();
    ch0.end_session().unwrap();
    datastore.switch_epoch(7);
    std::thread::sleep(Duration::from_millis(50));

    datastore.rotate_log_files(&mut [ch0]).unwrap();
    datastore.run_compaction_pass_now().unwrap();
    datastore.shutdown().wait();

    let reopened = open(dir.path()).ready().unwrap();
    assert_eq!(reopened.snapshot_get(1, b"k3").unwrap().value, b"v23");
}

#[test]
fn scenario_begin_backup_lists_detached_and_side_files() {
    let dir = tempdir().unwrap();
    let datastore = open(dir.path());
    let mut ch0 = datastore.create_channel().unwrap();
    let datastore = datastore.ready().unwrap();

    datastore.switch_epoch(1);
    ch0.begin_session().unwrap();
    ch0.add_entry(1, b"k1".to_vec(), b"v1".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch0.end_session().unwrap();
    datastore.switch_epoch(2);
    std::thread::sleep(Duration::from_millis(50));

    let manifest = datastore.begin_backup(BackupKind::Standard, &mut [ch0]).unwrap();
    let names: Vec<_> = manifest.entries.iter().map(|e| e.destination_name.clone()).collect();
    assert!(names.iter().any(|n| n.starts_with("pwal_0000.")));
    assert!(names.contains(&"limestone-manifest.json".to_string()));

    datastore.shutdown().wait();
}

#[test]
fn scenario_remove_storage_wipes_prior_data() {
    let dir = tempdir().unwrap();
    let datastore = open(dir.path());
    let mut ch0 = datastore.create_channel().unwrap();
    let datastore = datastore.ready().unwrap();

    datastore.switch_epoch(1);
    ch0.begin_session().unwrap();
    ch0.add_entry(1, b"a".to_vec(), b"1".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch0.add_entry(2, b"b".to_vec(), b"2".to_vec(), WriteVersion::new(1, 0)).unwrap();
    ch0.end_session().unwrap();

    datastore.switch_epoch(2);
    ch0.begin_session().unwrap();
    ch0.remove_storage(1, WriteVersion::new(2, 0)).unwrap();
    ch0.add_entry(2, b"c".to_vec(), b"3".to_vec(), WriteVersion::new(2, 0)).unwrap();
    ch0.end_session().unwrap();
    datastore.switch_epoch(3);
    std::thread::sleep(Duration::from_millis(50));
    datastore.shutdown().wait();

    let reopened = open(dir.path()).ready().unwrap();
    assert!(reopened.snapshot_get(1, b"a").is_none());
    assert!(reopened.snapshot_get(2, b"b").is_some());
    assert!(reopened.snapshot_get(2, b"c").is_some());
}

fn write_damaged_tail(path: &std::path::Path) {
    let mut buf = Vec::new();
    codec::encode_one(&LogEntry::MarkerBegin { epoch: 1 }, &mut buf);
    codec::encode_one(
        &LogEntry::NormalEntry {
            storage: 1,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            write_version: WriteVersion::new(1, 0),
        },
        &mut buf,
    );
    buf.push(codec::TAG_NORMAL_ENTRY);
    buf.extend_from_slice(&3u32.to_le_bytes());
    std::fs::write(path, &buf).unwrap();
}

#[test]
fn scenario_repair_mark() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pwal_0000");
    write_damaged_tail(&path);

    let inspect = parser::scan_file(&path, 0, RepairPolicy::inspect(), ScanMode::Collect, |_| {}).unwrap();
    assert!(inspect.worst_code.unwrap() != parser::ParseErrorCode::Ok);

    let repaired = parser::scan_file(&path, 0, RepairPolicy::repair_mark(), ScanMode::Collect, |_| {}).unwrap();
    assert!(repaired.repaired);

    let rewritten = std::fs::read(&path).unwrap();
    assert_eq!(rewritten[0], codec::TAG_MARKER_INVALIDATED_BEGIN);

    let rescan = parser::scan_file(&path, 0, RepairPolicy::inspect(), ScanMode::Collect, |_| {}).unwrap();
    assert_eq!(rescan.worst_code, Some(parser::ParseErrorCode::Ok));
}

#[test]
fn scenario_repair_cut() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pwal_0000");
    write_damaged_tail(&path);
    let before_len = std::fs::metadata(&path).unwrap().len();

    let repaired = parser::scan_file(&path, 0, RepairPolicy::repair_cut(), ScanMode::Collect, |_| {}).unwrap();
    assert!(repaired.repaired);

    let after_len = std::fs::metadata(&path).unwrap().len();
    assert!(after_len < before_len);
}
