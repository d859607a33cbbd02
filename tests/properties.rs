//! Property tests over the merge, parser, epoch, and compaction cores.

use std::collections::BTreeMap;

use limestone::codec;
use limestone::container::{merge_sorted_containers, Container};
use limestone::parser::{self, ParseErrorCode, RepairPolicy, ScanMode};
use limestone::{LogEntry, WriteVersion};
use proptest::prelude::*;
use tempfile::tempdir;

fn arb_entry() -> impl Strategy<Value = LogEntry> {
    (0u64..4, 0u8..6, 0u64..8, 0u64..8).prop_map(|(storage, key_byte, major, minor)| {
        LogEntry::NormalEntry {
            storage,
            key: vec![b'a' + key_byte],
            value: vec![1, 2, 3],
            write_version: WriteVersion::new(major, minor),
        }
    })
}

proptest! {
    /// P2: merging any number of descending-sorted containers yields a
    /// descending-sorted container whose size is the sum of the inputs.
    #[test]
    fn merge_is_descending_and_size_preserving(
        groups in prop::collection::vec(prop::collection::vec(arb_entry(), 0..8), 0..5)
    ) {
        let total: usize = groups.iter().map(|g| g.len()).sum();
        let containers: Vec<Container> = groups
            .into_iter()
            .map(|entries| {
                let mut c: Container = entries.into();
                c.sort();
                c
            })
            .collect();

        let merged = merge_sorted_containers(containers);
        prop_assert_eq!(merged.len(), total);

        let versions: Vec<_> = merged
            .iter()
            .filter_map(|e| e.storage_key().map(|(s, k)| (s, k.to_vec(), e.write_version().unwrap())))
            .collect();
        for window in versions.windows(2) {
            let (s0, k0, wv0) = &window[0];
            let (s1, k1, wv1) = &window[1];
            if s0 == s1 && k0 == k1 {
                prop_assert!(wv0 >= wv1);
            }
        }
    }

    /// P4: repairing a file never raises the worst code above what a
    /// plain inspect pass reports; it only ever lowers it (to `Repaired`)
    /// or leaves it unchanged.
    #[test]
    fn repair_never_raises_the_worst_code(
        valid_entries in prop::collection::vec(arb_entry(), 0..5),
        garbage in prop::collection::vec(any::<u8>(), 0..6),
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pwal_0000");

        let mut buf = Vec::new();
        codec::encode_one(&LogEntry::MarkerBegin { epoch: 1 }, &mut buf);
        for entry in &valid_entries {
            codec::encode_one(entry, &mut buf);
        }
        codec::encode_one(&LogEntry::MarkerEnd { epoch: 1 }, &mut buf);
        buf.extend_from_slice(&garbage);
        std::fs::write(&path, &buf).unwrap();

        let before = parser::scan_file(&path, 1, RepairPolicy::inspect(), ScanMode::Collect, |_| {})
            .unwrap()
            .worst_code
            .unwrap();

        let after = parser::scan_file(&path, 1, RepairPolicy::repair_mark(), ScanMode::Collect, |_| {})
            .unwrap()
            .worst_code
            .unwrap();

        prop_assert!(after <= before || after == ParseErrorCode::Repaired);
    }

    /// P5: `switch_epoch` calls in any order leave `epoch_id_switched`
    /// at the maximum value ever passed in.
    #[test]
    fn switch_epoch_converges_to_the_max(epochs in prop::collection::vec(0u64..50, 1..20)) {
        let dir = tempdir().unwrap();
        let coord = limestone::datastore::epoch::EpochCoordinator::open(dir.path(), 1000, 0).unwrap();
        let max = epochs.iter().copied().max().unwrap();
        for e in epochs {
            coord.switch_epoch(e);
        }
        prop_assert_eq!(coord.epoch_id_switched.load(std::sync::atomic::Ordering::SeqCst), max);
    }

    /// P7: compacting a set of single-epoch WAL files into a base file
    /// and rescanning it yields the same last-write-wins view as folding
    /// the same entries directly.
    #[test]
    fn compaction_preserves_last_write_wins(
        writes in prop::collection::vec((0u64..3, 0u8..4, 0u64..6), 1..12)
    ) {
        let dir = tempdir().unwrap();
        let mut expected: BTreeMap<(u64, u8), u64> = BTreeMap::new();
        let mut buf = Vec::new();
        codec::encode_one(&LogEntry::MarkerBegin { epoch: 1 }, &mut buf);
        for &(storage, key_byte, major) in &writes {
            let wv = WriteVersion::new(major, 0);
            let existing = expected.get(&(storage, key_byte)).copied();
            if existing.map(|m| major >= m).unwrap_or(true) {
                expected.insert((storage, key_byte), major);
            }
            codec::encode_one(
                &LogEntry::NormalEntry {
                    storage,
                    key: vec![key_byte],
                    value: vec![major as u8],
                    write_version: wv,
                },
                &mut buf,
            );
        }
        codec::encode_one(&LogEntry::MarkerEnd { epoch: 1 }, &mut buf);
        std::fs::write(dir.path().join("pwal_0000.1.1"), &buf).unwrap();

        let catalog = limestone::Catalog::empty();
        let inputs = vec!["pwal_0000.1.1".to_string()];
        let (_new_catalog, report) =
            limestone::datastore::compaction::run_pass(dir.path(), &catalog, &inputs, 1)
                .unwrap()
                .unwrap();
        prop_assert_eq!(report.keys_written, expected.len());

        let mut seen: BTreeMap<(u64, u8), u64> = BTreeMap::new();
        parser::scan_file(
            &dir.path().join(limestone::datastore::compaction::BASE_FILE_NAME),
            1,
            RepairPolicy::inspect(),
            ScanMode::Collect,
            |entry| {
                if let LogEntry::NormalEntry { storage, key, value, .. } = entry {
                    seen.insert((storage, key[0]), value[0] as u64);
                }
            },
        )
        .unwrap();
        prop_assert_eq!(seen, expected);
    }
}
