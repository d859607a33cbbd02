//! Scanner/repairer for a single WAL file (`dblog_scan`).
//!
//! A single pass drives a small state machine over the decoded token
//! stream, forwards live entries to a caller-supplied sink, tracks the
//! worst parse-error code observed, and optionally repairs the file in
//! place by marking a snippet invalid or truncating the file.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::codec::{self, Decoded};
use crate::error::ParseError;
use crate::model::LogEntry;

/// Monotone ladder of parse outcomes, worst last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseErrorCode {
    Ok,
    Repaired,
    BrokenAfterToBeCut,
    BrokenAfterMarked,
    NondurableEntries,
    BrokenAfter,
    CorruptedDurableEntries,
    Unexpected,
    Failed,
}

/// What to do when the nondurable/truncated/damaged policy fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Ignore,
    Report,
    RepairByMark,
    /// Only meaningful for the truncated/damaged policies.
    RepairByCut,
}

#[derive(Debug, Clone, Copy)]
pub struct RepairPolicy {
    pub nondurable: RepairAction,
    pub truncated: RepairAction,
    pub damaged: RepairAction,
}

impl RepairPolicy {
    /// Startup recovery: report everything, repair nondurable/truncated
    /// tails by marking them invalid, never cut.
    pub fn startup() -> Self {
        RepairPolicy {
            nondurable: RepairAction::RepairByMark,
            truncated: RepairAction::Report,
            damaged: RepairAction::Report,
        }
    }

    /// `tglogutil inspect`: never mutate the file.
    pub fn inspect() -> Self {
        RepairPolicy {
            nondurable: RepairAction::Report,
            truncated: RepairAction::Report,
            damaged: RepairAction::Report,
        }
    }

    /// `tglogutil repair`, mark variant.
    pub fn repair_mark() -> Self {
        RepairPolicy {
            nondurable: RepairAction::RepairByMark,
            truncated: RepairAction::RepairByMark,
            damaged: RepairAction::RepairByMark,
        }
    }

    /// `tglogutil repair --cut`.
    pub fn repair_cut() -> Self {
        RepairPolicy {
            nondurable: RepairAction::RepairByMark,
            truncated: RepairAction::RepairByCut,
            damaged: RepairAction::RepairByCut,
        }
    }

    /// Compaction's own scan never repairs; a damaged input aborts the pass.
    pub fn strict_no_repair() -> Self {
        RepairPolicy {
            nondurable: RepairAction::Ignore,
            truncated: RepairAction::Report,
            damaged: RepairAction::Report,
        }
    }
}

/// Whether the scan stops at the first non-OK result or keeps going and
/// accumulates the worst code seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    FailFast,
    Collect,
}

/// Result of scanning one file.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub worst_code: Option<ParseErrorCode>,
    pub max_epoch_seen: u64,
    pub repaired: bool,
}

impl ScanReport {
    fn bump(&mut self, code: ParseErrorCode) {
        self.worst_code = Some(match self.worst_code {
            Some(existing) if existing >= code => existing,
            _ => code,
        });
    }
}

/// Classify a WAL filename as attached (`pwal_NNNN`) or detached
/// (`pwal_NNNN.<suffix>`).
pub fn is_attached_filename(name: &str) -> bool {
    name.starts_with("pwal_") && !name[5..].contains('.')
}

struct Snippet {
    /// Byte offset of the opening marker's tag byte.
    start_offset: u64,
    epoch: u64,
    valid: bool,
}

/// Scan `path`, forwarding every live entry in a valid, durable-or-not
/// (per policy) snippet to `sink`. `durable_epoch` is the last durable
/// epoch `L`; snippets at `epoch <= durable_epoch` are treated as
/// durable for the corrupted-durable-entries classification.
pub fn scan_file(
    path: &Path,
    durable_epoch: u64,
    policy: RepairPolicy,
    mode: ScanMode,
    mut sink: impl FnMut(LogEntry),
) -> Result<ScanReport, ParseError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(matches!(
            policy.nondurable,
            RepairAction::RepairByMark | RepairAction::RepairByCut
        ) || matches!(
            policy.truncated,
            RepairAction::RepairByMark | RepairAction::RepairByCut
        ) || matches!(
            policy.damaged,
            RepairAction::RepairByMark | RepairAction::RepairByCut
        ))
        .open(path)
        .map_err(|source| ParseError::Io { path: path.to_path_buf(), source })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|source| ParseError::Io { path: path.to_path_buf(), source })?;

    let mut report = ScanReport::default();
    let mut offset: u64 = 0;
    let mut current: Option<Snippet> = None;

    macro_rules! fail_or_collect {
        ($report:expr, $code:expr, $mode:expr, $path:expr) => {{
            $report.bump($code);
            if $mode == ScanMode::FailFast && $code >= ParseErrorCode::Unexpected {
                return Err(ParseError::Unrepairable {
                    path: $path.to_path_buf(),
                    code: $code,
                });
            }
        }};
    }

    loop {
        let slice = &buf[offset as usize..];
        if slice.is_empty() {
            break;
        }
        let tag_offset = offset;
        match codec::decode_one(slice) {
            Decoded::Ok { entry, rest } => {
                let consumed = slice.len() - rest.len();
                match &entry {
                    LogEntry::MarkerBegin { epoch } => {
                        if *epoch > durable_epoch {
                            match policy.nondurable {
                                RepairAction::Ignore => {}
                                RepairAction::Report => {
                                    report.bump(ParseErrorCode::NondurableEntries);
                                }
                                RepairAction::RepairByMark | RepairAction::RepairByCut => {
                                    mark_invalid(&mut file, tag_offset)
                                        .map_err(|source| ParseError::Io { path: path.to_path_buf(), source })?;
                                    report.bump(ParseErrorCode::Repaired);
                                    report.repaired = true;
                                }
                            }
                            current = Some(Snippet { start_offset: tag_offset, epoch: *epoch, valid: false });
                        } else {
                            current = Some(Snippet { start_offset: tag_offset, epoch: *epoch, valid: true });
                        }
                    }
                    LogEntry::MarkerInvalidatedBegin { epoch } => {
                        current = Some(Snippet {
                            start_offset: tag_offset,
                            epoch: *epoch,
                            valid: false,
                        });
                    }
                    LogEntry::MarkerEnd { .. } => {
                        current = None;
                    }
                    LogEntry::MarkerDurable { .. } => {}
                    _ => {
                        if let Some(snip) = &current {
                            if snip.valid {
                                report.max_epoch_seen = report.max_epoch_seen.max(snip.epoch);
                                sink(entry);
                            }
                        } else {
                            // data entry with no open snippet: unexpected.
                            fail_or_collect!(report, ParseErrorCode::Unexpected, mode, path);
                        }
                    }
                }
                if let LogEntry::MarkerBegin { epoch } = &entry {
                    report.max_epoch_seen = report.max_epoch_seen.max(*epoch);
                }
                offset += consumed as u64;
            }
            Decoded::ShortEntry => {
                let snippet_durable = current.as_ref().map(|s| s.epoch <= durable_epoch).unwrap_or(false);
                if snippet_durable {
                    fail_or_collect!(report, ParseErrorCode::CorruptedDurableEntries, mode, path);
                } else {
                    let action = policy.truncated;
                    apply_repair(
                        &mut file,
                        &mut report,
                        &current,
                        tag_offset,
                        action,
                        ParseErrorCode::BrokenAfterMarked,
                        mode,
                        path,
                    )?;
                }
                break;
            }
            Decoded::UnknownType(_) => {
                let snippet_durable = current.as_ref().map(|s| s.epoch <= durable_epoch).unwrap_or(false);
                if snippet_durable {
                    fail_or_collect!(report, ParseErrorCode::CorruptedDurableEntries, mode, path);
                } else {
                    let action = policy.damaged;
                    apply_repair(
                        &mut file,
                        &mut report,
                        &current,
                        tag_offset,
                        action,
                        ParseErrorCode::BrokenAfterMarked,
                        mode,
                        path,
                    )?;
                }
                break;
            }
        }
    }

    if report.worst_code.is_none() {
        report.worst_code = Some(ParseErrorCode::Ok);
    }
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn apply_repair(
    file: &mut std::fs::File,
    report: &mut ScanReport,
    current: &Option<Snippet>,
    tag_offset: u64,
    action: RepairAction,
    marked_code: ParseErrorCode,
    mode: ScanMode,
    path: &Path,
) -> Result<(), ParseError> {
    let snippet_start = current.as_ref().map(|s| s.start_offset).unwrap_or(tag_offset);
    match action {
        RepairAction::Ignore => {}
        RepairAction::Report => {
            report.bump(ParseErrorCode::BrokenAfter);
            if mode == ScanMode::FailFast {
                return Err(ParseError::Unrepairable { path: path.to_path_buf(), code: ParseErrorCode::BrokenAfter });
            }
        }
        RepairAction::RepairByMark => {
            mark_invalid(file, snippet_start)
                .map_err(|source| ParseError::Io { path: path.to_path_buf(), source })?;
            report.bump(marked_code);
            report.repaired = true;
        }
        RepairAction::RepairByCut => {
            file.set_len(snippet_start)
                .map_err(|source| ParseError::Io { path: path.to_path_buf(), source })?;
            report.bump(ParseErrorCode::BrokenAfterToBeCut);
            report.repaired = true;
        }
    }
    Ok(())
}

/// Flip the opening tag of the snippet at `offset` from `marker_begin`
/// to `marker_invalidated_begin`.
fn mark_invalid(file: &mut std::fs::File, offset: u64) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&[codec::TAG_MARKER_INVALIDATED_BEGIN])?;
    file.flush()?;
    file.sync_all()
}

/// Scan every file in `paths` using a fixed-size worker pool, pulling
/// from a shared queue. The first fail-fast error cancels the rest.
pub fn scan_files_parallel(
    paths: Vec<PathBuf>,
    durable_epoch: u64,
    policy: RepairPolicy,
    mode: ScanMode,
    threads: usize,
    on_entry: impl FnMut(&Path, LogEntry) + Send + Clone + 'static,
) -> Result<Vec<(PathBuf, ScanReport)>, ParseError> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    let queue = Arc::new(Mutex::new(paths.into_iter().collect::<std::collections::VecDeque<_>>()));
    let cancelled = Arc::new(AtomicBool::new(false));
    let results: Arc<Mutex<Vec<(PathBuf, Result<ScanReport, ParseError>)>>> = Arc::new(Mutex::new(Vec::new()));

    let threads = threads.max(1);
    std::thread::scope(|scope| {
        for _ in 0..threads {
            let queue = Arc::clone(&queue);
            let cancelled = Arc::clone(&cancelled);
            let results = Arc::clone(&results);
            let mut on_entry = on_entry.clone();
            scope.spawn(move || loop {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                let next = queue.lock().unwrap().pop_front();
                let Some(path) = next else { break };
                let outcome = scan_file(&path, durable_epoch, policy, mode, |e| on_entry(&path, e));
                if outcome.is_err() && mode == ScanMode::FailFast {
                    cancelled.store(true, Ordering::SeqCst);
                }
                results.lock().unwrap().push((path, outcome));
            });
        }
    });

    let collected = Arc::try_unwrap(results).unwrap().into_inner().unwrap();
    let mut out = Vec::with_capacity(collected.len());
    for (path, res) in collected {
        match res {
            Ok(report) => out.push((path, report)),
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WriteVersion;
    use tempfile::tempdir;

    fn write_entries(path: &Path, entries: &[LogEntry]) {
        let mut buf = Vec::new();
        for e in entries {
            codec::encode_one(e, &mut buf);
        }
        std::fs::write(path, buf).unwrap();
    }

    #[test]
    fn clean_file_reports_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pwal_0000");
        write_entries(
            &path,
            &[
                LogEntry::MarkerBegin { epoch: 1 },
                LogEntry::NormalEntry {
                    storage: 1,
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                    write_version: WriteVersion::new(1, 0),
                },
                LogEntry::MarkerEnd { epoch: 1 },
            ],
        );

        let mut seen = Vec::new();
        let report = scan_file(&path, 1, RepairPolicy::inspect(), ScanMode::Collect, |e| seen.push(e)).unwrap();
        assert_eq!(report.worst_code, Some(ParseErrorCode::Ok));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn truncated_tail_is_repaired_by_mark() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pwal_0001.1.1");
        let mut buf = Vec::new();
        codec::encode_one(&LogEntry::MarkerBegin { epoch: 5 }, &mut buf);
        codec::encode_one(
            &LogEntry::NormalEntry {
                storage: 1,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                write_version: WriteVersion::new(5, 0),
            },
            &mut buf,
        );
        // truncate mid next-record to simulate a crash.
        buf.push(codec::TAG_NORMAL_ENTRY);
        buf.extend_from_slice(&1u32.to_le_bytes());
        std::fs::write(&path, &buf).unwrap();

        let report = scan_file(&path, 0, RepairPolicy::repair_mark(), ScanMode::Collect, |_| {}).unwrap();
        assert!(report.repaired);

        let rewritten = std::fs::read(&path).unwrap();
        assert_eq!(rewritten[0], codec::TAG_MARKER_INVALIDATED_BEGIN);
    }

    #[test]
    fn is_attached_filename_classifies_correctly() {
        assert!(is_attached_filename("pwal_0001"));
        assert!(!is_attached_filename("pwal_0001.1700000000000.3"));
    }
}
