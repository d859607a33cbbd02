//! Epoch coordinator: the three-counter compare-exchange staging that
//! advances the durable epoch and drives the persistence callback.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::codec;
use crate::model::LogEntry;

pub const EPOCH_FILE_NAME: &str = "epoch";

/// Atomic epoch counters plus the mutexes guarding the durable-epoch
/// writer and the persistence callback invocation.
pub struct EpochCoordinator {
    pub epoch_id_switched: AtomicU64,
    pub epoch_id_informed: AtomicU64,
    pub epoch_id_to_be_recorded: AtomicU64,
    pub epoch_id_record_finished: AtomicU64,

    epoch_file: Mutex<EpochFileWriter>,
    callback_mutex: Mutex<()>,

    pub rotate_mutex: Mutex<()>,
    pub informed_condvar: Condvar,
    informed_condvar_mutex: Mutex<()>,
}

struct EpochFileWriter {
    dir: PathBuf,
    file: File,
    appended_since_rewrite: u64,
    rewrite_threshold: u64,
}

impl EpochFileWriter {
    fn open(dir: &Path, rewrite_threshold: u64) -> std::io::Result<Self> {
        let path = dir.join(EPOCH_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(EpochFileWriter { dir: dir.to_path_buf(), file, appended_since_rewrite: 0, rewrite_threshold })
    }

    fn append(&mut self, epoch: u64) -> std::io::Result<()> {
        let mut buf = Vec::new();
        codec::encode_one(&LogEntry::MarkerDurable { epoch }, &mut buf);
        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.appended_since_rewrite += 1;
        if self.appended_since_rewrite >= self.rewrite_threshold {
            self.rewrite(epoch)?;
        }
        Ok(())
    }

    /// Atomically replace the epoch file with one holding just the
    /// latest durable marker, keeping the file bounded.
    fn rewrite(&mut self, latest: u64) -> std::io::Result<()> {
        let tmp_path = self.dir.join(".epoch.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut buf = Vec::new();
            codec::encode_one(&LogEntry::MarkerDurable { epoch: latest }, &mut buf);
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        let path = self.dir.join(EPOCH_FILE_NAME);
        std::fs::rename(&tmp_path, &path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.appended_since_rewrite = 0;
        Ok(())
    }
}

impl EpochCoordinator {
    pub fn open(dir: &Path, rewrite_threshold: u64, initial_durable: u64) -> std::io::Result<Self> {
        Ok(EpochCoordinator {
            epoch_id_switched: AtomicU64::new(initial_durable),
            epoch_id_informed: AtomicU64::new(initial_durable),
            epoch_id_to_be_recorded: AtomicU64::new(initial_durable),
            epoch_id_record_finished: AtomicU64::new(initial_durable),
            epoch_file: Mutex::new(EpochFileWriter::open(dir, rewrite_threshold)?),
            callback_mutex: Mutex::new(()),
            rotate_mutex: Mutex::new(()),
            informed_condvar: Condvar::new(),
            informed_condvar_mutex: Mutex::new(()),
        })
    }

    pub fn switch_epoch(&self, new_epoch: u64) {
        let old = self.epoch_id_switched.swap(new_epoch, Ordering::SeqCst);
        if new_epoch <= old {
            tracing::warn!(
                target: "limestone::epoch",
                old, new_epoch, "switch_epoch called with a non-advancing epoch"
            );
        }
    }

    /// Append `marker_durable(epoch)` and fsync, rewriting the file
    /// periodically to keep it bounded.
    pub fn write_epoch(&self, epoch: u64) -> std::io::Result<()> {
        self.epoch_file.lock().append(epoch)
    }

    /// Compute the greatest epoch `u` that every open session is past
    /// and that at least one channel has finished, then try to advance
    /// the record/inform pipeline to it. Returns the newly informed
    /// epoch if the persistence callback should fire.
    pub fn compute_candidate(&self, open_sessions: &[u64], finished_epochs: &[u64]) -> Option<u64> {
        let switched = self.epoch_id_switched.load(Ordering::SeqCst);
        if switched == 0 {
            return None;
        }
        let mut candidate = switched - 1;
        for &open in open_sessions {
            if open <= candidate {
                // an open session belongs to `open`; nothing at or past
                // it can be declared durable yet.
                candidate = open.saturating_sub(1);
            }
        }
        let max_finished = finished_epochs.iter().copied().max().unwrap_or(0);
        candidate = candidate.min(max_finished);
        if candidate == 0 && max_finished == 0 {
            return None;
        }
        Some(candidate)
    }

    /// Try to advance the staging counters to `candidate` and persist
    /// it; returns `Some(epoch)` if the persistence callback should run
    /// for that epoch.
    pub fn try_advance(&self, candidate: u64) -> std::io::Result<Option<u64>> {
        let current = self.epoch_id_to_be_recorded.load(Ordering::SeqCst);
        if candidate <= current {
            return Ok(None);
        }
        if self
            .epoch_id_to_be_recorded
            .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }

        self.write_epoch(candidate)?;
        self.epoch_id_record_finished.store(candidate, Ordering::SeqCst);

        let informed_current = self.epoch_id_informed.load(Ordering::SeqCst);
        if self.epoch_id_record_finished.load(Ordering::SeqCst) < candidate {
            return Ok(None);
        }
        if self
            .epoch_id_informed
            .compare_exchange(informed_current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = self.callback_mutex.lock();
        self.informed_condvar.notify_all();
        Ok(Some(candidate))
    }

    pub fn wait_until_informed_reaches(&self, target: u64) {
        let mut guard = self.informed_condvar_mutex.lock();
        while self.epoch_id_informed.load(Ordering::SeqCst) < target {
            self.informed_condvar.wait(&mut guard);
        }
    }
}
