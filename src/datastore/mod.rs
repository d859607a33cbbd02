//! Datastore core: owns channels, the epoch state machine, the
//! durable-epoch writer, rotation, snapshot construction, the online
//! compaction loop, and startup recovery.

pub mod compaction;
pub mod epoch;
pub mod recovery;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::blob::BlobRegistry;
use crate::catalog::Catalog;
use crate::channel::{ChannelEpochs, ChannelInternal, LogChannel};
use crate::config::DatastoreConfig;
use crate::error::{DatastoreError, LimestoneError};
use crate::manifest::{self, DirectoryLock};
use crate::model::BlobId;
use crate::parser::{self, RepairPolicy, ScanMode};
use crate::replica::ReplicaHandle;

use self::epoch::EpochCoordinator;
use self::recovery::{RecoveryResult, Snapshot, SnapshotValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatastoreState {
    NotReady,
    Ready,
    Shutdown,
}

struct ChannelRegistration {
    epochs: Arc<ChannelEpochs>,
}

/// Shared state behind every [`Datastore`] handle. Channels hold an
/// `Arc<dyn ChannelInternal>` back to this struct rather than to
/// `Datastore` itself, so the internal interface is the only thing they
/// can call.
struct DatastoreInner {
    config: DatastoreConfig,
    _lock: DirectoryLock,
    state: Mutex<DatastoreState>,
    epoch_coord: EpochCoordinator,
    channels: Mutex<Vec<ChannelRegistration>>,
    files: Mutex<HashSet<String>>,
    catalog: Mutex<Catalog>,
    snapshot: RwLock<Snapshot>,
    persistent_callback: Mutex<Option<Box<dyn Fn(u64) + Send>>>,
    replica: Option<Arc<ReplicaHandle>>,
    compaction_stop: AtomicBool,
    durable_epoch_cache: AtomicU64,
}

impl ChannelInternal for DatastoreInner {
    fn load_switched_epoch(&self) -> u64 {
        self.epoch_coord.epoch_id_switched.load(Ordering::SeqCst)
    }

    fn register_file(&self, name: &str) {
        self.files.lock().insert(name.to_string());
    }

    fn deregister_file(&self, name: &str) {
        self.files.lock().remove(name);
    }

    fn recompute_min_epoch(&self) {
        let channels = self.channels.lock();
        let open: Vec<u64> = channels.iter().filter_map(|c| c.epochs.current_epoch()).collect();
        let finished: Vec<u64> = channels.iter().map(|c| c.epochs.finished_epoch()).collect();
        drop(channels);

        if let Some(candidate) = self.epoch_coord.compute_candidate(&open, &finished) {
            if let Ok(Some(informed)) = self.epoch_coord.try_advance(candidate) {
                self.durable_epoch_cache.store(informed, Ordering::SeqCst);
                if let Some(replica) = &self.replica {
                    replica.notify_durable_epoch(informed);
                }
                if let Some(callback) = self.persistent_callback.lock().as_ref() {
                    callback(informed);
                }
            }
        }
    }

    fn replica(&self) -> Option<Arc<ReplicaHandle>> {
        self.replica.clone()
    }

    fn replica_ordering(&self) -> crate::config::ReplicaOrdering {
        self.config.replica_ordering
    }

    fn register_blobs(&self, blob_ids: &[BlobId]) {
        self.config.blob_registry.register(blob_ids);
    }
}

/// Public handle to an open log directory.
pub struct Datastore {
    inner: Arc<DatastoreInner>,
    compaction_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Datastore {
    /// Open `config.directory`, validating/creating the manifest and
    /// taking the exclusive directory lock. Does not yet run recovery;
    /// call [`Datastore::ready`] after registering channels.
    pub fn open(config: DatastoreConfig) -> Result<Self, LimestoneError> {
        config.validate().map_err(|e| {
            DatastoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
        })?;
        let (lock, _manifest, needs_rotation) = manifest::open_directory(&config.directory)?;
        let catalog = Catalog::load_or_default(&config.directory)?;

        let epoch_coord = EpochCoordinator::open(&config.directory, config.epoch_file_rewrite_threshold, catalog.max_epoch_id)?;

        if config.replica.is_none() && std::env::var_os("LIMESTONE_REPLICA_ENDPOINT").is_some() {
            tracing::warn!(
                target: "limestone::replica",
                "LIMESTONE_REPLICA_ENDPOINT is set but no replica sink was configured; \
                 replication stays disabled (construct a sink and pass it via DatastoreConfig::with_replica)"
            );
        }
        let replica = config.replica.clone();

        let inner = Arc::new(DatastoreInner {
            config,
            _lock: lock,
            state: Mutex::new(DatastoreState::NotReady),
            epoch_coord,
            channels: Mutex::new(Vec::new()),
            files: Mutex::new(HashSet::new()),
            catalog: Mutex::new(catalog),
            snapshot: RwLock::new(Snapshot::default()),
            persistent_callback: Mutex::new(None),
            replica,
            compaction_stop: AtomicBool::new(false),
            durable_epoch_cache: AtomicU64::new(0),
        });

        if needs_rotation {
            tracing::info!(target: "limestone::datastore", "manifest requires rotation, will rotate on ready()");
        }

        Ok(Datastore { inner, compaction_thread: Mutex::new(None) })
    }

    /// Create a new channel; only valid before [`Datastore::ready`].
    pub fn create_channel(&self) -> Result<LogChannel, DatastoreError> {
        let state = self.inner.state.lock();
        if *state != DatastoreState::NotReady {
            return Err(DatastoreError::AlreadyReady);
        }
        drop(state);

        let mut channels = self.inner.channels.lock();
        let id = channels.len() as u32;
        let internal: Arc<dyn ChannelInternal> = Arc::clone(&self.inner) as Arc<dyn ChannelInternal>;
        let channel = LogChannel::new(id, self.inner.config.directory.clone(), internal);
        channels.push(ChannelRegistration { epochs: channel.epochs() });
        Ok(channel)
    }

    /// Register the persistence callback; only valid before `ready()`.
    pub fn add_persistent_callback(&self, callback: impl Fn(u64) + Send + 'static) -> Result<(), DatastoreError> {
        let state = self.inner.state.lock();
        if *state != DatastoreState::NotReady {
            return Err(DatastoreError::AlreadyReady);
        }
        *self.inner.persistent_callback.lock() = Some(Box::new(callback));
        Ok(())
    }

    /// Run startup recovery and start the background compaction worker.
    pub fn ready(self) -> Result<Self, LimestoneError> {
        {
            let mut state = self.inner.state.lock();
            if *state != DatastoreState::NotReady {
                return Err(DatastoreError::AlreadyReady.into());
            }
            *state = DatastoreState::Ready;
        }

        let catalog = self.inner.catalog.lock().clone();
        let RecoveryResult { snapshot, durable_epoch } =
            recovery::recover(&self.inner.config.directory, &catalog, self.inner.config.blob_registry.as_ref())?;
        *self.inner.snapshot.write() = snapshot;
        self.inner.durable_epoch_cache.store(durable_epoch, Ordering::SeqCst);
        self.inner.epoch_coord.switch_epoch(durable_epoch.max(1));

        let ctrl_dir = self.inner.config.directory.join("ctrl");
        std::fs::create_dir_all(&ctrl_dir)?;

        let inner = Arc::clone(&self.inner);
        let poll_interval = self.inner.config.compaction_poll_interval;
        let handle = std::thread::spawn(move || {
            compaction_worker_loop(inner, poll_interval);
        });
        *self.compaction_thread.lock() = Some(handle);

        Ok(self)
    }

    pub fn switch_epoch(&self, new_epoch: u64) {
        self.inner.epoch_coord.switch_epoch(new_epoch);
        self.inner.recompute_min_epoch();
    }

    pub fn durable_epoch(&self) -> u64 {
        self.inner.durable_epoch_cache.load(Ordering::SeqCst)
    }

    pub fn snapshot_get(&self, storage: u64, key: &[u8]) -> Option<SnapshotValue> {
        self.inner.snapshot.read().get(storage, key).cloned()
    }

    pub fn snapshot_len(&self) -> usize {
        self.inner.snapshot.read().len()
    }

    /// Cursor over the last recovered snapshot, held under a read lock
    /// for the cursor's lifetime. Entries come back in `(storage, key)`
    /// order, matching [`Snapshot::iter`].
    pub fn snapshot(&self) -> SnapshotCursor<'_> {
        SnapshotCursor { guard: self.inner.snapshot.read() }
    }

    /// Rotate every registered attached file, waiting until no in-flight
    /// session belongs to the epoch being rotated.
    pub fn rotate_log_files(&self, channels: &mut [LogChannel]) -> Result<Vec<String>, DatastoreError> {
        let _rotate_guard = self.inner.epoch_coord.rotate_mutex.lock();
        let switched = self.inner.epoch_coord.epoch_id_switched.load(Ordering::SeqCst);
        self.inner.epoch_coord.wait_until_informed_reaches(switched);

        let mut rotated = Vec::new();
        for channel in channels.iter_mut() {
            if let Some(name) = channel.rotate()? {
                rotated.push(name);
            }
        }
        Ok(rotated)
    }

    /// Rotate every channel and build a manifest of the files an
    /// external copier should take for a backup. `btype` does not
    /// currently change file selection: every file this crate writes is
    /// already a log file, so a transaction-only backup and a standard
    /// one cover the same set.
    pub fn begin_backup(
        &self,
        btype: crate::backup::BackupKind,
        channels: &mut [LogChannel],
    ) -> Result<crate::backup::BackupManifest, LimestoneError> {
        self.rotate_log_files(channels)?;
        let switched = self.inner.epoch_coord.epoch_id_switched.load(Ordering::SeqCst);
        Ok(crate::backup::build_manifest(&self.inner.config.directory, btype, switched)?)
    }

    /// Current set of detached (non-attached) WAL filenames on disk.
    pub fn detached_filenames(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.inner.config.directory)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("pwal_") && !name.contains(".compacted") && !parser::is_attached_filename(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.inner.config.directory
    }

    /// Run one compaction pass immediately (used by the offline CLI
    /// path and directly by tests); does not touch the worker thread.
    pub fn run_compaction_pass_now(&self) -> Result<Option<compaction::CompactionReport>, LimestoneError> {
        run_one_pass(&self.inner)
    }

    pub fn shutdown(self) -> Shutdown {
        *self.inner.state.lock() = DatastoreState::Shutdown;
        self.inner.compaction_stop.store(true, Ordering::SeqCst);
        let handle = self.compaction_thread.lock().take();
        Shutdown { handle }
    }
}

fn run_one_pass(inner: &Arc<DatastoreInner>) -> Result<Option<compaction::CompactionReport>, LimestoneError> {
    let rotated = {
        let dir = &inner.config.directory;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("pwal_") && !name.contains(".compacted") && !parser::is_attached_filename(&name) {
                names.push(name);
            }
        }
        names
    };

    let catalog = inner.catalog.lock().clone();
    let durable_epoch = inner.durable_epoch_cache.load(Ordering::SeqCst);
    match compaction::run_pass(&inner.config.directory, &catalog, &rotated, durable_epoch)? {
        Some((new_catalog, report)) => {
            new_catalog.save(&inner.config.directory)?;
            *inner.catalog.lock() = new_catalog;
            Ok(Some(report))
        }
        None => Ok(None),
    }
}

fn compaction_worker_loop(inner: Arc<DatastoreInner>, poll_interval: std::time::Duration) {
    let trigger_path = inner.config.directory.join("ctrl").join("start_compaction");
    while !inner.compaction_stop.load(Ordering::SeqCst) {
        std::thread::sleep(poll_interval);
        if inner.compaction_stop.load(Ordering::SeqCst) {
            break;
        }
        if !trigger_path.exists() {
            continue;
        }
        let _ = std::fs::remove_file(&trigger_path);
        match run_one_pass(&inner) {
            Ok(Some(report)) => {
                tracing::info!(
                    target: "limestone::compaction",
                    keys_written = report.keys_written,
                    "online compaction pass completed"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(target: "limestone::compaction", error = %e, "online compaction pass failed");
            }
        }
    }
}

/// A read-locked view of the recovered snapshot. Dropping it releases
/// the lock; it does not observe writes made after it was taken.
pub struct SnapshotCursor<'a> {
    guard: RwLockReadGuard<'a, Snapshot>,
}

impl<'a> SnapshotCursor<'a> {
    pub fn get(&self, storage: u64, key: &[u8]) -> Option<&SnapshotValue> {
        self.guard.get(storage, key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(u64, Vec<u8>), &SnapshotValue)> {
        self.guard.iter()
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

/// Join handle for a completed shutdown.
pub struct Shutdown {
    handle: Option<JoinHandle<()>>,
}

impl Shutdown {
    pub fn wait(self) {
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}
