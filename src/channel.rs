//! Per-writer session: append records to one WAL file, rotate on
//! demand, optionally forward to the replica control channel.
//!
//! Single-writer-per-channel by contract: callers never call two
//! methods on the same [`LogChannel`] concurrently, so the append path
//! needs no internal lock.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec;
use crate::config::ReplicaOrdering;
use crate::error::ChannelError;
use crate::model::{BlobId, LogEntry, StorageId, WriteVersion};
use crate::replica::ReplicaHandle;

/// Sentinel stored in [`ChannelEpochs::current`] meaning "no session open".
const NO_SESSION: u64 = u64::MAX;

/// Per-channel epoch bookkeeping, shared with the datastore's epoch
/// coordinator.
#[derive(Debug)]
pub struct ChannelEpochs {
    current: AtomicU64,
    finished: AtomicU64,
}

impl Default for ChannelEpochs {
    fn default() -> Self {
        ChannelEpochs { current: AtomicU64::new(NO_SESSION), finished: AtomicU64::new(0) }
    }
}

impl ChannelEpochs {
    pub fn current_epoch(&self) -> Option<u64> {
        match self.current.load(Ordering::SeqCst) {
            NO_SESSION => None,
            e => Some(e),
        }
    }

    pub fn finished_epoch(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    fn set_current(&self, epoch: u64) {
        self.current.store(epoch, Ordering::SeqCst);
    }

    fn clear_current(&self) {
        self.current.store(NO_SESSION, Ordering::SeqCst);
    }

    fn set_finished(&self, epoch: u64) {
        self.finished.store(epoch, Ordering::SeqCst);
    }
}

/// Private interface the datastore lends to every channel it creates.
/// Channels speak to this rather than the datastore's public surface,
/// replacing the friend-class coupling of the original design.
pub trait ChannelInternal: Send + Sync {
    /// Load `epoch_id_switched`, looping until a stable read is taken.
    fn load_switched_epoch(&self) -> u64;
    /// Register/deregister an attached or detached file under the
    /// datastore's tracked file set.
    fn register_file(&self, name: &str);
    fn deregister_file(&self, name: &str);
    /// Ask the datastore to recompute the minimum durable epoch; called
    /// after a session ends.
    fn recompute_min_epoch(&self);
    fn replica(&self) -> Option<Arc<ReplicaHandle>>;
    fn replica_ordering(&self) -> ReplicaOrdering;
    fn register_blobs(&self, blob_ids: &[BlobId]);
}

/// A single writer's handle onto one attached WAL file.
pub struct LogChannel {
    id: u32,
    dir: PathBuf,
    epochs: Arc<ChannelEpochs>,
    writer: Option<BufWriter<File>>,
    internal: Arc<dyn ChannelInternal>,
    attached_name: String,
}

impl LogChannel {
    pub fn new(id: u32, dir: PathBuf, internal: Arc<dyn ChannelInternal>) -> Self {
        let attached_name = format!("pwal_{id:04}");
        LogChannel {
            id,
            dir,
            epochs: Arc::new(ChannelEpochs::default()),
            writer: None,
            internal,
            attached_name,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn epochs(&self) -> Arc<ChannelEpochs> {
        Arc::clone(&self.epochs)
    }

    pub fn attached_path(&self) -> PathBuf {
        self.dir.join(&self.attached_name)
    }

    /// Open a session: loads the datastore's current epoch into this
    /// channel, guarding against the ABA where the datastore bumps the
    /// switched counter between the load and the store.
    pub fn begin_session(&mut self) -> Result<(), ChannelError> {
        if self.epochs.current_epoch().is_some() {
            return Err(ChannelError::SessionAlreadyOpen);
        }

        let epoch = loop {
            let observed = self.internal.load_switched_epoch();
            self.epochs.set_current(observed);
            if self.internal.load_switched_epoch() == observed {
                break observed;
            }
        };

        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.attached_path())?;
            self.writer = Some(BufWriter::new(file));
            self.internal.register_file(&self.attached_name);
        }

        self.write_entry(&LogEntry::MarkerBegin { epoch })?;
        if let Some(replica) = self.internal.replica() {
            replica.notify_begin_session(self.id, epoch);
        }
        Ok(())
    }

    fn write_entry(&mut self, entry: &LogEntry) -> Result<(), ChannelError> {
        let writer = self.writer.as_mut().ok_or(ChannelError::NoSessionOpen)?;
        let mut buf = Vec::new();
        codec::encode_one(entry, &mut buf);
        writer.write_all(&buf)?;
        Ok(())
    }

    fn notify_replica_entry(&self, description: String) {
        if let Some(replica) = self.internal.replica() {
            replica.notify_entry(self.id, description);
        }
    }

    pub fn add_entry(
        &mut self,
        storage: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
    ) -> Result<(), ChannelError> {
        self.require_session()?;
        let key_len = key.len();
        self.write_entry(&LogEntry::NormalEntry { storage, key, value, write_version })?;
        self.notify_replica_entry(format!("add_entry storage={storage} key_len={key_len} wv={write_version:?}"));
        Ok(())
    }

    pub fn add_entry_with_blobs(
        &mut self,
        storage: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
        blob_ids: Vec<BlobId>,
    ) -> Result<(), ChannelError> {
        self.require_session()?;
        self.internal.register_blobs(&blob_ids);
        let key_len = key.len();
        let blob_count = blob_ids.len();
        self.write_entry(&LogEntry::NormalWithBlob { storage, key, value, write_version, blob_ids })?;
        self.notify_replica_entry(format!(
            "add_entry_with_blobs storage={storage} key_len={key_len} wv={write_version:?} blob_count={blob_count}"
        ));
        Ok(())
    }

    pub fn remove_entry(
        &mut self,
        storage: StorageId,
        key: Vec<u8>,
        write_version: WriteVersion,
    ) -> Result<(), ChannelError> {
        self.require_session()?;
        let key_len = key.len();
        self.write_entry(&LogEntry::RemoveEntry { storage, key, write_version })?;
        self.notify_replica_entry(format!("remove_entry storage={storage} key_len={key_len} wv={write_version:?}"));
        Ok(())
    }

    pub fn add_storage(&mut self, storage: StorageId, write_version: WriteVersion) -> Result<(), ChannelError> {
        self.require_session()?;
        self.write_entry(&LogEntry::AddStorage { storage, write_version })?;
        self.notify_replica_entry(format!("add_storage storage={storage} wv={write_version:?}"));
        Ok(())
    }

    pub fn remove_storage(&mut self, storage: StorageId, write_version: WriteVersion) -> Result<(), ChannelError> {
        self.require_session()?;
        self.write_entry(&LogEntry::RemoveStorage { storage, write_version })?;
        self.notify_replica_entry(format!("remove_storage storage={storage} wv={write_version:?}"));
        Ok(())
    }

    pub fn truncate_storage(&mut self, storage: StorageId, write_version: WriteVersion) -> Result<(), ChannelError> {
        self.require_session()?;
        self.write_entry(&LogEntry::ClearStorage { storage, write_version })?;
        self.notify_replica_entry(format!("clear_storage storage={storage} wv={write_version:?}"));
        Ok(())
    }

    fn require_session(&self) -> Result<(), ChannelError> {
        if self.epochs.current_epoch().is_none() {
            return Err(ChannelError::NoSessionOpen);
        }
        Ok(())
    }

    /// Ends the session and, if a replica is configured, forwards the
    /// end/flush notification either before or after the local fsync
    /// depending on `ReplicaOrdering` (`§4.F`).
    pub fn end_session(&mut self) -> Result<(), ChannelError> {
        let epoch = self.epochs.current_epoch().ok_or(ChannelError::NoSessionOpen)?;
        self.write_entry(&LogEntry::MarkerEnd { epoch })?;

        let replica = self.internal.replica();
        let ordering = self.internal.replica_ordering();

        if ordering == ReplicaOrdering::AsyncClose {
            if let Some(replica) = &replica {
                replica.notify_end_session(self.id, epoch);
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        if ordering == ReplicaOrdering::SyncClose {
            if let Some(replica) = &replica {
                replica.notify_end_session(self.id, epoch);
            }
        }

        self.epochs.set_finished(epoch);
        self.epochs.clear_current();
        self.internal.recompute_min_epoch();
        Ok(())
    }

    /// Rename the attached file to a detached name; only valid between
    /// sessions.
    pub fn rotate(&mut self) -> Result<Option<String>, ChannelError> {
        if self.epochs.current_epoch().is_some() {
            return Err(ChannelError::RotateDuringSession);
        }
        if self.writer.is_none() {
            return Ok(None);
        }
        // drop the open handle before renaming.
        self.writer = None;

        let unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let epoch = self.epochs.finished_epoch();
        let new_name = format!("{}.{unix_ms}.{epoch}", self.attached_name);
        std::fs::rename(self.attached_path(), self.dir.join(&new_name))?;

        self.internal.deregister_file(&self.attached_name);
        self.internal.register_file(&new_name);
        Ok(Some(new_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct TestInternal {
        switched: AtomicU64,
        registered: Mutex<Vec<String>>,
        recompute_calls: AtomicU64,
    }

    impl ChannelInternal for TestInternal {
        fn load_switched_epoch(&self) -> u64 {
            self.switched.load(Ordering::SeqCst)
        }
        fn register_file(&self, name: &str) {
            self.registered.lock().unwrap().push(name.to_string());
        }
        fn deregister_file(&self, name: &str) {
            self.registered.lock().unwrap().retain(|n| n != name);
        }
        fn recompute_min_epoch(&self) {
            self.recompute_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn replica(&self) -> Option<Arc<ReplicaHandle>> {
            None
        }
        fn replica_ordering(&self) -> ReplicaOrdering {
            ReplicaOrdering::SyncClose
        }
        fn register_blobs(&self, _blob_ids: &[BlobId]) {}
    }

    #[test]
    fn session_lifecycle_writes_markers() {
        let dir = tempdir().unwrap();
        let internal: Arc<dyn ChannelInternal> = Arc::new(TestInternal {
            switched: AtomicU64::new(3),
            registered: Mutex::new(Vec::new()),
            recompute_calls: AtomicU64::new(0),
        });
        let mut channel = LogChannel::new(0, dir.path().to_path_buf(), internal);

        channel.begin_session().unwrap();
        assert_eq!(channel.epochs().current_epoch(), Some(3));
        channel
            .add_entry(1, b"k".to_vec(), b"v".to_vec(), WriteVersion::new(3, 0))
            .unwrap();
        channel.end_session().unwrap();
        assert_eq!(channel.epochs().current_epoch(), None);
        assert_eq!(channel.epochs().finished_epoch(), 3);

        let bytes = std::fs::read(channel.attached_path()).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn rotate_requires_no_open_session() {
        let dir = tempdir().unwrap();
        let internal: Arc<dyn ChannelInternal> = Arc::new(TestInternal {
            switched: AtomicU64::new(1),
            registered: Mutex::new(Vec::new()),
            recompute_calls: AtomicU64::new(0),
        });
        let mut channel = LogChannel::new(0, dir.path().to_path_buf(), internal);
        channel.begin_session().unwrap();
        assert!(matches!(channel.rotate(), Err(ChannelError::RotateDuringSession)));
        channel.end_session().unwrap();
        let rotated = channel.rotate().unwrap();
        assert!(rotated.is_some());
    }
}
