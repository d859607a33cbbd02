//! Best-effort forwarder for session/entry/epoch events.
//!
//! Sending is guarded by a per-handle mutex; if a send ever fails the
//! handle marks itself dead and all later sends become silent no-ops.
//! The primary write path never blocks waiting for a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Anything that can receive a serialized replica event. A real
/// implementation would be a network stream; tests use an in-memory
/// sink.
pub trait ReplicaSink: Send {
    fn send(&mut self, event: &ReplicaEvent) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    BeginSession { channel: u32, epoch: u64 },
    EndSession { channel: u32, epoch: u64 },
    Entry { channel: u32, description: String },
    DurableEpoch { epoch: u64 },
}

/// Owned by the datastore; optionally handed to every channel.
pub struct ReplicaHandle {
    sink: Mutex<Option<Box<dyn ReplicaSink>>>,
    dead: AtomicBool,
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle").field("dead", &self.is_dead()).finish()
    }
}

impl ReplicaHandle {
    pub fn new(sink: Box<dyn ReplicaSink>) -> Self {
        ReplicaHandle { sink: Mutex::new(Some(sink)), dead: AtomicBool::new(false) }
    }

    fn send(&self, event: ReplicaEvent) {
        if self.dead.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.sink.lock();
        if let Some(sink) = guard.as_mut() {
            if sink.send(&event).is_err() {
                tracing::warn!(target: "limestone::replica", "replica send failed, disabling forwarding");
                *guard = None;
                self.dead.store(true, Ordering::Relaxed);
            }
        }
    }

    pub fn notify_begin_session(&self, channel: u32, epoch: u64) {
        self.send(ReplicaEvent::BeginSession { channel, epoch });
    }

    pub fn notify_end_session(&self, channel: u32, epoch: u64) {
        self.send(ReplicaEvent::EndSession { channel, epoch });
    }

    pub fn notify_entry(&self, channel: u32, description: String) {
        self.send(ReplicaEvent::Entry { channel, description });
    }

    pub fn notify_durable_epoch(&self, epoch: u64) {
        self.send(ReplicaEvent::DurableEpoch { epoch });
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }
}
