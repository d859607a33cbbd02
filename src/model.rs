//! Core value types shared by every component: storage ids, blob ids,
//! write versions and the tagged log entry itself.

use std::cmp::Ordering;

/// 64-bit tag of a logical table.
pub type StorageId = u64;

/// Reference to an externally stored blob.
pub type BlobId = u64;

/// Top bit of [`WriteVersion::minor`] distinguishing short transactions
/// from long-running ones. Long transactions sort after short ones that
/// share the same epoch when minors would otherwise tie on the low bits.
const LONG_TX_BIT: u64 = 1 << 63;

/// Ordered pair `(major, minor)` attached to every data mutation.
///
/// `major` is the epoch at which the write was created. `minor` encodes
/// transaction order within the epoch; its top bit distinguishes short
/// transactions (`0`) from long transactions (`1`). The total order is
/// lexicographic on `(major, minor)`, matching the comparator in the
/// original `write_version_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteVersion {
    pub major: u64,
    pub minor: u64,
}

impl WriteVersion {
    pub const ZERO: WriteVersion = WriteVersion { major: 0, minor: 0 };

    pub fn new(major: u64, minor: u64) -> Self {
        WriteVersion { major, minor }
    }

    /// Build a minor value for a short transaction ordered at `order`.
    pub fn short_tx_minor(order: u64) -> u64 {
        order & !LONG_TX_BIT
    }

    /// Build a minor value for a long transaction ordered at `order`.
    pub fn long_tx_minor(order: u64) -> u64 {
        (order & !LONG_TX_BIT) | LONG_TX_BIT
    }

    pub fn is_long_tx(&self) -> bool {
        self.minor & LONG_TX_BIT != 0
    }
}

impl PartialOrd for WriteVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WriteVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

/// Tagged variant stored in every WAL file.
///
/// See the codec module for the exact wire representation of each
/// variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    NormalEntry {
        storage: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
    },
    NormalWithBlob {
        storage: StorageId,
        key: Vec<u8>,
        value: Vec<u8>,
        write_version: WriteVersion,
        blob_ids: Vec<BlobId>,
    },
    RemoveEntry {
        storage: StorageId,
        key: Vec<u8>,
        write_version: WriteVersion,
    },
    ClearStorage {
        storage: StorageId,
        write_version: WriteVersion,
    },
    AddStorage {
        storage: StorageId,
        write_version: WriteVersion,
    },
    RemoveStorage {
        storage: StorageId,
        write_version: WriteVersion,
    },
    MarkerBegin {
        epoch: u64,
    },
    MarkerEnd {
        epoch: u64,
    },
    MarkerDurable {
        epoch: u64,
    },
    MarkerInvalidatedBegin {
        epoch: u64,
    },
}

impl LogEntry {
    /// Storage/key prefix used by the container sort; markers have none.
    pub fn storage_key(&self) -> Option<(StorageId, &[u8])> {
        match self {
            LogEntry::NormalEntry { storage, key, .. }
            | LogEntry::NormalWithBlob { storage, key, .. }
            | LogEntry::RemoveEntry { storage, key, .. } => Some((*storage, key.as_slice())),
            _ => None,
        }
    }

    pub fn write_version(&self) -> Option<WriteVersion> {
        match self {
            LogEntry::NormalEntry { write_version, .. }
            | LogEntry::NormalWithBlob { write_version, .. }
            | LogEntry::RemoveEntry { write_version, .. }
            | LogEntry::ClearStorage { write_version, .. }
            | LogEntry::AddStorage { write_version, .. }
            | LogEntry::RemoveStorage { write_version, .. } => Some(*write_version),
            _ => None,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            LogEntry::MarkerBegin { .. }
                | LogEntry::MarkerEnd { .. }
                | LogEntry::MarkerDurable { .. }
                | LogEntry::MarkerInvalidatedBegin { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_version_orders_lexicographically() {
        assert!(WriteVersion::new(1, 0) < WriteVersion::new(1, 1));
        assert!(WriteVersion::new(1, 5) < WriteVersion::new(2, 0));
        assert_eq!(WriteVersion::new(3, 3), WriteVersion::new(3, 3));
    }

    #[test]
    fn long_tx_bit_roundtrips() {
        let minor = WriteVersion::long_tx_minor(7);
        let wv = WriteVersion::new(1, minor);
        assert!(wv.is_long_tx());
        let minor = WriteVersion::short_tx_minor(7);
        let wv = WriteVersion::new(1, minor);
        assert!(!wv.is_long_tx());
    }
}
