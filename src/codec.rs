//! Binary layout of a single log record.
//!
//! Little-endian, self-delimiting at record granularity. No checksum
//! field; unknown tags and truncation are the parser's job.

use std::convert::TryInto;

use crate::model::{LogEntry, WriteVersion};

pub const TAG_NORMAL_ENTRY: u8 = 1;
pub const TAG_MARKER_BEGIN: u8 = 2;
pub const TAG_MARKER_END: u8 = 3;
pub const TAG_MARKER_DURABLE: u8 = 4;
pub const TAG_REMOVE_ENTRY: u8 = 5;
pub const TAG_MARKER_INVALIDATED_BEGIN: u8 = 6;
pub const TAG_CLEAR_STORAGE: u8 = 7;
pub const TAG_ADD_STORAGE: u8 = 8;
pub const TAG_REMOVE_STORAGE: u8 = 9;
pub const TAG_NORMAL_WITH_BLOB: u8 = 10;

/// Outcome of decoding one record from a byte buffer.
#[derive(Debug)]
pub enum Decoded<'a> {
    /// A full record was decoded; `rest` is the remaining buffer.
    Ok { entry: LogEntry, rest: &'a [u8] },
    /// The buffer ended in the middle of a record.
    ShortEntry,
    /// The leading tag byte is not one of the known record types.
    UnknownType(u8),
}

fn read_u8(buf: &[u8]) -> Option<(u8, &[u8])> {
    if buf.is_empty() {
        return None;
    }
    Some((buf[0], &buf[1..]))
}

fn read_u32(buf: &[u8]) -> Option<(u32, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let (head, rest) = buf.split_at(4);
    Some((u32::from_le_bytes(head.try_into().unwrap()), rest))
}

fn read_u64(buf: &[u8]) -> Option<(u64, &[u8])> {
    if buf.len() < 8 {
        return None;
    }
    let (head, rest) = buf.split_at(8);
    Some((u64::from_le_bytes(head.try_into().unwrap()), rest))
}

fn read_bytes(buf: &[u8], len: usize) -> Option<(&[u8], &[u8])> {
    if buf.len() < len {
        return None;
    }
    Some(buf.split_at(len))
}

/// Decode a single record from the front of `buf`.
///
/// Never panics on truncated input: any field that would read past the
/// end of `buf` yields [`Decoded::ShortEntry`].
pub fn decode_one(buf: &[u8]) -> Decoded<'_> {
    let Some((tag, rest)) = read_u8(buf) else {
        return Decoded::ShortEntry;
    };

    macro_rules! need {
        ($opt:expr) => {
            match $opt {
                Some(v) => v,
                None => return Decoded::ShortEntry,
            }
        };
    }

    match tag {
        TAG_MARKER_BEGIN | TAG_MARKER_END | TAG_MARKER_DURABLE | TAG_MARKER_INVALIDATED_BEGIN => {
            let (epoch, rest) = need!(read_u64(rest));
            let entry = match tag {
                TAG_MARKER_BEGIN => LogEntry::MarkerBegin { epoch },
                TAG_MARKER_END => LogEntry::MarkerEnd { epoch },
                TAG_MARKER_DURABLE => LogEntry::MarkerDurable { epoch },
                TAG_MARKER_INVALIDATED_BEGIN => LogEntry::MarkerInvalidatedBegin { epoch },
                _ => unreachable!(),
            };
            Decoded::Ok { entry, rest }
        }
        TAG_NORMAL_ENTRY | TAG_NORMAL_WITH_BLOB => {
            let (key_len, rest) = need!(read_u32(rest));
            let (value_len, rest) = need!(read_u32(rest));
            let (storage, rest) = need!(read_u64(rest));
            let (key, rest) = need!(read_bytes(rest, key_len as usize));
            let (epoch, rest) = need!(read_u64(rest));
            let (minor, rest) = need!(read_u64(rest));
            let (value, rest) = need!(read_bytes(rest, value_len as usize));
            let write_version = WriteVersion::new(epoch, minor);
            if tag == TAG_NORMAL_ENTRY {
                Decoded::Ok {
                    entry: LogEntry::NormalEntry {
                        storage,
                        key: key.to_vec(),
                        value: value.to_vec(),
                        write_version,
                    },
                    rest,
                }
            } else {
                let (blob_count, rest) = need!(read_u32(rest));
                let mut blob_ids = Vec::with_capacity(blob_count as usize);
                let mut rest = rest;
                for _ in 0..blob_count {
                    let (id, r) = need!(read_u64(rest));
                    blob_ids.push(id);
                    rest = r;
                }
                Decoded::Ok {
                    entry: LogEntry::NormalWithBlob {
                        storage,
                        key: key.to_vec(),
                        value: value.to_vec(),
                        write_version,
                        blob_ids,
                    },
                    rest,
                }
            }
        }
        TAG_REMOVE_ENTRY => {
            let (key_len, rest) = need!(read_u32(rest));
            let (storage, rest) = need!(read_u64(rest));
            let (key, rest) = need!(read_bytes(rest, key_len as usize));
            let (epoch, rest) = need!(read_u64(rest));
            let (minor, rest) = need!(read_u64(rest));
            Decoded::Ok {
                entry: LogEntry::RemoveEntry {
                    storage,
                    key: key.to_vec(),
                    write_version: WriteVersion::new(epoch, minor),
                },
                rest,
            }
        }
        TAG_CLEAR_STORAGE | TAG_ADD_STORAGE | TAG_REMOVE_STORAGE => {
            let (storage, rest) = need!(read_u64(rest));
            let (epoch, rest) = need!(read_u64(rest));
            let (minor, rest) = need!(read_u64(rest));
            let write_version = WriteVersion::new(epoch, minor);
            let entry = match tag {
                TAG_CLEAR_STORAGE => LogEntry::ClearStorage { storage, write_version },
                TAG_ADD_STORAGE => LogEntry::AddStorage { storage, write_version },
                TAG_REMOVE_STORAGE => LogEntry::RemoveStorage { storage, write_version },
                _ => unreachable!(),
            };
            Decoded::Ok { entry, rest }
        }
        other => Decoded::UnknownType(other),
    }
}

/// Encode one record, appending to `out`.
pub fn encode_one(entry: &LogEntry, out: &mut Vec<u8>) {
    match entry {
        LogEntry::MarkerBegin { epoch } => {
            out.push(TAG_MARKER_BEGIN);
            out.extend_from_slice(&epoch.to_le_bytes());
        }
        LogEntry::MarkerEnd { epoch } => {
            out.push(TAG_MARKER_END);
            out.extend_from_slice(&epoch.to_le_bytes());
        }
        LogEntry::MarkerDurable { epoch } => {
            out.push(TAG_MARKER_DURABLE);
            out.extend_from_slice(&epoch.to_le_bytes());
        }
        LogEntry::MarkerInvalidatedBegin { epoch } => {
            out.push(TAG_MARKER_INVALIDATED_BEGIN);
            out.extend_from_slice(&epoch.to_le_bytes());
        }
        LogEntry::NormalEntry {
            storage,
            key,
            value,
            write_version,
        } => {
            out.push(TAG_NORMAL_ENTRY);
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(&storage.to_le_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(&write_version.major.to_le_bytes());
            out.extend_from_slice(&write_version.minor.to_le_bytes());
            out.extend_from_slice(value);
        }
        LogEntry::NormalWithBlob {
            storage,
            key,
            value,
            write_version,
            blob_ids,
        } => {
            out.push(TAG_NORMAL_WITH_BLOB);
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(&storage.to_le_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(&write_version.major.to_le_bytes());
            out.extend_from_slice(&write_version.minor.to_le_bytes());
            out.extend_from_slice(value);
            out.extend_from_slice(&(blob_ids.len() as u32).to_le_bytes());
            for id in blob_ids {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
        LogEntry::RemoveEntry {
            storage,
            key,
            write_version,
        } => {
            out.push(TAG_REMOVE_ENTRY);
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(&storage.to_le_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(&write_version.major.to_le_bytes());
            out.extend_from_slice(&write_version.minor.to_le_bytes());
        }
        LogEntry::ClearStorage { storage, write_version }
        | LogEntry::AddStorage { storage, write_version }
        | LogEntry::RemoveStorage { storage, write_version } => {
            let tag = match entry {
                LogEntry::ClearStorage { .. } => TAG_CLEAR_STORAGE,
                LogEntry::AddStorage { .. } => TAG_ADD_STORAGE,
                LogEntry::RemoveStorage { .. } => TAG_REMOVE_STORAGE,
                _ => unreachable!(),
            };
            out.push(tag);
            out.extend_from_slice(&storage.to_le_bytes());
            out.extend_from_slice(&write_version.major.to_le_bytes());
            out.extend_from_slice(&write_version.minor.to_le_bytes());
        }
    }
}

/// Byte offset of the tag within an encoded `marker_begin`/`marker_invalidated_begin`
/// record; used by the parser's mark-repair to flip the tag byte in place.
pub const MARKER_TAG_OFFSET: usize = 0;
