//! Log entry encoding
//!
//! ```text
//! [length: u32][type: u8][payload: bincode][crc32: u32]
//! ```
//!
//! - length covers type + payload + crc (not itself)
//! - the type tag makes entries self-describing and skippable
//! - CRC32 over type + payload catches bit flips and partial writes
//!
//! A buffer too short for a whole entry is reported as
//! [`Error::IncompleteEntry`], which replay treats as the torn tail of the
//! last write; a bad CRC or malformed length is [`Error::Corruption`].

use crate::entry::LogEntry;
use crc32fast::Hasher;
use mqstore_core::{Error, Result};

const TYPE_BEGIN_TXN: u8 = 1;
const TYPE_PUT: u8 = 2;
const TYPE_UPDATE: u8 = 3;
const TYPE_UPDATE_META: u8 = 4;
const TYPE_REMOVE: u8 = 5;
const TYPE_PREPARED: u8 = 6;
const TYPE_COMMIT_TXN: u8 = 7;
const TYPE_ABORT_TXN: u8 = 8;
const TYPE_CHECKPOINT: u8 = 9;

fn type_tag(entry: &LogEntry) -> u8 {
    match entry {
        LogEntry::BeginTxn { .. } => TYPE_BEGIN_TXN,
        LogEntry::Put { .. } => TYPE_PUT,
        LogEntry::Update { .. } => TYPE_UPDATE,
        LogEntry::UpdateMeta { .. } => TYPE_UPDATE_META,
        LogEntry::Remove { .. } => TYPE_REMOVE,
        LogEntry::Prepared { .. } => TYPE_PREPARED,
        LogEntry::CommitTxn { .. } => TYPE_COMMIT_TXN,
        LogEntry::AbortTxn { .. } => TYPE_ABORT_TXN,
        LogEntry::Checkpoint { .. } => TYPE_CHECKPOINT,
    }
}

/// Encode a log entry into its framed byte form
pub fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    let tag = type_tag(entry);
    let payload = bincode::serialize(entry)?;

    // type(1) + payload + crc(4)
    let total_len = 1 + payload.len() + 4;

    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(tag);
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(buf)
}

/// Decode one framed entry from the front of `buf`
///
/// Returns the entry and the number of bytes consumed. `offset` is the file
/// position of `buf[0]`, carried into error messages so corruption can be
/// located without re-deriving state.
pub fn decode_entry(buf: &[u8], offset: u64) -> Result<(LogEntry, usize)> {
    if buf.len() < 4 {
        return Err(Error::IncompleteEntry {
            offset,
            have: buf.len(),
            needed: 4,
        });
    }
    let total_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    // Minimum valid entry: type(1) + crc(4). Guard before any arithmetic.
    if total_len < 5 {
        return Err(Error::Corruption(format!(
            "offset {}: invalid entry length {} (minimum is 5)",
            offset, total_len
        )));
    }

    if buf.len() < 4 + total_len {
        return Err(Error::IncompleteEntry {
            offset,
            have: buf.len(),
            needed: 4 + total_len,
        });
    }

    let tag = buf[4];
    let payload = &buf[5..4 + total_len - 4];
    let crc_start = 4 + total_len - 4;
    let expected_crc = u32::from_le_bytes([
        buf[crc_start],
        buf[crc_start + 1],
        buf[crc_start + 2],
        buf[crc_start + 3],
    ]);

    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(payload);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(Error::Corruption(format!(
            "offset {}: CRC mismatch: expected {:08x}, got {:08x}",
            offset, expected_crc, actual_crc
        )));
    }

    let entry: LogEntry = bincode::deserialize(payload).map_err(|e| {
        Error::Corruption(format!("offset {}: entry deserialization failed: {}", offset, e))
    })?;

    if tag != type_tag(&entry) {
        return Err(Error::Corruption(format!(
            "offset {}: type tag mismatch: expected {}, got {}",
            offset,
            type_tag(&entry),
            tag
        )));
    }

    Ok((entry, 4 + total_len))
}
