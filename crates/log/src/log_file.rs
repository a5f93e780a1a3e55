//! Append-only log file
//!
//! One log file per object manager instance. Appends go through a buffered
//! writer behind a mutex; commit and prepare markers are always fsynced by
//! the caller before the transaction is reported durable.
//!
//! The file carries a hard size cap. An append that would cross it fails
//! with `PersistenceFull` before any bytes are written, so the owning
//! transaction can be rolled back with nothing to undo.

use crate::encoding::{decode_entry, encode_entry};
use crate::entry::LogEntry;
use mqstore_core::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// How to treat pre-existing log content at open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Recover from existing content
    Warm,
    /// Discard any prior content (re-initialization and tests)
    Clear,
}

/// The write-ahead log file
pub struct LogFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    current_offset: AtomicU64,
    max_bytes: u64,
}

impl LogFile {
    /// Open or create the log at `path`
    ///
    /// Returns the log and whether pre-existing content was found (a warm
    /// start). `Clear` mode truncates first and always reports cold.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode, max_bytes: u64) -> Result<(Self, bool)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if mode == OpenMode::Clear && path.exists() {
            std::fs::remove_file(&path)?;
            info!(path = %path.display(), "cleared prior log content");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let warm = len > 0;
        debug!(path = %path.display(), bytes = len, warm, "log opened");

        Ok((
            LogFile {
                path,
                writer: Mutex::new(BufWriter::new(file)),
                current_offset: AtomicU64::new(len),
                max_bytes,
            },
            warm,
        ))
    }

    /// Append one entry, enforcing the size cap
    ///
    /// Returns the offset the entry was written at. The entry is buffered;
    /// call [`LogFile::fsync`] to make it durable.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        let encoded = encode_entry(entry)?;

        let mut writer = self.writer.lock();
        let offset = self.current_offset.load(Ordering::SeqCst);
        if offset + encoded.len() as u64 > self.max_bytes {
            return Err(Error::PersistenceFull {
                store: "log".to_string(),
                requested: encoded.len() as u64,
                limit: self.max_bytes,
            });
        }

        writer.write_all(&encoded)?;
        self.current_offset
            .fetch_add(encoded.len() as u64, Ordering::SeqCst);
        Ok(offset)
    }

    /// Append a decision marker, exempt from the size cap
    ///
    /// Commit and abort markers are a few dozen bytes and must always be
    /// writable: a prepared transaction's commit may not fail for capacity,
    /// and a rollback must be recordable in exactly the full-log situation
    /// that caused it.
    pub fn append_marker(&self, entry: &LogEntry) -> Result<u64> {
        let encoded = encode_entry(entry)?;
        let mut writer = self.writer.lock();
        let offset = self.current_offset.load(Ordering::SeqCst);
        writer.write_all(&encoded)?;
        self.current_offset
            .fetch_add(encoded.len() as u64, Ordering::SeqCst);
        Ok(offset)
    }

    /// Atomically replace the log's contents with `entries`
    ///
    /// Checkpointing reclaims log space through this: everything the store
    /// snapshots capture is rewritten away, leaving only what the caller
    /// carries forward. The replacement is built beside the live file and
    /// renamed into place, so a crash leaves the old log or the new one,
    /// never a mix. Callers hold the commit path quiesced.
    pub fn rewrite(&self, entries: &[LogEntry]) -> Result<u64> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let mut bytes = Vec::new();
        for entry in entries {
            bytes.extend_from_slice(&encode_entry(entry)?);
        }

        let tmp = self.path.with_extension("rewrite");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        // The old handle still points at the replaced inode
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        *writer = BufWriter::new(file);
        self.current_offset
            .store(bytes.len() as u64, Ordering::SeqCst);
        info!(
            bytes = bytes.len(),
            entries = entries.len(),
            "log rewritten"
        );
        Ok(bytes.len() as u64)
    }

    /// Flush buffered writes to the OS
    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }

    /// Flush and force the file to disk
    ///
    /// The durability point for commit and prepare markers.
    pub fn fsync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_mut().sync_all()?;
        Ok(())
    }

    /// Read every whole entry in the file
    ///
    /// A truncated entry at the tail (torn final write) ends the scan
    /// cleanly; mid-file corruption is an error.
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        {
            let mut writer = self.writer.lock();
            writer.flush()?;
        }

        let mut file = File::open(&self.path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            match decode_entry(&buf[offset..], offset as u64) {
                Ok((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                Err(Error::IncompleteEntry { .. }) => {
                    // Torn tail from a crash mid-append; everything durable
                    // precedes it.
                    debug!(
                        offset,
                        trailing = buf.len() - offset,
                        "ignoring incomplete entry at log tail"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    /// Current file size (offset of the next append)
    pub fn size(&self) -> u64 {
        self.current_offset.load(Ordering::SeqCst)
    }

    /// Configured size cap in bytes
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        let _ = self.fsync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::now;
    use mqstore_core::TxnId;
    use tempfile::TempDir;

    fn begin(txn: u64) -> LogEntry {
        LogEntry::BeginTxn {
            txn: TxnId::new(txn),
            timestamp: now(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let (log, warm) = LogFile::open(dir.path().join("a.log"), OpenMode::Warm, 1024).unwrap();
        assert!(!warm);

        log.append(&begin(1)).unwrap();
        log.append(&LogEntry::CommitTxn { txn: TxnId::new(1) }).unwrap();
        log.fsync().unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], LogEntry::CommitTxn { txn: TxnId::new(1) });
    }

    #[test]
    fn test_warm_reopen_preserves_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");

        {
            let (log, _) = LogFile::open(&path, OpenMode::Warm, 1024).unwrap();
            log.append(&begin(1)).unwrap();
            log.fsync().unwrap();
        }

        let (log, warm) = LogFile::open(&path, OpenMode::Warm, 1024).unwrap();
        assert!(warm);
        assert_eq!(log.read_all().unwrap().len(), 1);

        // Appends continue after the existing content
        log.append(&begin(2)).unwrap();
        log.fsync().unwrap();
        assert_eq!(log.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_clear_open_discards() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");

        {
            let (log, _) = LogFile::open(&path, OpenMode::Warm, 1024).unwrap();
            log.append(&begin(1)).unwrap();
            log.fsync().unwrap();
        }

        let (log, warm) = LogFile::open(&path, OpenMode::Clear, 1024).unwrap();
        assert!(!warm);
        assert_eq!(log.size(), 0);
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_size_cap_refuses_append() {
        let dir = TempDir::new().unwrap();
        let (log, _) = LogFile::open(dir.path().join("a.log"), OpenMode::Warm, 64).unwrap();

        // Fill up to the cap, then expect refusal with nothing written
        let mut appended = 0;
        loop {
            match log.append(&begin(appended)) {
                Ok(_) => appended += 1,
                Err(Error::PersistenceFull { store, limit, .. }) => {
                    assert_eq!(store, "log");
                    assert_eq!(limit, 64);
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert!(appended < 100, "cap never enforced");
        }

        let size_after_refusal = log.size();
        log.fsync().unwrap();
        assert_eq!(log.read_all().unwrap().len() as u64, appended);
        assert_eq!(log.size(), size_after_refusal);
    }

    #[test]
    fn test_rewrite_reclaims_space() {
        let dir = TempDir::new().unwrap();
        let (log, _) = LogFile::open(dir.path().join("a.log"), OpenMode::Warm, 256).unwrap();

        // Fill until the cap refuses further appends
        let mut txn = 1;
        while log.append(&begin(txn)).is_ok() {
            txn += 1;
        }
        let full_size = log.size();

        // Rewriting with one carried entry frees the rest
        let carried = begin(txn);
        log.rewrite(&[carried.clone()]).unwrap();
        assert!(log.size() < full_size);
        let entries = log.read_all().unwrap();
        assert_eq!(entries, vec![carried]);

        // Appends fit again and land after the carried entry
        log.append(&begin(txn + 1)).unwrap();
        log.fsync().unwrap();
        assert_eq!(log.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_torn_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");

        {
            let (log, _) = LogFile::open(&path, OpenMode::Warm, 1024).unwrap();
            log.append(&begin(1)).unwrap();
            log.append(&begin(2)).unwrap();
            log.fsync().unwrap();
        }

        // Chop bytes off the final entry
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let (log, _) = LogFile::open(&path, OpenMode::Warm, 1024).unwrap();
        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], begin(1));
    }

    #[test]
    fn test_mid_file_corruption_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");

        {
            let (log, _) = LogFile::open(&path, OpenMode::Warm, 1024).unwrap();
            log.append(&begin(1)).unwrap();
            log.append(&begin(2)).unwrap();
            log.fsync().unwrap();
        }

        // Flip a byte inside the first entry
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let (log, _) = LogFile::open(&path, OpenMode::Warm, 1024).unwrap();
        assert!(matches!(log.read_all(), Err(Error::Corruption(_))));
    }
}
