//! Append-only record journal
//!
//! Every store mutation is written as one atomic batch. A claim of N
//! records is a single batch, so after a crash either all of its records
//! are `used` or none of them are.
//!
//! # Format
//!
//! ```text
//! [4-byte length][json batch][4-byte crc32]
//! [4-byte length][json batch][4-byte crc32]
//! ...
//! ```
//!
//! Recovery reads batches sequentially and keeps, per record, the entry
//! with the highest version. Appends from concurrent mutations may land
//! out of order in the file; versions make replay independent of that.
//! A torn or corrupt tail is truncated away.
//!
//! A failed append is cut back off the file before the error is returned,
//! so later batches never land behind a torn one. If that cut fails too the
//! journal refuses all further appends.
//!
//! The data directory is held with an exclusive `flock` on `records.lock`
//! for as long as the journal is open; a second opener fails.

use super::memory::Slot;
use crate::error::{Error, Result};
use crate::record::RecordId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const JOURNAL_FILE: &str = "records.journal";
const COMPACT_FILE: &str = "records.journal.compact";
const LOCK_FILE: &str = "records.lock";

/// Larger length prefixes are treated as corruption
const MAX_BATCH_BYTES: usize = 256 * 1024 * 1024;

/// One mutation in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum JournalEntry {
    Put { slot: Slot },
    Remove { id: RecordId, version: u64 },
}

impl JournalEntry {
    fn id(&self) -> RecordId {
        match self {
            JournalEntry::Put { slot } => slot.record.id,
            JournalEntry::Remove { id, .. } => *id,
        }
    }

    fn version(&self) -> u64 {
        match self {
            JournalEntry::Put { slot } => slot.version,
            JournalEntry::Remove { version, .. } => *version,
        }
    }
}

/// A batch of entries written atomically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JournalBatch {
    /// Batch sequence number (monotonically increasing)
    pub sequence: u64,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub entries: Vec<JournalEntry>,
}

impl JournalBatch {
    fn new(sequence: u64, entries: Vec<JournalEntry>) -> Self {
        Self {
            sequence,
            timestamp: chrono::Utc::now().timestamp_millis(),
            entries,
        }
    }

    /// Serialize to bytes with length prefix and checksum
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize batch: {}", e)))?;

        let mut result = Vec::with_capacity(json.len() + 8);
        result.extend_from_slice(&(json.len() as u32).to_le_bytes());
        result.extend_from_slice(&json);
        result.extend_from_slice(&crc32fast::hash(&json).to_le_bytes());
        Ok(result)
    }

    /// Deserialize the json body, verifying its checksum
    fn from_parts(json: &[u8], checksum: u32) -> Result<Self> {
        if crc32fast::hash(json) != checksum {
            return Err(Error::StoreUnavailable("Checksum mismatch".to_string()));
        }
        serde_json::from_slice(json)
            .map_err(|e| Error::StoreUnavailable(format!("Failed to deserialize batch: {}", e)))
    }
}

struct Writer {
    file: File,
    next_sequence: u64,
    /// Set when a failed append could not be cut back off the file
    broken: bool,
}

/// Append-only journal
pub(crate) struct Journal {
    dir: PathBuf,
    writer: Mutex<Writer>,
    sync_writes: bool,
    /// Holds the directory lock until dropped
    _lock: File,
    #[cfg(test)]
    fail_appends: AtomicBool,
    #[cfg(test)]
    tear_appends: AtomicBool,
}

/// Result of replaying a journal
pub(crate) struct Recovered {
    /// Live records, in no particular order
    pub slots: Vec<Slot>,
    pub batches: u64,
}

impl Journal {
    /// Open (or create) the journal in `dir` and replay it
    pub fn open<P: AsRef<Path>>(dir: P, sync_writes: bool) -> Result<(Self, Recovered)> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let lock = lock_directory(&dir)?;

        let path = dir.join(JOURNAL_FILE);
        let (recovered, valid_len, last_sequence) = replay(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let actual_len = file.metadata()?.len();
        if actual_len > valid_len {
            warn!(
                path = ?path,
                valid_bytes = valid_len,
                dropped_bytes = actual_len - valid_len,
                "Truncating torn journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;

        info!(
            path = ?path,
            records = recovered.slots.len(),
            batches = recovered.batches,
            "Journal opened"
        );

        Ok((
            Self {
                dir,
                writer: Mutex::new(Writer {
                    file,
                    next_sequence: last_sequence + 1,
                    broken: false,
                }),
                sync_writes,
                _lock: lock,
                #[cfg(test)]
                fail_appends: AtomicBool::new(false),
                #[cfg(test)]
                tear_appends: AtomicBool::new(false),
            },
            recovered,
        ))
    }

    /// Append one batch atomically
    pub fn append(&self, entries: Vec<JournalEntry>) -> Result<()> {
        #[cfg(test)]
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("journal append failed".to_string()));
        }

        let mut writer = self.writer.lock();
        if writer.broken {
            return Err(Error::StoreUnavailable(
                "journal holds an unrecoverable partial write; reopen the store".to_string(),
            ));
        }

        let batch = JournalBatch::new(writer.next_sequence, entries);
        let bytes = batch.to_bytes()?;

        let start = writer.file.metadata()?.len();
        if let Err(e) = self.write_batch(&mut writer.file, &bytes) {
            match writer.file.set_len(start) {
                Ok(()) => warn!(error = %e, offset = start, "Journal append failed, partial batch removed"),
                Err(cut) => {
                    error!(
                        error = %e,
                        truncate_error = %cut,
                        offset = start,
                        "Journal append failed and could not be undone, refusing further writes"
                    );
                    writer.broken = true;
                }
            }
            return Err(e);
        }
        writer.next_sequence += 1;

        debug!(
            sequence = batch.sequence,
            entries = batch.entries.len(),
            bytes = bytes.len(),
            "Journal batch appended"
        );
        Ok(())
    }

    fn write_batch(&self, file: &mut File, bytes: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self.tear_appends.load(Ordering::SeqCst) {
            file.write_all(&bytes[..bytes.len() / 2])?;
            return Err(Error::StoreUnavailable("journal write torn".to_string()));
        }

        file.write_all(bytes)?;
        file.flush()?;
        if self.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Rewrite the journal as a single snapshot batch.
    ///
    /// `snapshot` runs while appends are blocked. Mutations applied in
    /// memory but not yet appended are appended after the swap and win on
    /// replay by version.
    pub fn compact<F>(&self, snapshot: F) -> Result<usize>
    where
        F: FnOnce() -> Vec<Slot>,
    {
        let mut writer = self.writer.lock();
        let slots = snapshot();
        let count = slots.len();

        let tmp_path = self.dir.join(COMPACT_FILE);
        let path = self.dir.join(JOURNAL_FILE);

        let entries = slots
            .into_iter()
            .map(|slot| JournalEntry::Put { slot })
            .collect();
        let batch = JournalBatch::new(writer.next_sequence, entries);

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&batch.to_bytes()?)?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &path)?;
        writer.file = OpenOptions::new().append(true).open(&path)?;
        writer.next_sequence += 1;
        writer.broken = false;

        info!(path = ?path, records = count, "Journal compacted");
        Ok(count)
    }

    /// Force everything written so far to disk
    pub fn sync(&self) -> Result<()> {
        let writer = self.writer.lock();
        writer.file.sync_all()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make appends write half a batch and then fail
    #[cfg(test)]
    pub fn set_tear_appends(&self, tear: bool) {
        self.tear_appends.store(tear, Ordering::SeqCst);
    }
}

/// Take the exclusive lock on `dir`, failing if another store holds it
fn lock_directory(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)?;

    if !try_lock_exclusive(&file)? {
        return Err(Error::StoreUnavailable(format!(
            "data directory {} is in use by another store",
            dir.display()
        )));
    }
    debug!(path = ?path, "Data directory locked");
    Ok(file)
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor stays valid for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

// TODO: use LockFileEx on Windows; until then the directory is not guarded there.
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

/// Replay the journal at `path`.
///
/// Returns the recovered state, the length of the valid prefix, and the
/// last batch sequence number seen.
fn replay(path: &Path) -> Result<(Recovered, u64, u64)> {
    let mut recovered = Recovered {
        slots: Vec::new(),
        batches: 0,
    };

    if !path.exists() {
        info!(path = ?path, "No journal found, starting fresh");
        return Ok((recovered, 0, 0));
    }

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    // Latest entry per record; a Remove keeps a tombstone so an older Put
    // appended later cannot resurrect the record.
    let mut latest: HashMap<RecordId, JournalEntry> = HashMap::new();
    let mut valid_len = 0u64;
    let mut last_sequence = 0u64;

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_BATCH_BYTES {
            warn!(offset = valid_len, len, "Implausible journal batch length, stopping replay");
            break;
        }

        let mut body = vec![0u8; len + 4];
        if let Err(e) = reader.read_exact(&mut body) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                warn!(offset = valid_len, "Incomplete journal batch at tail");
                break;
            }
            return Err(e.into());
        }

        let (json, checksum_bytes) = body.split_at(len);
        let checksum = u32::from_le_bytes([
            checksum_bytes[0],
            checksum_bytes[1],
            checksum_bytes[2],
            checksum_bytes[3],
        ]);

        let batch = match JournalBatch::from_parts(json, checksum) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(offset = valid_len, error = %e, "Unreadable journal batch, stopping replay");
                break;
            }
        };

        for entry in batch.entries {
            let id = entry.id();
            let newer = latest
                .get(&id)
                .map_or(true, |current| entry.version() >= current.version());
            if newer {
                latest.insert(id, entry);
            }
        }

        last_sequence = last_sequence.max(batch.sequence);
        recovered.batches += 1;
        valid_len += 4 + len as u64 + 4;
    }

    recovered.slots = latest
        .into_values()
        .filter_map(|entry| match entry {
            JournalEntry::Put { slot } => Some(slot),
            JournalEntry::Remove { .. } => None,
        })
        .collect();

    Ok((recovered, valid_len, last_sequence))
}
