use super::Store;
use crate::format::{LogHeader, RecordError, StoreRecord, LOG_HEADER_SIZE};
use crate::mode::DurabilityMode;
use mvstm_core::{StmError, StmResult, TrunkId};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Name of the log file inside a store directory
pub const LOG_FILE_NAME: &str = "commits.log";

struct LogFile {
    file: File,
    write_position: u64,
    unsynced: usize,
    last_sync: Instant,
}

/// Store backed by a single CRC-checked log file.
///
/// A torn record at the end of the log (crash mid-append) is truncated on
/// open. A damaged record followed by intact data is reported as corruption.
pub struct FileStore {
    path: PathBuf,
    trunk_id: TrunkId,
    mode: DurabilityMode,
    log: Mutex<LogFile>,
}

impl FileStore {
    /// Open the store in `dir`, creating directory and log if missing.
    ///
    /// A new log is stamped with a fresh trunk id; an existing log keeps
    /// the id it was created with.
    pub fn open(dir: &Path, mode: DurabilityMode) -> StmResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);

        if !path.exists() {
            let trunk_id = TrunkId::new();
            let mut file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)?;
            file.write_all(&LogHeader::new(*trunk_id.as_bytes()).to_bytes())?;
            file.sync_all()?;
            info!(target: "mvstm::store", path = %path.display(), %trunk_id, "Created commit log");
            return Ok(FileStore {
                path,
                trunk_id,
                mode,
                log: Mutex::new(LogFile {
                    file,
                    write_position: LOG_HEADER_SIZE as u64,
                    unsynced: 0,
                    last_sync: Instant::now(),
                }),
            });
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let header = read_header(&bytes)?;
        let trunk_id = TrunkId::from_bytes(header.trunk_id);

        let (records, valid_len) = scan(&bytes)?;
        if (valid_len as usize) < bytes.len() {
            warn!(
                target: "mvstm::store",
                path = %path.display(),
                dropped = bytes.len() - valid_len as usize,
                "Truncating torn record at end of commit log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        info!(
            target: "mvstm::store",
            path = %path.display(),
            %trunk_id,
            records = records.len(),
            "Opened commit log"
        );

        Ok(FileStore {
            path,
            trunk_id,
            mode,
            log: Mutex::new(LogFile {
                file,
                write_position: valid_len,
                unsynced: 0,
                last_sync: Instant::now(),
            }),
        })
    }

    /// Trunk id recorded in the log header
    pub fn trunk_id(&self) -> TrunkId {
        self.trunk_id
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durability mode used for appends
    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Current size of the log in bytes
    pub fn size(&self) -> u64 {
        self.log.lock().write_position
    }
}

impl Store for FileStore {
    fn append(&self, record: &StoreRecord) -> StmResult<()> {
        let bytes = record.to_bytes();
        let mut log = self.log.lock();
        log.file.write_all(&bytes)?;
        log.write_position += bytes.len() as u64;
        log.unsynced += 1;

        if self.mode.should_sync(log.unsynced, log.last_sync.elapsed()) {
            log.file.sync_data()?;
            log.unsynced = 0;
            log.last_sync = Instant::now();
        }
        debug!(
            target: "mvstm::store",
            kind = ?record.kind,
            sequence = record.sequence,
            bytes = bytes.len(),
            "Appended record"
        );
        Ok(())
    }

    fn replay(&self) -> StmResult<Vec<StoreRecord>> {
        let _log = self.log.lock();
        let bytes = fs::read(&self.path)?;
        read_header(&bytes)?;
        let (records, _) = scan(&bytes)?;
        Ok(records)
    }

    fn sync(&self) -> StmResult<()> {
        let mut log = self.log.lock();
        log.file.sync_all()?;
        log.unsynced = 0;
        log.last_sync = Instant::now();
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let log = self.log.get_mut();
        if log.unsynced > 0 {
            if let Err(e) = log.file.sync_all() {
                warn!(target: "mvstm::store", error = %e, "Final sync of commit log failed");
            }
        }
    }
}

fn read_header(bytes: &[u8]) -> StmResult<LogHeader> {
    let raw: &[u8; LOG_HEADER_SIZE] = bytes
        .get(..LOG_HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| StmError::Corruption("commit log shorter than its header".into()))?;
    let header = LogHeader::from_bytes(raw)
        .ok_or_else(|| StmError::Corruption("unreadable commit log header".into()))?;
    if !header.is_valid() {
        return Err(StmError::Corruption(
            "invalid commit log magic or version".into(),
        ));
    }
    Ok(header)
}

/// Parse records after the header.
///
/// Returns the intact records and the byte length they occupy (header
/// included). Damage at the tail ends the scan; damage before intact data is
/// an error.
fn scan(bytes: &[u8]) -> StmResult<(Vec<StoreRecord>, u64)> {
    let mut records = Vec::new();
    let mut offset = LOG_HEADER_SIZE;

    while offset < bytes.len() {
        match StoreRecord::from_bytes(&bytes[offset..]) {
            Ok((record, consumed)) => {
                records.push(record);
                offset += consumed;
            }
            Err(RecordError::InsufficientData) => break,
            Err(e) => {
                let claimed = bytes
                    .get(offset..offset + 4)
                    .map(|l| u32::from_le_bytes([l[0], l[1], l[2], l[3]]) as usize)
                    .unwrap_or(0);
                if offset + 4 + claimed >= bytes.len() {
                    break;
                }
                return Err(StmError::Corruption(format!(
                    "record at offset {}: {}",
                    offset, e
                )));
            }
        }
    }
    Ok((records, offset as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RecordKind;
    use mvstm_core::ObjectId;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_reopen() {
        let dir = TempDir::new().unwrap();
        let trunk_id = {
            let store = FileStore::open(dir.path(), DurabilityMode::Always).unwrap();
            store.append_commit(1, vec![1, 2]).unwrap();
            store.append_commit(2, vec![3]).unwrap();
            store.set_root(ObjectId(5)).unwrap();
            store.trunk_id()
        };

        let store = FileStore::open(dir.path(), DurabilityMode::Always).unwrap();
        assert_eq!(store.trunk_id(), trunk_id);
        let records = store.replay().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].sequence, 2);
        assert_eq!(store.root().unwrap(), Some(ObjectId(5)));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = {
            let store = FileStore::open(dir.path(), DurabilityMode::Always).unwrap();
            store.append_commit(1, vec![7; 20]).unwrap();
            store.path().to_path_buf()
        };

        let mut partial = StoreRecord::new(RecordKind::Commit, 2, vec![8; 20]).to_bytes();
        partial.truncate(partial.len() / 2);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial).unwrap();
        drop(file);

        let store = FileStore::open(dir.path(), DurabilityMode::Always).unwrap();
        let records = store.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 1);

        store.append_commit(3, vec![9]).unwrap();
        let records = store.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence, 3);
    }

    #[test]
    fn test_corruption_before_intact_data_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = {
            let store = FileStore::open(dir.path(), DurabilityMode::Always).unwrap();
            store.append_commit(1, vec![1; 16]).unwrap();
            store.append_commit(2, vec![2; 16]).unwrap();
            store.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        bytes[LOG_HEADER_SIZE + 12] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let result = FileStore::open(dir.path(), DurabilityMode::Always);
        assert!(matches!(result, Err(StmError::Corruption(_))));
    }

    #[test]
    fn test_bad_header_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LOG_FILE_NAME), b"not a commit log at all, really!").unwrap();
        assert!(matches!(
            FileStore::open(dir.path(), DurabilityMode::Cache),
            Err(StmError::Corruption(_))
        ));
    }
}
