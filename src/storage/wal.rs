//! Write-ahead log kept in a sidecar file next to the database.
//!
//! Sidecar layout (big-endian):
//! - header (16 bytes): magic `KWAL`, version (4), page size (4), reserved (4)
//! - page record: type `0x01`, txn id (8), page count (4), then per page
//!   page index (4), page bytes (page size), CRC32 (4)
//! - commit marker: type `0x02`, txn id (8), CRC32 (4) of type and txn id
//!
//! A transaction is durable once its commit marker is flushed. Replay stops
//! at the first record that is truncated or fails its checksum and treats
//! the rest of the file as a torn tail.

use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{
    storage::{WAL_HEADER_SIZE, WAL_MAGIC, WAL_SUFFIX, WAL_VERSION},
    types::{
        CHECKSUM_SIZE, LogOffset, TransactionId,
        error::{DatabaseError, Result},
        page::Page,
    },
    utils::hash::{calculate_commit_checksum, calculate_wal_entry_checksum, verify_wal_entry_checksum},
};

const RECORD_TYPE_PAGES: u8 = 0x01;
const RECORD_TYPE_COMMIT: u8 = 0x02;

const PAGES_RECORD_HEADER_SIZE: usize = 1 + 8 + 4;
const COMMIT_RECORD_SIZE: usize = 1 + 8 + CHECKSUM_SIZE;

/// Page writes of one transaction whose commit marker reached the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    pub txn_id: TransactionId,
    pub offset: LogOffset,
    pub pages: Vec<Page>,
}

pub struct Wal {
    path: PathBuf,
    file: File,
    page_size: usize,
    fsync: bool,
    len: u64,
    #[cfg(test)]
    fail_next_write: bool,
}

impl Wal {
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut wal_os: OsString = db_path.as_os_str().to_os_string();
        wal_os.push(WAL_SUFFIX);
        PathBuf::from(wal_os)
    }

    /// Opens the sidecar for `db_path`, creating it when absent or torn at creation.
    pub fn open(db_path: &Path, page_size: usize, fsync: bool) -> Result<Self> {
        let path = Self::path_for(db_path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut len = file.metadata()?.len();
        if len < WAL_HEADER_SIZE as u64 {
            if len > 0 {
                warn!("reinitializing WAL {} with a torn header ({} bytes)", path.display(), len);
            }
            write_header(&mut file, page_size as u32).map_err(DatabaseError::wal)?;
            file.sync_all().map_err(DatabaseError::wal)?;
            len = WAL_HEADER_SIZE as u64;
        } else {
            verify_header(&mut file, page_size as u32)?;
        }

        Ok(Self {
            path,
            file,
            page_size,
            fsync,
            len,
            #[cfg(test)]
            fail_next_write: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte length of the log including its header.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.len <= WAL_HEADER_SIZE as u64
    }

    /// Appends one page record and flushes it. Returns the record's offset.
    pub fn append(&mut self, txn_id: TransactionId, pages: &[Page]) -> Result<LogOffset> {
        let page_count = u32::try_from(pages.len()).map_err(|_| {
            DatabaseError::wal(io::Error::new(
                ErrorKind::InvalidInput,
                "too many pages in one WAL record",
            ))
        })?;

        let entry_size = 4 + self.page_size + CHECKSUM_SIZE;
        let mut record = Vec::with_capacity(PAGES_RECORD_HEADER_SIZE + pages.len() * entry_size);
        record.push(RECORD_TYPE_PAGES);
        record.extend_from_slice(&txn_id.to_be_bytes());
        record.extend_from_slice(&page_count.to_be_bytes());
        for page in pages {
            if page.len() != self.page_size {
                return Err(DatabaseError::InvalidPageSize {
                    expected: self.page_size,
                    actual: page.len(),
                });
            }
            let checksum = calculate_wal_entry_checksum(txn_id, page_count, page.index, &page.data);
            record.extend_from_slice(&page.index.to_be_bytes());
            record.extend_from_slice(&page.data);
            record.extend_from_slice(&checksum.to_be_bytes());
        }

        let offset = self.write_durable(&record)?;
        debug!("wal append(txn={}, pages={}) at offset {}", txn_id, page_count, offset);
        Ok(offset)
    }

    /// Appends and flushes the commit marker that makes `txn_id` durable.
    pub fn commit_marker(&mut self, txn_id: TransactionId) -> Result<LogOffset> {
        let mut record = Vec::with_capacity(COMMIT_RECORD_SIZE);
        record.push(RECORD_TYPE_COMMIT);
        record.extend_from_slice(&txn_id.to_be_bytes());
        record.extend_from_slice(&calculate_commit_checksum(RECORD_TYPE_COMMIT, txn_id).to_be_bytes());

        let offset = self.write_durable(&record)?;
        debug!("wal commit_marker(txn={}) at offset {}", txn_id, offset);
        Ok(offset)
    }

    fn write_durable(&mut self, record: &[u8]) -> Result<LogOffset> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_write) {
            return Err(DatabaseError::wal(io::Error::other("injected WAL failure")));
        }

        let offset = self.len;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(DatabaseError::wal)?;
        self.file.write_all(record).map_err(DatabaseError::wal)?;
        if self.fsync {
            self.file.sync_data().map_err(DatabaseError::wal)?;
        } else {
            self.file.flush().map_err(DatabaseError::wal)?;
        }
        self.len = offset + record.len() as u64;
        Ok(offset)
    }

    /// Lazily replays committed transactions from the start of the log.
    pub fn replay(&self) -> Result<WalReplay> {
        self.replay_from(WAL_HEADER_SIZE as LogOffset)
    }

    /// Replays from `offset`, which must be a record boundary.
    pub fn replay_from(&self, offset: LogOffset) -> Result<WalReplay> {
        let mut file = File::open(&self.path)?;
        let offset = offset.clamp(WAL_HEADER_SIZE as LogOffset, self.len);
        file.seek(SeekFrom::Start(offset))?;
        Ok(WalReplay {
            reader: BufReader::new(file),
            page_size: self.page_size,
            position: offset,
            valid_end: offset,
            end: self.len,
            finished: false,
        })
    }

    /// Drops every record, keeping the header.
    pub fn truncate(&mut self) -> Result<()> {
        self.rollback_to(WAL_HEADER_SIZE as LogOffset)
    }

    /// Cuts the log back to `len` bytes, discarding anything appended after it.
    pub fn rollback_to(&mut self, len: LogOffset) -> Result<()> {
        let len = len.max(WAL_HEADER_SIZE as LogOffset);
        self.file.set_len(len).map_err(DatabaseError::wal)?;
        self.file.sync_all().map_err(DatabaseError::wal)?;
        self.len = len;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }
}

/// Iterator over committed transactions in log order.
///
/// Ends quietly at end of log or at the first torn record; only genuine
/// read failures surface as `Err` items.
pub struct WalReplay {
    reader: BufReader<File>,
    page_size: usize,
    position: u64,
    valid_end: u64,
    end: u64,
    finished: bool,
}

impl WalReplay {
    /// Offset just past the last complete committed transaction seen so far.
    pub fn valid_end(&self) -> LogOffset {
        self.valid_end
    }

    /// Bytes after `valid_end` that replay will not apply.
    pub fn discarded_bytes(&self) -> u64 {
        self.end.saturating_sub(self.valid_end)
    }

    // Ok(false) signals a truncated read, the signature of a torn tail
    fn fill(&mut self, buffer: &mut [u8]) -> io::Result<bool> {
        match self.reader.read_exact(buffer) {
            Ok(()) => {
                self.position += buffer.len() as u64;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn read_u32(&mut self) -> io::Result<Option<u32>> {
        let mut raw = [0u8; 4];
        Ok(self.fill(&mut raw)?.then(|| u32::from_be_bytes(raw)))
    }

    fn read_u64(&mut self) -> io::Result<Option<u64>> {
        let mut raw = [0u8; 8];
        Ok(self.fill(&mut raw)?.then(|| u64::from_be_bytes(raw)))
    }

    fn read_transaction(&mut self) -> io::Result<Option<CommittedTransaction>> {
        let offset = self.position;

        let mut record_type = [0u8; 1];
        if !self.fill(&mut record_type)? || record_type[0] != RECORD_TYPE_PAGES {
            return Ok(None);
        }
        let Some(txn_id) = self.read_u64()? else {
            return Ok(None);
        };
        let Some(page_count) = self.read_u32()? else {
            return Ok(None);
        };

        let mut pages = Vec::new();
        for _ in 0..page_count {
            let Some(page_index) = self.read_u32()? else {
                return Ok(None);
            };
            let mut data = vec![0u8; self.page_size];
            if !self.fill(&mut data)? {
                return Ok(None);
            }
            let Some(checksum) = self.read_u32()? else {
                return Ok(None);
            };
            if !verify_wal_entry_checksum(txn_id, page_count, page_index, &data, checksum) {
                return Ok(None);
            }
            pages.push(Page {
                index: page_index,
                data,
            });
        }

        if !self.fill(&mut record_type)? || record_type[0] != RECORD_TYPE_COMMIT {
            return Ok(None);
        }
        let Some(marker_txn_id) = self.read_u64()? else {
            return Ok(None);
        };
        let Some(marker_checksum) = self.read_u32()? else {
            return Ok(None);
        };
        if marker_txn_id != txn_id
            || calculate_commit_checksum(RECORD_TYPE_COMMIT, txn_id) != marker_checksum
        {
            return Ok(None);
        }

        Ok(Some(CommittedTransaction {
            txn_id,
            offset,
            pages,
        }))
    }
}

impl Iterator for WalReplay {
    type Item = Result<CommittedTransaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.position >= self.end {
            return None;
        }
        match self.read_transaction() {
            Ok(Some(txn)) => {
                self.valid_end = self.position;
                Some(Ok(txn))
            }
            Ok(None) => {
                self.finished = true;
                if self.discarded_bytes() > 0 {
                    warn!(
                        "discarding {} WAL bytes after offset {} (incomplete transaction)",
                        self.discarded_bytes(),
                        self.valid_end
                    );
                }
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(DatabaseError::Io(err)))
            }
        }
    }
}

fn write_header(file: &mut File, page_size: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(WAL_MAGIC)?;
    file.write_all(&WAL_VERSION.to_be_bytes())?;
    file.write_all(&page_size.to_be_bytes())?;
    file.write_all(&[0u8; 4])?;
    Ok(())
}

fn verify_header(file: &mut File, expected_page_size: u32) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; WAL_HEADER_SIZE];
    file.read_exact(&mut header)?;

    if &header[0..4] != WAL_MAGIC {
        return Err(DatabaseError::corrupt("invalid WAL header (bad magic)"));
    }

    let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if version != WAL_VERSION {
        return Err(DatabaseError::corrupt(format!(
            "unsupported WAL version {}",
            version
        )));
    }

    let page_size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if page_size != expected_page_size {
        return Err(DatabaseError::corrupt(format!(
            "WAL page size {} does not match database page size {}",
            page_size, expected_page_size
        )));
    }

    Ok(())
}
