use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    storage::{
        WAL_HEADER_SIZE,
        page_store::PageStore,
        transaction::{CommitInfo, Transaction, TransactionManager, TransactionState},
        wal::Wal,
    },
    types::{
        LogOffset, PageIndex, TransactionId,
        error::{DatabaseError, Result},
    },
};

/// Version of the engine library, independent of the on-disk format version.
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Removes a database file and its WAL sidecar. The file must not be open.
pub fn destroy<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatabaseError::NotFound {
            path: path.to_path_buf(),
        });
    }
    fs::remove_file(path)?;
    let wal_path = Wal::path_for(path);
    if wal_path.exists() {
        fs::remove_file(&wal_path)?;
    }
    info!("destroyed database at path: {}", path.display());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStat {
    pub path: PathBuf,
    pub format_version: String,
    pub page_size: usize,
    pub page_count: u32,
    pub free_pages: usize,
    pub file_size: u64,
    pub wal_size: u64,
    /// Id of the last transaction that reached the log, 0 before the first commit.
    pub update_seq: TransactionId,
    pub change_counter: u32,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub pages_written: usize,
    pub wal_bytes_truncated: u64,
}

struct Engine {
    store: PageStore,
    wal: Wal,
    txns: TransactionManager,
    config: EngineConfig,
    // computed once at open, dropped with the engine on close
    format_version: String,
    #[cfg(test)]
    checkpoint_fault: Option<CheckpointFault>,
}

/// Point at which a test checkpoint stops, as a crash there would.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointFault {
    AfterFlush,
    AfterTruncate,
}

impl Engine {
    fn checkpoint(&mut self) -> Result<CheckpointStats> {
        if let Some(txn_id) = self.txns.active_id() {
            return Err(DatabaseError::AlreadyActive { txn_id });
        }
        let wal_header_end = WAL_HEADER_SIZE as LogOffset;
        if self.store.pending_pages() == 0
            && self.wal.is_empty()
            && self.store.header().wal_start_offset == wal_header_end
        {
            debug!("checkpoint = nothing to apply");
            return Ok(CheckpointStats::default());
        }

        let wal_end = self.wal.len();
        let pages_written = self.store.flush(wal_end)?;
        #[cfg(test)]
        self.inject_fault(CheckpointFault::AfterFlush)?;
        self.wal.truncate()?;
        #[cfg(test)]
        self.inject_fault(CheckpointFault::AfterTruncate)?;
        self.store.set_wal_start(wal_header_end)?;

        let stats = CheckpointStats {
            pages_written,
            wal_bytes_truncated: wal_end - wal_header_end,
        };
        info!(
            "checkpoint wrote {} pages, truncated {} WAL bytes",
            stats.pages_written, stats.wal_bytes_truncated
        );
        Ok(stats)
    }

    #[cfg(test)]
    fn inject_fault(&mut self, at: CheckpointFault) -> Result<()> {
        if self.checkpoint_fault == Some(at) {
            self.checkpoint_fault = None;
            return Err(DatabaseError::Io(std::io::Error::other(format!(
                "injected checkpoint failure {:?}",
                at
            ))));
        }
        Ok(())
    }

    // A checkpoint interrupted after truncating the WAL leaves a stale start
    // offset in the header; it must be reset before new records land.
    fn ensure_wal_start(&mut self) -> Result<()> {
        let wal_header_end = WAL_HEADER_SIZE as LogOffset;
        if self.store.header().wal_start_offset != wal_header_end && self.wal.is_empty() {
            self.store.set_wal_start(wal_header_end)?;
        }
        Ok(())
    }

    fn commit(&mut self, txn: Transaction) -> Result<CommitInfo> {
        if self.txns.active_id() != Some(txn.id()) {
            return Err(DatabaseError::UnknownTransaction { txn_id: txn.id() });
        }
        if let Err(err) = self.ensure_wal_start() {
            self.txns.abort_active();
            return Err(err);
        }

        let info = self.txns.commit(txn, &mut self.store, &mut self.wal)?;

        // The transaction is durable from here on; a failed checkpoint only
        // leaves the WAL longer and is retried by the next one
        let threshold = self.config.wal_autocheckpoint_bytes;
        if threshold > 0 && self.wal.len() >= threshold {
            debug!("wal reached {} bytes, checkpointing", self.wal.len());
            if let Err(err) = self.checkpoint() {
                warn!("automatic checkpoint after txn {} failed: {}", info.txn_id, err);
            }
        }
        Ok(info)
    }
}

/// An open database file and its WAL.
///
/// Every operation on a closed handle fails with [`DatabaseError::AlreadyClosed`].
/// Dropping a handle without [`Handle::close`] skips the final checkpoint; the
/// committed transactions are replayed from the WAL on the next open.
pub struct Handle {
    path: PathBuf,
    engine: Option<Engine>,
}

impl Handle {
    pub fn open<P: AsRef<Path>>(path: P, create_if_missing: bool) -> Result<Self> {
        let config = EngineConfig {
            create_if_missing,
            ..EngineConfig::default()
        };
        Self::open_with_config(path, &config)
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();

        let mut store = if path.exists() {
            info!("Opening existing database at path: {}", path.display());
            PageStore::open(path, config.max_page_count)?
        } else if config.create_if_missing {
            info!("Creating new database at path: {}", path.display());
            let wal_path = Wal::path_for(path);
            if wal_path.exists() {
                warn!("removing orphaned WAL {}", wal_path.display());
                fs::remove_file(&wal_path)?;
            }
            PageStore::create(path, config.page_size, config.max_page_count)?
        } else {
            return Err(DatabaseError::NotFound {
                path: path.to_path_buf(),
            });
        };

        let wal = Wal::open(path, store.page_size(), config.fsync)?;

        let wal_header_end = WAL_HEADER_SIZE as LogOffset;
        let mut start = store.header().wal_start_offset;
        if start < wal_header_end || start > wal.len() {
            start = wal_header_end;
        }
        let mut replayed = 0usize;
        let mut replayed_pages = 0usize;
        for committed in wal.replay_from(start)? {
            let committed = committed?;
            replayed_pages += committed.pages.len();
            for page in committed.pages {
                store.write(page.index, page.data)?;
            }
            replayed += 1;
        }
        if replayed > 0 {
            store.rebuild_allocator()?;
            info!(
                "replayed {} transactions ({} pages) from {}",
                replayed,
                replayed_pages,
                wal.path().display()
            );
        }
        // A torn tail, if any, is dropped by the checkpoint below with the rest of the log
        let format_version = store.header().format_version_string();
        let mut engine = Engine {
            txns: TransactionManager::new(store.header().next_txn_id),
            store,
            wal,
            config: config.clone(),
            format_version,
            #[cfg(test)]
            checkpoint_fault: None,
        };
        engine.checkpoint()?;

        Ok(Self {
            path: path.to_path_buf(),
            engine: Some(engine),
        })
    }

    fn engine(&self) -> Result<&Engine> {
        self.engine.as_ref().ok_or(DatabaseError::AlreadyClosed)
    }

    fn engine_mut(&mut self) -> Result<&mut Engine> {
        self.engine.as_mut().ok_or(DatabaseError::AlreadyClosed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_none()
    }

    /// Aborts any open transaction, checkpoints, and releases the files.
    ///
    /// When the checkpoint fails the handle stays open and `close` may be retried.
    pub fn close(&mut self) -> Result<()> {
        let engine = self.engine_mut()?;
        if let Some(txn_id) = engine.txns.abort_active() {
            warn!("aborting transaction {} still open at close", txn_id);
        }
        engine.checkpoint()?;
        self.engine = None;
        info!("Closed database at path: {}", self.path.display());
        Ok(())
    }

    /// On-disk format version recorded in the header.
    pub fn format_version(&self) -> Result<String> {
        Ok(self.engine()?.format_version.clone())
    }

    pub fn page_size(&self) -> Result<usize> {
        Ok(self.engine()?.store.page_size())
    }

    pub fn begin(&mut self) -> Result<Transaction> {
        let engine = self.engine_mut()?;
        engine.txns.begin(&engine.store)
    }

    pub fn put(&mut self, txn: &Transaction, page_index: PageIndex, data: &[u8]) -> Result<()> {
        let engine = self.engine_mut()?;
        let page_size = engine.store.page_size();
        engine.txns.put(txn, page_index, data.to_vec(), page_size)
    }

    /// Reads committed content; staged pages of an open transaction are not visible.
    pub fn read(&mut self, page_index: PageIndex) -> Result<Vec<u8>> {
        self.engine_mut()?.store.read(page_index)
    }

    /// Reads a page as `txn` sees it, including its own staged writes.
    pub fn read_in(&mut self, txn: &Transaction, page_index: PageIndex) -> Result<Vec<u8>> {
        let engine = self.engine_mut()?;
        engine.txns.read(txn, page_index, &mut engine.store)
    }

    pub fn allocate(&mut self, txn: &Transaction) -> Result<PageIndex> {
        let engine = self.engine_mut()?;
        let page_size = engine.store.page_size();
        engine.txns.allocate(txn, page_size)
    }

    pub fn free(&mut self, txn: &Transaction, page_index: PageIndex) -> Result<()> {
        self.engine_mut()?.txns.free(txn, page_index)
    }

    pub fn commit(&mut self, txn: Transaction) -> Result<CommitInfo> {
        self.engine_mut()?.commit(txn)
    }

    pub fn abort(&mut self, txn: Transaction) -> Result<()> {
        self.engine_mut()?.txns.abort(txn)
    }

    /// State of the open transaction or the most recently finished one.
    pub fn transaction_state(&self, txn_id: TransactionId) -> Result<Option<TransactionState>> {
        Ok(self.engine()?.txns.state_of(txn_id))
    }

    pub fn checkpoint(&mut self) -> Result<CheckpointStats> {
        self.engine_mut()?.checkpoint()
    }

    /// Releases free pages at the end of the file. Returns how many were dropped.
    pub fn vacuum(&mut self) -> Result<u32> {
        let engine = self.engine_mut()?;
        let txn = engine.txns.begin(&engine.store)?;
        let released = match engine.txns.release_trailing_free(&txn) {
            Ok(released) => released,
            Err(err) => {
                engine.txns.abort(txn)?;
                return Err(err);
            }
        };
        if released == 0 {
            engine.txns.abort(txn)?;
            return Ok(0);
        }
        engine.commit(txn)?;
        engine.checkpoint()?;
        engine.store.truncate_to_page_count()?;
        info!("vacuum released {} trailing pages", released);
        Ok(released)
    }

    pub fn stat(&self) -> Result<DatabaseStat> {
        let engine = self.engine()?;
        let header = engine.store.header();
        Ok(DatabaseStat {
            path: self.path.clone(),
            format_version: engine.format_version.clone(),
            page_size: engine.store.page_size(),
            page_count: engine.store.page_count(),
            free_pages: engine.store.allocator().free_list().len(),
            file_size: engine.store.file_size(),
            wal_size: engine.wal.len(),
            update_seq: header.next_txn_id.saturating_sub(1),
            change_counter: header.change_counter,
            created_at: header.created_at(),
        })
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.engine.is_some() {
            debug!(
                "handle for {} dropped without close, WAL left for replay",
                self.path.display()
            );
        }
    }
}
