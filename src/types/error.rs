use std::path::PathBuf;

use thiserror::Error;

use crate::types::{PageIndex, TransactionId};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Corrupt database file: {reason}")]
    CorruptFile { reason: String },

    #[error("Invalid page index {page_index} (page count: {page_count})")]
    InvalidPageIndex {
        page_index: PageIndex,
        page_count: u32,
    },

    #[error("Page {page_index} is already free")]
    DoubleFree { page_index: PageIndex },

    #[error("Storage full: {reason}")]
    StorageFull { reason: String },

    #[error("WAL write failed: {source}")]
    WalWriteError {
        #[source]
        source: std::io::Error,
    },

    #[error("Transaction {txn_id} is already active")]
    AlreadyActive { txn_id: TransactionId },

    #[error("Handle is already closed")]
    AlreadyClosed,

    #[error("Invalid page size: {expected} bytes, got {actual} bytes")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Transaction {txn_id} is not the active transaction")]
    UnknownTransaction { txn_id: TransactionId },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl DatabaseError {
    /// Classifies a data-file I/O failure, surfacing a full medium as [`DatabaseError::StorageFull`].
    pub fn from_storage_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            DatabaseError::StorageFull {
                reason: err.to_string(),
            }
        } else {
            DatabaseError::Io(err)
        }
    }

    pub fn wal(source: std::io::Error) -> Self {
        DatabaseError::WalWriteError { source }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        DatabaseError::CorruptFile {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
