pub mod art;
pub mod config;
pub mod storage;
pub mod types;
pub mod utils;

pub use config::EngineConfig;
pub use storage::handle::{CheckpointStats, DatabaseStat, Handle, destroy, engine_version};
pub use storage::transaction::{CommitInfo, Transaction, TransactionState};
pub use types::error::{DatabaseError, Result};
pub use types::{LogOffset, PageIndex, TransactionId};
