//! Engine configuration.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    storage::header::validate_page_size,
    types::{DEFAULT_PAGE_SIZE, error::DatabaseError},
};

/// Options applied when a handle opens a database file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page size for newly created files. Existing files keep their own.
    pub page_size: usize,
    /// Create the file when it does not exist.
    pub create_if_missing: bool,
    /// Sync the WAL to the medium on every append.
    pub fsync: bool,
    /// Checkpoint after a commit once the WAL reaches this size (0 = never).
    pub wal_autocheckpoint_bytes: u64,
    /// Upper bound on the page count, header page included.
    pub max_page_count: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            create_if_missing: true,
            fsync: true,
            wal_autocheckpoint_bytes: 4 * 1024 * 1024,
            max_page_count: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, DatabaseError> {
        let config: Self = serde_json::from_str(raw).map_err(|err| DatabaseError::InvalidConfig {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DatabaseError> {
        validate_page_size(self.page_size)?;
        if let Some(max) = self.max_page_count.filter(|&max| max < 2) {
            return Err(DatabaseError::InvalidConfig {
                reason: format!("max_page_count {} leaves no room for data pages", max),
            });
        }
        Ok(())
    }
}
