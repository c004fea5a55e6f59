use std::path::PathBuf;

use tempfile::{Builder, TempDir};

use crate::{
    config::EngineConfig,
    storage::{handle::Handle, wal::Wal},
    types::error::Result,
};

/// Database file inside a private temporary directory, removed on drop.
pub struct TempDatabase {
    pub path: PathBuf,
    pub config: EngineConfig,
    pub handle: Option<Handle>,
    _dir: TempDir,
}

impl TempDatabase {
    pub fn new() -> Self {
        Self::with_prefix("kouch_test")
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self::with_config(prefix, EngineConfig::default())
    }

    pub fn with_config(prefix: &str, config: EngineConfig) -> Self {
        let dir = Builder::new()
            .prefix(prefix)
            .tempdir()
            .expect("Failed to create temporary directory");
        Self {
            path: dir.path().join(format!("{}.kdb", prefix)),
            config,
            handle: None,
            _dir: dir,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        Wal::path_for(&self.path)
    }

    pub fn open(&mut self) -> Result<&mut Handle> {
        let handle = Handle::open_with_config(&self.path, &self.config)?;
        Ok(self.handle.insert(handle))
    }

    /// Closes the current handle cleanly, then opens a fresh one.
    pub fn reopen(&mut self) -> Result<&mut Handle> {
        if let Some(mut handle) = self.handle.take() {
            if !handle.is_closed() {
                handle.close()?;
            }
        }
        self.open()
    }

    /// Drops the current handle without closing it, as a crash would.
    pub fn crash(&mut self) {
        self.handle = None;
    }

    pub fn handle(&mut self) -> Option<&mut Handle> {
        self.handle.as_mut()
    }
}

impl Default for TempDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        self.handle = None;
    }
}
