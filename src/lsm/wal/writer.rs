//! WAL Writer
//!
//! Handles appending entries to the WAL file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::{BucketError, Result};

use super::WalEntry;

/// Writes entries to the WAL file
pub struct WalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    sync_strategy: WalSyncStrategy,
    /// Entries appended since the last fsync
    unsynced: usize,
    current_lsn: u64,
}

impl WalWriter {
    /// Open or create a WAL file; new entries are appended
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            sync_strategy,
            unsynced: 0,
            current_lsn: 0,
        })
    }

    /// Append an entry; returns its LSN
    pub fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        let bytes = entry.serialize()?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        self.current_lsn = entry.last_sequence();
        self.unsynced += 1;

        let due = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.unsynced >= count.max(1),
        };
        if due {
            self.sync()?;
        }
        Ok(entry.lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Drop all entries (their contents are durable elsewhere)
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.set_len(0).map_err(|e| {
            BucketError::EngineIo(format!("truncate {}: {}", self.path.display(), e))
        })?;
        file.sync_all()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Sequence number of the last appended operation
    pub fn current_lsn(&self) -> u64 {
        self.current_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
