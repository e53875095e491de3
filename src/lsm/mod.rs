//! Embedded LSM Engine
//!
//! The ordered key-value store each instance runs on. It is a small log-structured
//! merge tree with two features the storage tier depends on:
//!
//! - every write carries a monotonically increasing **sequence number**, and
//! - a pluggable [`Comparator`] decides both key order and which records compaction
//!   may discard (`should_drop`).
//!
//! ## Architecture
//! ```text
//!   put/delete/write ──► WAL (append, CRC) ──► MemTable (comparator-ordered)
//!                                                   │ flush at write_buffer_size
//!                                                   ▼
//!                                      L0 SSTables (one per flush)
//!                                                   │ compaction (merge, drop hook)
//!                                                   ▼
//!                                      L1 SSTables (split at target_file_size)
//! ```
//!
//! Reads resolve a key to the record with the highest sequence across the memtable
//! and every SSTable whose key range covers it, so files may overlap freely.

mod batch;
mod compaction;
mod db;
pub mod memtable;
pub mod sstable;
mod tables;
pub mod wal;

use std::cmp::Ordering;

use crate::config::{CompressionType, WalSyncStrategy};

pub use batch::WriteBatch;
pub use compaction::CompactionStats;
pub use db::{Db, DbStats, ScanBatch, SequencePin};
pub use sstable::TableOptions;

/// Key ordering plus the compaction-time drop predicate
pub trait Comparator: Send + Sync {
    /// Stable identifier, logged when a store is opened
    fn name(&self) -> &str;

    /// Total order over full stored keys
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Whether a live record may be discarded (or hidden from reads) at `now`
    fn should_drop(&self, _key: &[u8], _sequence: u64, _now: u32) -> bool {
        false
    }
}

/// Plain lexicographic ordering, never drops anything
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &str {
        "bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// One version of a key as stored in the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Full stored key bytes (may differ from the lookup key where the comparator
    /// ignores part of it)
    pub key: Vec<u8>,
    /// Sequence number of the write that produced this version
    pub sequence: u64,
    /// `None` marks a tombstone
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Tuning for one engine instance
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// When the WAL is fsynced
    pub wal_sync_strategy: WalSyncStrategy,

    /// Memtable size (bytes) that triggers a flush
    pub write_buffer_size: usize,

    /// Compaction output files are cut once they reach this size
    pub target_file_size: u64,

    /// Data bytes covered by one sparse index entry
    pub block_size: usize,

    /// Value compression for new SSTables
    pub compression: CompressionType,

    /// Verify SSTable data CRCs when tables are opened
    pub verify_checksums: bool,

    pub l0_compaction_trigger: usize,
    pub l0_slowdown_writes_trigger: usize,
    pub l0_stop_writes_trigger: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
            write_buffer_size: 4 * 1024 * 1024,
            target_file_size: 2 * 1024 * 1024,
            block_size: 4096,
            compression: CompressionType::Snappy,
            verify_checksums: false,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
        }
    }
}

impl DbOptions {
    pub(crate) fn table_options(&self) -> TableOptions {
        TableOptions {
            block_size: self.block_size,
            compression: self.compression,
        }
    }
}
