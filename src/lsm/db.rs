//! Store Engine
//!
//! One LSM store: WAL, memtable and table set behind a single handle.
//!
//! ## Responsibilities
//! - Assign a sequence number to every write
//! - Coordinate WAL, MemTable and tables
//! - Trigger flushes when the memtable is full and L0 compactions when L0 grows
//! - Manage crash recovery on startup
//! - Range compaction bounded by sequence, and sequence pins for change capture

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lsm::compaction::{self, CompactionJob, CompactionStats};
use crate::lsm::memtable::MemTable;
use crate::lsm::sstable::SSTableReader;
use crate::lsm::tables::{TableList, TableSet};
use crate::lsm::wal::{Operation, WalEntry, WalRecovery, WalWriter};
use crate::lsm::{Comparator, DbOptions, Record, WriteBatch};
use crate::util::now_secs;

/// How long a writer backs off once L0 reaches the slowdown trigger
const SLOWDOWN_DELAY: Duration = Duration::from_millis(1);

/// One page of a range scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanBatch {
    /// Records in comparator order (newest version per key)
    pub records: Vec<Record>,
    /// Last key examined; continue from here (exclusive)
    pub resume_key: Option<Vec<u8>>,
    /// Nothing remains before the end bound
    pub exhausted: bool,
}

/// Point-in-time counters of one store
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    pub sstable_count: usize,
    pub level0_count: usize,
    pub table_bytes: u64,
    pub memtable_bytes: usize,
    pub memtable_entries: usize,
    pub last_sequence: u64,
}

/// Keeps versions above a sequence observable until dropped
///
/// While any pin at `s` exists, compaction never erases a change with a
/// sequence greater than `s`: deletions and dropped records stay visible as
/// tombstones.
pub struct SequencePin<'a> {
    db: &'a Db,
    sequence: u64,
}

impl SequencePin<'_> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for SequencePin<'_> {
    fn drop(&mut self) {
        let mut pins = self.db.pins.lock();
        if let Some(count) = pins.get_mut(&self.sequence) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.sequence);
            }
        }
    }
}

/// An embedded LSM store
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete/write/flush): serialized by `write_lock`, which
///   also makes sequence assignment and WAL order agree
/// - **Reads** (get/scan): no store-level lock; the memtable has its own RwLock
///   and the table list is an immutable snapshot
/// - **Compactions**: serialized by `compaction_lock`; lock order is
///   `write_lock` → `compaction_lock`, and compaction never takes `write_lock`
pub struct Db {
    path: PathBuf,
    options: DbOptions,
    cmp: Arc<dyn Comparator>,

    /// Write-ahead log for durability
    wal: Mutex<WalWriter>,

    /// In-memory table for recent writes (internal RwLock)
    memtable: MemTable,

    /// Persistent tables
    tables: TableSet,

    write_lock: Mutex<()>,
    compaction_lock: Mutex<()>,

    /// Sequence of the last applied write
    last_sequence: AtomicU64,

    /// Pinned sequence → number of pins
    pins: Mutex<BTreeMap<u64, usize>>,
}

impl Db {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_FILENAME: &'static str = "wal.log";
    const SSTABLE_DIR: &'static str = "sstables";

    /// Open or create a store under `path`
    ///
    /// On startup:
    /// 1. Open/create the directory
    /// 2. Load live SSTables
    /// 3. Replay the WAL into a memtable and flush it
    /// 4. Ready to serve requests
    pub fn open(path: &Path, options: DbOptions, cmp: Arc<dyn Comparator>) -> Result<Self> {
        fs::create_dir_all(path)?;

        let storage_dir = path.join(Self::SSTABLE_DIR);
        let wal_path = path.join(Self::WAL_FILENAME);

        let tables = TableSet::open(
            &storage_dir,
            Arc::clone(&cmp),
            options.table_options(),
            options.verify_checksums,
        )?;
        let memtable = MemTable::new(Arc::clone(&cmp));
        let mut last_sequence = tables.max_sequence();

        if wal_path.exists() {
            let (entries, recovery) = WalRecovery::recover(&wal_path)?;
            if recovery.entries_recovered > 0 || recovery.entries_corrupted > 0 {
                info!(
                    path = %path.display(),
                    recovered = recovery.entries_recovered,
                    corrupted = recovery.entries_corrupted,
                    last_lsn = recovery.last_lsn,
                    truncated = recovery.was_truncated,
                    "WAL recovery"
                );
            }

            for entry in entries {
                for (i, op) in entry.operations.into_iter().enumerate() {
                    let sequence = entry.lsn + i as u64;
                    match op {
                        Operation::Put { key, value } => memtable.put(key, sequence, value),
                        Operation::Delete { key } => memtable.delete(key, sequence),
                    };
                    last_sequence = last_sequence.max(sequence);
                }
            }

            // make recovered data durable before the WAL is truncated
            if !memtable.is_empty() {
                debug!(entries = memtable.entry_count(), "Flushing recovered entries");
                tables.flush(&memtable)?;
                memtable.clear();
            }
        }

        let mut wal = WalWriter::open(&wal_path, options.wal_sync_strategy)?;
        wal.truncate()?;

        info!(
            path = %path.display(),
            comparator = cmp.name(),
            sstables = tables.count(),
            last_sequence,
            "Store opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            options,
            cmp,
            wal: Mutex::new(wal),
            memtable,
            tables,
            write_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            last_sequence: AtomicU64::new(last_sequence),
            pins: Mutex::new(BTreeMap::new()),
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a key-value pair; returns its sequence number
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    /// Delete a key; returns the tombstone's sequence number
    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Apply a batch atomically; returns the sequence of its last operation
    pub fn write(&self, batch: WriteBatch) -> Result<u64> {
        self.write_with(|_| Ok((batch, ()))).map(|(seq, ())| seq)
    }

    /// Build a batch under the write lock and apply it
    ///
    /// `build` sees every write applied before it and none applied after, so a
    /// read-check-write sequence inside it is atomic. Returns the sequence of
    /// the last operation (the current sequence for an empty batch) together
    /// with `build`'s extra output.
    ///
    /// Steps:
    /// 1. Back off (or compact inline) while L0 is over its triggers
    /// 2. Acquire write lock, build the batch and assign sequences
    /// 3. Write to WAL, then MemTable
    /// 4. Flush if the memtable is full, then compact L0 if it grew too large
    pub fn write_with<T, F>(&self, build: F) -> Result<(u64, T)>
    where
        F: FnOnce(&Db) -> Result<(WriteBatch, T)>,
    {
        self.throttle_writes()?;

        let (last, output) = {
            let _write_guard = self.write_lock.lock();
            let (batch, output) = build(self)?;
            if batch.is_empty() {
                return Ok((self.latest_sequence(), output));
            }

            let first = self.last_sequence.load(Ordering::SeqCst) + 1;
            let entry = WalEntry::new(first, batch.into_operations());
            let last = entry.last_sequence();
            self.wal.lock().append(&entry)?;

            for (i, op) in entry.operations.into_iter().enumerate() {
                let sequence = first + i as u64;
                match op {
                    Operation::Put { key, value } => self.memtable.put(key, sequence, value),
                    Operation::Delete { key } => self.memtable.delete(key, sequence),
                };
            }
            self.last_sequence.store(last, Ordering::SeqCst);

            if self.memtable.should_flush(self.options.write_buffer_size) {
                self.flush_internal()?;
            }
            (last, output)
        };

        self.maybe_compact_level0()?;
        Ok((last, output))
    }

    fn throttle_writes(&self) -> Result<()> {
        let level0 = self.tables.level0_count();
        if level0 >= self.options.l0_stop_writes_trigger {
            let _compaction = self.compaction_lock.lock();
            if self.tables.level0_count() >= self.options.l0_stop_writes_trigger {
                warn!(level0, path = %self.path.display(), "L0 stop trigger reached, compacting inline");
                self.compact_level0_locked()?;
            }
        } else if level0 >= self.options.l0_slowdown_writes_trigger {
            thread::sleep(SLOWDOWN_DELAY);
        }
        Ok(())
    }

    fn maybe_compact_level0(&self) -> Result<()> {
        if self.tables.level0_count() < self.options.l0_compaction_trigger {
            return Ok(());
        }
        // another writer is already compacting
        if let Some(_compaction) = self.compaction_lock.try_lock() {
            self.compact_level0_locked()?;
        }
        Ok(())
    }

    /// Flush memtable to disk regardless of its size
    pub fn flush(&self) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        self.flush_internal()
    }

    /// Called with write lock held
    fn flush_internal(&self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        self.tables.flush(&self.memtable)?;
        self.memtable.clear();
        self.wal.lock().truncate()?;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Newest visible version of `key`
    ///
    /// Tombstones and records the comparator would drop read as absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        let newest = match self.memtable.get(key) {
            Some(record) => Some(record),
            None => self.tables.get(key)?,
        };
        let now = now_secs();
        Ok(newest.filter(|r| {
            !r.is_tombstone() && !self.cmp.should_drop(&r.key, r.sequence, now)
        }))
    }

    /// Read one page of keys in `[start, end)` (`start` excluded unless
    /// `inclusive`), at most `limit` records and about `max_bytes` bytes
    /// (0 = unbounded)
    ///
    /// With `include_tombstones`, deletions and records the comparator would
    /// drop are returned as tombstones; otherwise they are skipped.
    pub fn scan(
        &self,
        start: &[u8],
        inclusive: bool,
        end: Option<&[u8]>,
        limit: usize,
        max_bytes: usize,
        include_tombstones: bool,
    ) -> Result<ScanBatch> {
        let limit = limit.max(1);
        let cmp = self.cmp.as_ref();

        // memtable first so a concurrent flush cannot hide entries
        let mut sources = vec![self.memtable.range_from(start, inclusive, limit)];
        for table in self.tables.snapshot().iter() {
            if let Some(end) = end {
                if cmp.compare(table.min_key(), end) != CmpOrdering::Less {
                    continue;
                }
            }
            sources.push(table.read_range(start, inclusive, limit)?);
        }

        // a truncated source is only complete up to its last key
        let mut boundary: Option<Vec<u8>> = None;
        for (records, more) in &sources {
            if !*more {
                continue;
            }
            if let Some(last) = records.last() {
                let lower = boundary
                    .as_ref()
                    .map_or(true, |b| cmp.compare(&last.key, b) == CmpOrdering::Less);
                if lower {
                    boundary = Some(last.key.clone());
                }
            }
        }

        let mut merged: Vec<Record> = sources.into_iter().flat_map(|(r, _)| r).collect();
        merged.sort_by(|a, b| {
            cmp.compare(&a.key, &b.key)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        merged.dedup_by(|later, kept| cmp.compare(&later.key, &kept.key) == CmpOrdering::Equal);

        let now = now_secs();
        let mut batch = ScanBatch::default();
        let mut bytes = 0usize;
        let mut reached_end = false;
        let mut cut = false;
        for record in merged {
            if let Some(b) = &boundary {
                if cmp.compare(&record.key, b) == CmpOrdering::Greater {
                    break;
                }
            }
            if let Some(end) = end {
                if cmp.compare(&record.key, end) != CmpOrdering::Less {
                    reached_end = true;
                    break;
                }
            }
            if batch.records.len() >= limit || (max_bytes > 0 && bytes >= max_bytes) {
                cut = true;
                break;
            }

            batch.resume_key = Some(record.key.clone());
            let dropped = !record.is_tombstone()
                && cmp.should_drop(&record.key, record.sequence, now);
            let visible = if record.is_tombstone() || dropped {
                if !include_tombstones {
                    continue;
                }
                Record {
                    value: None,
                    ..record
                }
            } else {
                record
            };
            bytes += visible.key.len() + visible.value.as_ref().map_or(0, Vec::len);
            batch.records.push(visible);
        }

        batch.exhausted = reached_end || (!cut && boundary.is_none());
        Ok(batch)
    }

    /// Sequence of the last applied write
    pub fn latest_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Make the next write take a sequence above `sequence`
    pub fn advance_sequence(&self, sequence: u64) {
        let _write_guard = self.write_lock.lock();
        let previous = self.last_sequence.fetch_max(sequence, Ordering::SeqCst);
        if previous < sequence {
            debug!(from = previous, to = sequence, "Advanced store sequence");
        }
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Flush, then merge every table into new level-1 tables
    pub fn compact_all(&self) -> Result<CompactionStats> {
        self.flush()?;
        let _compaction = self.compaction_lock.lock();
        let all = self.tables.snapshot();
        let inputs: Vec<Arc<SSTableReader>> = all.iter().cloned().collect();
        self.run_compaction(inputs, &all)
    }

    /// Compact the tables overlapping `[start, end)` that hold at least one
    /// record with a sequence ≤ `max_sequence`
    ///
    /// The memtable is flushed first when it holds such records, so everything
    /// written up to `max_sequence` is in scope.
    pub fn compact_range(&self, start: &[u8], end: &[u8], max_sequence: u64) -> Result<CompactionStats> {
        if self
            .memtable
            .min_sequence()
            .map_or(false, |s| s <= max_sequence)
        {
            self.flush()?;
        }

        let _compaction = self.compaction_lock.lock();
        let all = self.tables.snapshot();
        let inputs: Vec<Arc<SSTableReader>> = all
            .iter()
            .filter(|t| t.min_sequence() <= max_sequence)
            .filter(|t| {
                self.cmp.compare(t.max_key(), start) != CmpOrdering::Less
                    && self.cmp.compare(t.min_key(), end) == CmpOrdering::Less
            })
            .cloned()
            .collect();
        self.run_compaction(inputs, &all)
    }

    /// Merge L0 tables with the L1 tables they overlap (compaction lock held)
    fn compact_level0_locked(&self) -> Result<CompactionStats> {
        let all = self.tables.snapshot();
        let level0: Vec<Arc<SSTableReader>> =
            all.iter().filter(|t| t.level() == 0).cloned().collect();
        let Some((lo, hi)) = self.span(&level0) else {
            return Ok(CompactionStats::default());
        };
        let inputs: Vec<Arc<SSTableReader>> = all
            .iter()
            .filter(|t| t.level() == 0 || t.overlaps(&lo, &hi))
            .cloned()
            .collect();
        self.run_compaction(inputs, &all)
    }

    fn run_compaction(
        &self,
        inputs: Vec<Arc<SSTableReader>>,
        all: &TableList,
    ) -> Result<CompactionStats> {
        let Some((lo, hi)) = self.span(&inputs) else {
            return Ok(CompactionStats::default());
        };
        let input_ids: Vec<u64> = inputs.iter().map(|t| t.id()).collect();
        let exclusive = all
            .iter()
            .filter(|t| !input_ids.contains(&t.id()))
            .all(|t| !t.overlaps(&lo, &hi));

        let job = CompactionJob {
            inputs,
            exclusive,
            pinned_floor: self.pinned_floor(),
            now: now_secs(),
        };
        compaction::run(&self.tables, self.cmp.as_ref(), job, self.options.target_file_size)
    }

    /// Smallest min key and largest max key of `tables`
    fn span(&self, tables: &[Arc<SSTableReader>]) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut iter = tables.iter();
        let first = iter.next()?;
        let mut lo = first.min_key();
        let mut hi = first.max_key();
        for table in iter {
            if self.cmp.compare(table.min_key(), lo) == CmpOrdering::Less {
                lo = table.min_key();
            }
            if self.cmp.compare(table.max_key(), hi) == CmpOrdering::Greater {
                hi = table.max_key();
            }
        }
        Some((lo.to_vec(), hi.to_vec()))
    }

    // =========================================================================
    // Sequence Pins
    // =========================================================================

    /// Keep every change after `sequence` observable while the pin lives
    pub fn pin_sequence(&self, sequence: u64) -> SequencePin<'_> {
        *self.pins.lock().entry(sequence).or_insert(0) += 1;
        SequencePin { db: self, sequence }
    }

    fn pinned_floor(&self) -> Option<u64> {
        self.pins.lock().keys().next().copied()
    }

    // =========================================================================
    // Lifecycle & Accessors
    // =========================================================================

    /// Flush pending data and sync the WAL
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.wal.lock().sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    pub fn sstable_count(&self) -> usize {
        self.tables.count()
    }

    pub fn level0_count(&self) -> usize {
        self.tables.level0_count()
    }

    /// Smallest sequence not yet flushed
    pub fn memtable_min_sequence(&self) -> Option<u64> {
        self.memtable.min_sequence()
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            sstable_count: self.tables.count(),
            level0_count: self.tables.level0_count(),
            table_bytes: self.tables.total_bytes(),
            memtable_bytes: self.memtable.size(),
            memtable_entries: self.memtable.entry_count(),
            last_sequence: self.latest_sequence(),
        }
    }
}
