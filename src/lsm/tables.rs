//! Table Set
//!
//! Owns the SSTables of one store and coordinates reads across them.
//!
//! ## Responsibilities
//! - Discover live SSTables on startup (through the manifest)
//! - Resolve a key to its newest version across all tables
//! - Create new SSTables from memtable flushes and compaction output
//! - Swap table lists atomically; replaced files go away with their last reader
//!
//! ## Manifest
//! `MANIFEST` (bincode) lists the live table ids and the highest sequence ever
//! installed. It is rewritten through a temp file and rename on every install,
//! and files it does not list are deleted on open: they are either unfinished
//! outputs or replaced inputs. The recorded sequence survives compactions that
//! drop the newest records, so sequences never restart lower after a reopen.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::lsm::memtable::MemTable;
use crate::lsm::sstable::{
    parse_table_id, table_file_name, SSTable, SSTableBuilder, SSTableReader, TableOptions,
};
use crate::lsm::{Comparator, Record};

const MANIFEST_FILENAME: &str = "MANIFEST";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    live: Vec<u64>,
    next_table_id: u64,
    last_sequence: u64,
}

/// Immutable view of the live tables, ordered newest id first
pub(crate) type TableList = Arc<Vec<Arc<SSTableReader>>>;

/// Manages the SSTables of one store
///
/// ## Concurrency:
/// - `tables`: RwLock around an `Arc` snapshot; readers clone the `Arc` and
///   never hold the lock while doing I/O
/// - `install_lock`: serializes manifest rewrites
pub(crate) struct TableSet {
    dir: PathBuf,
    tables: RwLock<TableList>,
    install_lock: Mutex<()>,
    next_table_id: AtomicU64,
    /// Highest sequence any installed table has held
    last_sequence: AtomicU64,
    cmp: Arc<dyn Comparator>,
    options: TableOptions,
    verify_checksums: bool,
}

impl TableSet {
    /// Open or create the table directory
    pub fn open(
        dir: &Path,
        cmp: Arc<dyn Comparator>,
        options: TableOptions,
        verify_checksums: bool,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut on_disk: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(id) = parse_table_id(&path) {
                    on_disk.push(id);
                }
            }
        }

        let manifest_path = dir.join(MANIFEST_FILENAME);
        let manifest = if manifest_path.exists() {
            bincode::deserialize::<Manifest>(&fs::read(&manifest_path)?)?
        } else {
            // first open of this directory: everything present is live
            Manifest {
                live: on_disk.clone(),
                next_table_id: on_disk.iter().max().map_or(1, |id| id + 1),
                last_sequence: 0,
            }
        };

        for id in on_disk.iter().filter(|id| !manifest.live.contains(id)) {
            let path = dir.join(table_file_name(*id));
            info!(path = %path.display(), "Removing SSTable not listed in manifest");
            fs::remove_file(&path)?;
        }

        let mut ids = manifest.live.clone();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut tables = Vec::with_capacity(ids.len());
        for id in &ids {
            let path = dir.join(table_file_name(*id));
            tables.push(Arc::new(SSTableReader::open(
                &path,
                Arc::clone(&cmp),
                verify_checksums,
            )?));
        }

        let next_id = manifest
            .next_table_id
            .max(on_disk.iter().max().map_or(1, |id| id + 1));
        let last_sequence = tables
            .iter()
            .map(|t| t.max_sequence())
            .fold(manifest.last_sequence, u64::max);

        let set = Self {
            dir: dir.to_path_buf(),
            tables: RwLock::new(Arc::new(tables)),
            install_lock: Mutex::new(()),
            next_table_id: AtomicU64::new(next_id),
            last_sequence: AtomicU64::new(last_sequence),
            cmp,
            options,
            verify_checksums,
        };
        set.write_manifest(&ids)?;
        Ok(set)
    }

    /// Current table list
    pub fn snapshot(&self) -> TableList {
        Arc::clone(&self.tables.read())
    }

    /// Newest version of `key` across all tables (tombstones included)
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        let tables = self.snapshot();
        let mut newest: Option<Record> = None;
        for table in tables.iter() {
            if let Some(found) = newest.as_ref().map(|r| r.sequence) {
                if table.max_sequence() <= found {
                    continue;
                }
            }
            if let Some(record) = table.get(key)? {
                if newest.as_ref().map_or(true, |r| record.sequence > r.sequence) {
                    newest = Some(record);
                }
            }
        }
        Ok(newest)
    }

    /// Start a new SSTable file
    pub fn new_builder(&self, level: u32) -> Result<(u64, SSTableBuilder)> {
        let id = self.next_table_id.fetch_add(1, Ordering::SeqCst);
        let builder = SSTableBuilder::new(&self.table_path(id), self.options, level)?;
        Ok((id, builder))
    }

    /// Open a freshly finished table
    pub fn open_table(&self, id: u64) -> Result<Arc<SSTableReader>> {
        Ok(Arc::new(SSTableReader::open(
            &self.table_path(id),
            Arc::clone(&self.cmp),
            self.verify_checksums,
        )?))
    }

    /// Flush a MemTable to a new level-0 SSTable
    pub fn flush(&self, memtable: &MemTable) -> Result<Option<SSTable>> {
        let records = memtable.records();
        if records.is_empty() {
            return Ok(None);
        }

        let (id, mut builder) = self.new_builder(0)?;
        for record in &records {
            builder.add_record(record)?;
        }
        let metadata = builder.finish()?;
        let reader = self.open_table(id)?;
        self.install(vec![reader], &[])?;

        debug!(
            path = %metadata.path.display(),
            entries = metadata.entry_count,
            "Flushed memtable"
        );
        Ok(Some(metadata))
    }

    /// Atomically add `added` and drop the tables with ids in `removed`
    pub fn install(&self, added: Vec<Arc<SSTableReader>>, removed: &[u64]) -> Result<()> {
        let _guard = self.install_lock.lock();
        let current = self.snapshot();

        let mut next: Vec<Arc<SSTableReader>> = current
            .iter()
            .filter(|t| !removed.contains(&t.id()))
            .cloned()
            .collect();
        for table in &added {
            self.last_sequence
                .fetch_max(table.max_sequence(), Ordering::SeqCst);
        }
        next.extend(added);
        next.sort_unstable_by(|a, b| b.id().cmp(&a.id()));

        let ids: Vec<u64> = next.iter().map(|t| t.id()).collect();
        self.write_manifest(&ids)?;
        *self.tables.write() = Arc::new(next);

        for table in current.iter().filter(|t| removed.contains(&t.id())) {
            table.mark_obsolete();
        }
        Ok(())
    }

    /// Delete an output file that was never installed
    pub fn discard(&self, id: u64) {
        let path = self.table_path(id);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove abandoned SSTable");
        }
    }

    pub fn count(&self) -> usize {
        self.tables.read().len()
    }

    pub fn level0_count(&self) -> usize {
        self.tables.read().iter().filter(|t| t.level() == 0).count()
    }

    /// Highest sequence ever installed, including records that compaction
    /// has since removed
    pub fn max_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.tables.read().iter().map(|t| t.meta().file_size).sum()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self, id: u64) -> PathBuf {
        self.dir.join(table_file_name(id))
    }

    fn write_manifest(&self, live: &[u64]) -> Result<()> {
        let manifest = Manifest {
            live: live.to_vec(),
            next_table_id: self.next_table_id.load(Ordering::SeqCst),
            last_sequence: self.last_sequence.load(Ordering::SeqCst),
        };
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST_FILENAME));
        fs::write(&tmp, bincode::serialize(&manifest)?)?;
        fs::rename(&tmp, self.dir.join(MANIFEST_FILENAME))?;
        Ok(())
    }
}
