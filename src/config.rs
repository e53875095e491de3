//! Configuration for bucketkv
//!
//! Centralized configuration with sensible defaults. Every recognized option of the
//! storage tier lives here; the embedded engine's tuning knobs are projected into
//! [`DbOptions`] per instance.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BucketError, Result};
use crate::lsm::DbOptions;

/// Main configuration for a storage manager
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------
    /// Root directory for all instance stores
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── ldb0/            (instance 0: wal.log, sstables/, gc.meta)
    ///     ├── ldb1/
    ///     └── ...
    pub data_dir: PathBuf,

    /// Number of engine instances the buckets are sharded over
    pub instance_count: usize,

    /// Total number of buckets in the cluster (ids are `0..bucket_count`)
    pub bucket_count: u32,

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------
    /// Bucket → instance strategy
    pub indexer_strategy: IndexerStrategy,

    /// Directory holding the map-strategy index file (defaults to `data_dir`)
    pub bucket_index_dir: Option<PathBuf>,

    // -------------------------------------------------------------------------
    // Instance Behaviour
    // -------------------------------------------------------------------------
    /// Whether instances honour per-key versions at all
    pub db_version_care: bool,

    /// Attach a read cache in front of each instance
    pub use_cache: bool,

    /// Read cache capacity in bytes (per manager)
    pub cache_size: usize,

    /// Max items returned by one `get_next_items` call during scans
    pub migrate_batch_count: usize,

    /// Max bytes returned by one `get_next_items` call during scans
    pub migrate_batch_size: usize,

    // -------------------------------------------------------------------------
    // Background Compaction
    // -------------------------------------------------------------------------
    /// Hours of the day (local time) in which compaction may run
    pub compact_hour_range: HourRange,

    /// How often the scheduler wakes up
    pub check_compact_interval: Duration,

    /// Minimum pause between two full compaction rounds
    pub full_compaction_interval: Duration,

    // -------------------------------------------------------------------------
    // Engine Tuning
    // -------------------------------------------------------------------------
    /// fsync the WAL on every write
    pub write_sync: bool,

    /// Verify SSTable data checksums when opening tables
    pub read_verify_checksums: bool,

    /// Memtable size (bytes) before it is flushed to an SSTable
    pub write_buffer_size: usize,

    /// Max size of one compaction output file
    pub target_file_size: u64,

    /// Bytes of data covered by one sparse index entry
    pub block_size: usize,

    /// Value compression for SSTables
    pub compression: CompressionType,

    /// L0 file count that triggers an automatic compaction
    pub l0_compaction_trigger: usize,

    /// L0 file count at which writers are slowed down
    pub l0_slowdown_writes_trigger: usize,

    /// L0 file count at which writers compact inline before proceeding
    pub l0_stop_writes_trigger: usize,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// SSTable value compression codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = BucketError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Snappy),
            other => Err(BucketError::Config(format!("unknown compression id {}", other))),
        }
    }
}

/// Bucket indexer strategy name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerStrategy {
    /// Stateless `hash(bucket) % instances`
    Hash,
    /// Persisted explicit bucket → instance map
    Map,
}

impl FromStr for IndexerStrategy {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "hash" => Ok(IndexerStrategy::Hash),
            "map" => Ok(IndexerStrategy::Map),
            other => Err(BucketError::Config(format!("unknown bucket indexer strategy: {}", other))),
        }
    }
}

impl fmt::Display for IndexerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerStrategy::Hash => write!(f, "hash"),
            IndexerStrategy::Map => write!(f, "map"),
        }
    }
}

/// Hour-of-day window, `min-max`. Wraps past midnight when `min > max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourRange {
    pub min: u32,
    pub max: u32,
}

impl HourRange {
    /// Every hour of the day
    pub const ALL_DAY: HourRange = HourRange { min: 0, max: 23 };

    /// Parse `"2-7"` or `"22~5"`
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || BucketError::Config(format!("bad compaction hour range: {:?}", s));

        let (min, max) = s.split_once(|c| c == '-' || c == '~').ok_or_else(bad)?;
        let min: u32 = min.trim().parse().map_err(|_| bad())?;
        let max: u32 = max.trim().parse().map_err(|_| bad())?;
        if min > 23 || max > 23 {
            return Err(bad());
        }
        Ok(Self { min, max })
    }

    /// Whether `hour` (0..24) falls inside the window, both ends inclusive
    pub fn contains(&self, hour: u32) -> bool {
        if self.min <= self.max {
            hour >= self.min && hour <= self.max
        } else {
            hour >= self.min || hour <= self.max
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./bucketkv_data"),
            instance_count: 1,
            bucket_count: 1024,
            indexer_strategy: IndexerStrategy::Hash,
            bucket_index_dir: None,
            db_version_care: true,
            use_cache: false,
            cache_size: 64 * 1024 * 1024, // 64 MB
            migrate_batch_count: 2000,
            migrate_batch_size: 1024 * 1024, // 1 MB
            compact_hour_range: HourRange { min: 2, max: 7 },
            check_compact_interval: Duration::from_secs(60),
            full_compaction_interval: Duration::from_secs(12 * 3600),
            write_sync: false,
            read_verify_checksums: false,
            write_buffer_size: 4 * 1024 * 1024, // 4 MB
            target_file_size: 2 * 1024 * 1024,  // 2 MB
            block_size: 4096,
            compression: CompressionType::Snappy,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory of the store owned by instance `index`
    pub fn instance_dir(&self, index: usize) -> PathBuf {
        self.data_dir.join(format!("ldb{}", index))
    }

    /// Directory holding the map-strategy index file
    pub fn index_dir(&self) -> PathBuf {
        self.bucket_index_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }

    /// Engine options for one instance
    pub fn db_options(&self) -> DbOptions {
        DbOptions {
            wal_sync_strategy: if self.write_sync {
                WalSyncStrategy::EveryWrite
            } else {
                WalSyncStrategy::EveryNEntries { count: 100 }
            },
            write_buffer_size: self.write_buffer_size,
            target_file_size: self.target_file_size,
            block_size: self.block_size,
            compression: self.compression,
            verify_checksums: self.read_verify_checksums,
            l0_compaction_trigger: self.l0_compaction_trigger,
            l0_slowdown_writes_trigger: self.l0_slowdown_writes_trigger,
            l0_stop_writes_trigger: self.l0_stop_writes_trigger,
        }
    }

    /// Reject combinations the storage tier cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.instance_count == 0 {
            return Err(BucketError::Config("instance_count must be > 0".to_string()));
        }
        if self.bucket_count == 0 || self.bucket_count > crate::codec::MAX_BUCKET_NUMBER {
            return Err(BucketError::Config(format!(
                "bucket_count must be in 1..={}",
                crate::codec::MAX_BUCKET_NUMBER
            )));
        }
        if !(self.l0_compaction_trigger <= self.l0_slowdown_writes_trigger
            && self.l0_slowdown_writes_trigger <= self.l0_stop_writes_trigger)
        {
            return Err(BucketError::Config(
                "L0 triggers must satisfy compaction <= slowdown <= stop".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all instance stores)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the number of engine instances
    pub fn instance_count(mut self, count: usize) -> Self {
        self.config.instance_count = count;
        self
    }

    /// Set the total number of buckets
    pub fn bucket_count(mut self, count: u32) -> Self {
        self.config.bucket_count = count;
        self
    }

    /// Set the bucket indexer strategy
    pub fn indexer_strategy(mut self, strategy: IndexerStrategy) -> Self {
        self.config.indexer_strategy = strategy;
        self
    }

    /// Set the directory of the bucket index file
    pub fn bucket_index_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.bucket_index_dir = Some(path.into());
        self
    }

    /// Enable or disable per-key version checks
    pub fn db_version_care(mut self, care: bool) -> Self {
        self.config.db_version_care = care;
        self
    }

    /// Attach a read cache of `size` bytes
    pub fn cache(mut self, enabled: bool, size: usize) -> Self {
        self.config.use_cache = enabled;
        self.config.cache_size = size;
        self
    }

    /// Set scan batch limits
    pub fn migrate_batch(mut self, count: usize, size: usize) -> Self {
        self.config.migrate_batch_count = count;
        self.config.migrate_batch_size = size;
        self
    }

    /// Set the compaction hour window
    pub fn compact_hour_range(mut self, range: HourRange) -> Self {
        self.config.compact_hour_range = range;
        self
    }

    /// Set the scheduler tick interval
    pub fn check_compact_interval(mut self, interval: Duration) -> Self {
        self.config.check_compact_interval = interval;
        self
    }

    /// Set the pause between full compaction rounds
    pub fn full_compaction_interval(mut self, interval: Duration) -> Self {
        self.config.full_compaction_interval = interval;
        self
    }

    /// fsync the WAL on every write
    pub fn write_sync(mut self, sync: bool) -> Self {
        self.config.write_sync = sync;
        self
    }

    /// Verify SSTable checksums on open
    pub fn read_verify_checksums(mut self, verify: bool) -> Self {
        self.config.read_verify_checksums = verify;
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the compaction output file size (in bytes)
    pub fn target_file_size(mut self, size: u64) -> Self {
        self.config.target_file_size = size;
        self
    }

    /// Set the SSTable index block size (in bytes)
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the SSTable value compression
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the L0 compaction / slowdown / stop triggers
    pub fn l0_triggers(mut self, compaction: usize, slowdown: usize, stop: usize) -> Self {
        self.config.l0_compaction_trigger = compaction;
        self.config.l0_slowdown_writes_trigger = slowdown;
        self.config.l0_stop_writes_trigger = stop;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
