//! Engine Instance
//!
//! One LSM store plus everything that turns it into bucket storage: the key
//! and item codec, version-care, expiration, usage counters, the optional
//! read cache with its lock stripe, garbage tags and the compaction
//! scheduler.
//!
//! ## Layout on disk
//! ```text
//! {data_dir}/ldb{index}/
//!   ├── wal.log
//!   ├── sstables/
//!   └── gc.meta
//! ```

mod scan;
mod stat;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use xxhash_rust::xxh32::xxh32;

use crate::cache::ReadCache;
use crate::codec::{
    area_of, decode_bucket, decode_item, encode_bucket_prefix, encode_item, encode_key, merge_area,
    ItemMeta, KEY_META_SIZE, MAX_BUCKET_NUMBER,
};
use crate::compaction::{self, CompactionScheduler, CompactionSettings};
use crate::config::Config;
use crate::error::{BucketError, Result};
use crate::gc::{GcComparator, GcFactory};
use crate::lsm::{Db, DbOptions, DbStats, WriteBatch};
use crate::util::now_secs;

pub use scan::ScanItem;
pub(crate) use scan::MigratedChange;
pub use stat::{StatTable, UsageCounter, UsageStat};

use scan::ScanCursor;

/// Stripe size of the per-key lock array
pub const LOCKER_SIZE: usize = 1024;

const LOCK_HASH_SEED: u32 = 97;

const GC_META_FILENAME: &str = "gc.meta";

// =============================================================================
// Public Types
// =============================================================================

/// A stored value: metadata plus payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub meta: ItemMeta,
    pub payload: Vec<u8>,
}

impl Item {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            meta: ItemMeta::default(),
            payload: payload.into(),
        }
    }

    /// Item carrying an expected version for version-care writes
    pub fn with_version(payload: impl Into<Vec<u8>>, version: u16) -> Self {
        let mut item = Self::new(payload);
        item.meta.version = version;
        item
    }
}

/// One record of a bulk import
#[derive(Debug, Clone)]
pub struct BatchRecord {
    /// User key without the area prefix
    pub key: Vec<u8>,
    pub item: Item,
    pub expire_offset: u32,
}

/// What a put does with the read cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Write the new record through to the cache
    #[default]
    Fill,
    /// Invalidate the cached record
    Skip,
}

/// Instance-level tuning
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    pub db_version_care: bool,
    pub migrate_batch_count: usize,
    pub migrate_batch_size: usize,
    pub db: DbOptions,
    pub compaction: CompactionSettings,
}

impl From<&Config> for InstanceOptions {
    fn from(config: &Config) -> Self {
        Self {
            db_version_care: config.db_version_care,
            migrate_batch_count: config.migrate_batch_count,
            migrate_batch_size: config.migrate_batch_size,
            db: config.db_options(),
            compaction: CompactionSettings::from(config),
        }
    }
}

/// Usage snapshot of one instance
#[derive(Debug, Clone, Default)]
pub struct InstanceStats {
    pub index: usize,
    pub buckets: std::collections::BTreeMap<u32, UsageStat>,
    pub areas: std::collections::BTreeMap<u16, UsageStat>,
    pub db: DbStats,
    /// (bucket tags, area tags) awaiting compaction
    pub pending_gc: (usize, usize),
}

// =============================================================================
// Store
// =============================================================================

/// The LSM store of an instance with its garbage registry
///
/// Replaced wholesale by `reset`. A replaced store's directory is removed
/// once the last handle to it is dropped.
pub struct InstanceStore {
    db: Db,
    gc: Arc<GcFactory>,
    // dropped after `db`, so the store's files are closed first
    retired: RetiredDir,
}

impl InstanceStore {
    pub(crate) fn open(path: &Path, options: DbOptions) -> Result<Self> {
        fs::create_dir_all(path)?;
        let gc = Arc::new(GcFactory::open(&path.join(GC_META_FILENAME))?);
        let comparator = Arc::new(GcComparator::new(Arc::clone(&gc)));
        let db = Db::open(path, options, comparator)?;
        // a tag may have been saved for writes the WAL never made durable;
        // new writes must land above it or they read as garbage
        db.advance_sequence(gc.max_sequence());
        Ok(Self {
            db,
            gc,
            retired: RetiredDir::default(),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn gc(&self) -> &Arc<GcFactory> {
        &self.gc
    }
}

#[derive(Default)]
struct RetiredDir(Mutex<Option<PathBuf>>);

impl Drop for RetiredDir {
    fn drop(&mut self) {
        if let Some(path) = self.0.get_mut().take() {
            match fs::remove_dir_all(&path) {
                Ok(()) => info!(path = %path.display(), "Removed retired store"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove retired store"),
            }
        }
    }
}

/// Stored version of a key, as seen by a read-modify-write
#[derive(Debug, Clone, Copy)]
struct StoredItem {
    meta: ItemMeta,
    usage: UsageStat,
}

// =============================================================================
// Instance
// =============================================================================

/// One engine instance serving the buckets assigned to it
pub struct Instance {
    index: usize,
    path: PathBuf,
    options: InstanceOptions,
    store: RwLock<Arc<InstanceStore>>,
    cache: Option<Arc<dyn ReadCache>>,
    /// Only allocated with a cache attached
    locks: Option<Box<[Mutex<()>]>>,
    stats: StatTable,
    scheduler: Mutex<Option<CompactionScheduler>>,
    scan: Mutex<Option<ScanCursor>>,
}

impl Instance {
    /// Open (or create) the store at `path` and start its compaction scheduler
    pub fn open(
        index: usize,
        path: &Path,
        options: InstanceOptions,
        cache: Option<Arc<dyn ReadCache>>,
    ) -> Result<Self> {
        let store = Arc::new(InstanceStore::open(path, options.db.clone())?);
        let scheduler =
            CompactionScheduler::start(&format!("ldb{}", index), Arc::clone(&store), options.compaction)?;
        let locks = cache
            .as_ref()
            .map(|_| (0..LOCKER_SIZE).map(|_| Mutex::new(())).collect());

        info!(
            index,
            path = %path.display(),
            cache = cache.is_some(),
            version_care = options.db_version_care,
            "Instance opened"
        );
        Ok(Self {
            index,
            path: path.to_path_buf(),
            options,
            store: RwLock::new(store),
            cache,
            locks,
            stats: StatTable::new(),
            scheduler: Mutex::new(Some(scheduler)),
            scan: Mutex::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    /// Current store
    pub fn store(&self) -> Arc<InstanceStore> {
        Arc::clone(&self.store.read())
    }

    pub fn latest_sequence(&self) -> u64 {
        self.store().db().latest_sequence()
    }

    fn lock_for(&self, key: &[u8]) -> Option<MutexGuard<'_, ()>> {
        self.locks
            .as_ref()
            .map(|locks| locks[xxh32(key, LOCK_HASH_SEED) as usize % locks.len()].lock())
    }

    // =========================================================================
    // Data Path
    // =========================================================================

    /// Store `item` under `key`
    ///
    /// With `version_care` (and version care enabled on the instance) a
    /// non-zero `item.meta.version` must equal the stored version. The stored
    /// version is then incremented; without version care the caller's version
    /// is stored. `expire_offset` is 0 (never), an absolute unix time, or a
    /// number of seconds from now.
    pub fn put(
        &self,
        bucket: u32,
        key: &[u8],
        item: &Item,
        version_care: bool,
        expire_offset: u32,
        policy: CachePolicy,
    ) -> Result<ItemMeta> {
        validate(bucket, key)?;
        let _guard = self.lock_for(key);
        let store = self.store();
        let check_version = version_care && self.options.db_version_care;
        let now = now_secs();
        let lookup = encode_key(bucket, key, 0);

        let (_, (meta, old, record)) = store.db().write_with(|db| {
            let old = read_stored(db, &lookup)?;
            if check_version {
                if let Some(stored) = &old {
                    check_expected_version(item.meta.version, stored.meta.version)?;
                }
            }

            let meta = ItemMeta {
                flag: item.meta.flag,
                reserved: 0,
                version: if version_care {
                    next_version(old.map_or(0, |o| o.meta.version))
                } else {
                    item.meta.version
                },
                cdate: old.map_or(now, |o| o.meta.cdate),
                mdate: now,
                edate: expire_time(expire_offset, now),
            };
            let record = encode_item(&meta, &item.payload);
            let mut batch = WriteBatch::new();
            batch.put(&encode_key(bucket, key, meta.edate), &record);
            Ok((batch, (meta, old, record)))
        })?;

        let mut delta = usage(key.len(), item.payload.len());
        if let Some(old) = old {
            delta -= old.usage;
        }
        self.stats.add(bucket, area_of(key), delta);

        if let Some(cache) = &self.cache {
            let result = match policy {
                CachePolicy::Fill => cache.raw_put(bucket, key, &record),
                CachePolicy::Skip => cache.raw_remove(bucket, key),
            };
            if let Err(e) = result {
                warn!(bucket, error = %e, "Cache update after put failed");
            }
        }

        debug!(
            bucket,
            key_len = key.len(),
            value_len = item.payload.len(),
            version = meta.version,
            edate = meta.edate,
            "put"
        );
        Ok(meta)
    }

    /// Read `key`; absent, expired and garbage records are `NotFound`
    pub fn get(&self, bucket: u32, key: &[u8]) -> Result<Item> {
        validate(bucket, key)?;
        let now = now_secs();

        if let Some(cache) = &self.cache {
            match cache.raw_get(bucket, key) {
                Ok(Some(record)) => {
                    let (meta, payload) = decode_item(&record);
                    if !meta.is_expired(now) {
                        return Ok(Item {
                            meta,
                            payload: payload.to_vec(),
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(bucket, error = %e, "Cache read failed"),
            }
        }

        let _guard = self.lock_for(key);
        let store = self.store();
        let stored = store
            .db()
            .get(&encode_key(bucket, key, 0))?
            .ok_or(BucketError::NotFound)?;
        let sequence = stored.sequence;
        let record = stored.value.ok_or(BucketError::NotFound)?;
        let (meta, payload) = decode_item(&record);
        if meta.is_expired(now) {
            return Err(BucketError::NotFound);
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.raw_put(bucket, key, &record) {
                warn!(bucket, error = %e, "Cache fill failed");
            }
            // a close or area clear may have emptied the cache between the
            // read and the fill; the tag it left behind is still visible
            if store.gc().should_drop(bucket, area_of(key), sequence) {
                if let Err(e) = cache.raw_remove(bucket, key) {
                    warn!(bucket, error = %e, "Cache invalidation of garbage failed");
                }
            }
        }
        Ok(Item {
            meta,
            payload: payload.to_vec(),
        })
    }

    /// Delete `key`, with the same version check as `put`
    pub fn remove(&self, bucket: u32, key: &[u8], version_care: bool, version: u16) -> Result<()> {
        validate(bucket, key)?;
        let _guard = self.lock_for(key);
        let store = self.store();
        let check_version = version_care && self.options.db_version_care;
        let lookup = encode_key(bucket, key, 0);

        let (_, old) = store.db().write_with(|db| {
            let old = read_stored(db, &lookup)?.ok_or(BucketError::NotFound)?;
            if check_version {
                check_expected_version(version, old.meta.version)?;
            }
            let mut batch = WriteBatch::new();
            batch.delete(&lookup);
            Ok((batch, old))
        })?;

        self.stats.add(bucket, area_of(key), -old.usage);
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.raw_remove(bucket, key) {
                warn!(bucket, error = %e, "Cache invalidation after remove failed");
            }
        }
        debug!(bucket, key_len = key.len(), "remove");
        Ok(())
    }

    /// Bulk import into `area` of `bucket` as one write batch
    ///
    /// Takes no per-key lock and leaves the cache untouched: only safe while
    /// no foreground traffic touches the same keys.
    pub fn batch_put(
        &self,
        bucket: u32,
        area: u16,
        records: &[BatchRecord],
        version_care: bool,
    ) -> Result<()> {
        if records.is_empty() {
            return Err(BucketError::InvalidArgument("empty batch".into()));
        }
        let store = self.store();
        let now = now_secs();
        let db_version_care = self.options.db_version_care;

        let (_, delta) = store.db().write_with(|db| {
            let mut batch = WriteBatch::new();
            let mut delta = UsageStat::default();
            for record in records {
                let key = merge_area(area, &record.key);
                validate(bucket, &key)?;

                let old = if db_version_care {
                    read_stored(db, &encode_key(bucket, &key, 0))?
                } else {
                    None
                };
                if version_care {
                    if let Some(stored) = &old {
                        check_expected_version(record.item.meta.version, stored.meta.version)?;
                    }
                }

                let meta = ItemMeta {
                    flag: record.item.meta.flag,
                    reserved: 0,
                    version: if version_care {
                        next_version(old.map_or(0, |o| o.meta.version))
                    } else {
                        record.item.meta.version
                    },
                    cdate: old.map_or(now, |o| o.meta.cdate),
                    mdate: now,
                    edate: expire_time(record.expire_offset, now),
                };
                batch.put(
                    &encode_key(bucket, &key, meta.edate),
                    &encode_item(&meta, &record.item.payload),
                );

                delta += usage(key.len(), record.item.payload.len());
                if let Some(old) = old {
                    delta -= old.usage;
                }
            }
            Ok((batch, delta))
        })?;

        self.stats.add(bucket, Some(area), delta);
        debug!(bucket, area, count = records.len(), "batch_put");
        Ok(())
    }

    // =========================================================================
    // Bucket Lifecycle
    // =========================================================================

    /// Register ownership of `ids`
    pub fn init_buckets(&self, ids: &[u32]) {
        let added = self.stats.init_buckets(ids);
        if !added.is_empty() {
            info!(index = self.index, buckets = ?added, "Buckets initialized");
        }
    }

    /// Drop ownership of `ids` and tag their data as garbage
    pub fn close_buckets(&self, ids: &[u32]) -> Result<()> {
        let store = self.store();
        let sequence = store.db().latest_sequence();
        let when = now_secs();
        for bucket in ids {
            store.gc().add_bucket(*bucket, sequence, when)?;
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.clear_bucket(*bucket) {
                    warn!(bucket, error = %e, "Cache clear for closed bucket failed");
                }
            }
        }
        let removed = self.stats.close_buckets(ids);
        warn!(index = self.index, buckets = ?ids, registered = ?removed, sequence, "Buckets closed and tagged as garbage");
        Ok(())
    }

    /// Tag everything currently stored for `bucket` as garbage, without
    /// touching ownership
    pub fn tag_bucket_garbage(&self, bucket: u32) -> Result<()> {
        let store = self.store();
        let sequence = store.db().latest_sequence();
        store.gc().add_bucket(bucket, sequence, now_secs())?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.clear_bucket(bucket) {
                warn!(bucket, error = %e, "Cache clear for garbage bucket failed");
            }
        }
        Ok(())
    }

    /// Mark every record of `area` as garbage and reset its counters
    pub fn clear_area(&self, area: u16) -> Result<()> {
        let store = self.store();
        let sequence = store.db().latest_sequence();
        store.gc().add_area(area, sequence, now_secs())?;
        self.stats.clear_area(area);
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.clear_area(area) {
                warn!(area, error = %e, "Cache clear for area failed");
            }
        }
        warn!(index = self.index, area, sequence, "Area cleared");
        Ok(())
    }

    pub fn exist(&self, bucket: u32) -> bool {
        self.stats.contains(bucket)
    }

    pub fn get_buckets(&self) -> Vec<u32> {
        self.stats.bucket_ids()
    }

    pub fn bucket_count(&self) -> usize {
        self.stats.bucket_count()
    }

    /// Distinct buckets with at least one record still in the store
    ///
    /// Hidden records count too: tombstones, expired items and tagged garbage
    /// all occupy space until compaction removes them. Each bucket costs one
    /// seek.
    pub fn stored_buckets(&self) -> Result<Vec<u32>> {
        let store = self.store();
        let mut found = Vec::new();
        let mut start: Vec<u8> = Vec::new();
        loop {
            let batch = store.db().scan(&start, true, None, 1, 0, true)?;
            let Some(record) = batch.records.first() else {
                break;
            };
            let bucket = decode_bucket(&record.key);
            found.push(bucket);
            if bucket >= MAX_BUCKET_NUMBER {
                break;
            }
            start = encode_bucket_prefix(bucket + 1).to_vec();
        }
        Ok(found)
    }

    /// True when a garbage tag for `bucket` already covers every write this
    /// store has made
    pub fn is_fully_tagged(&self, bucket: u32) -> bool {
        let store = self.store();
        store
            .gc()
            .bucket_tag(bucket)
            .map_or(false, |tag| tag.sequence >= store.db().latest_sequence())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Force the memtable to disk
    pub fn flush(&self) -> Result<()> {
        self.store().db().flush()
    }

    /// Compact every pending garbage range, then run a full round
    pub fn compact(&self) -> Result<()> {
        let store = self.store();
        compaction::compact_pending(&store, &|| false)?;
        compaction::full_round(&store)?;
        Ok(())
    }

    pub fn pause_compaction(&self) {
        if let Some(scheduler) = self.scheduler.lock().as_ref() {
            scheduler.pause();
        }
    }

    pub fn resume_compaction(&self) {
        if let Some(scheduler) = self.scheduler.lock().as_ref() {
            scheduler.resume();
        }
    }

    pub fn is_compaction_paused(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .map_or(false, |scheduler| scheduler.is_paused())
    }

    pub fn stats(&self) -> InstanceStats {
        let store = self.store();
        InstanceStats {
            index: self.index,
            buckets: self.stats.bucket_stats(),
            areas: self.stats.area_stats(),
            db: store.db().stats(),
            pending_gc: store.gc().pending_counts(),
        }
    }

    /// Move the store aside and start over with an empty one
    ///
    /// Bucket membership is kept; counters are zeroed. The old directory is
    /// renamed to `ldb{index}.bak.{ts}` and removed once no request holds the
    /// old store any more.
    pub fn reset(&self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        *self.scan.lock() = None;

        let backup = backup_path(&self.path);
        fs::rename(&self.path, &backup)?;
        let fresh = Arc::new(InstanceStore::open(&self.path, self.options.db.clone())?);
        let old = std::mem::replace(&mut *self.store.write(), Arc::clone(&fresh));
        *old.retired.0.lock() = Some(backup.clone());
        drop(old);

        self.stats.reset_counters();
        if let Some(cache) = &self.cache {
            for bucket in self.stats.bucket_ids() {
                if let Err(e) = cache.clear_bucket(bucket) {
                    warn!(bucket, error = %e, "Cache clear during reset failed");
                }
            }
        }

        let scheduler = CompactionScheduler::start(
            &format!("ldb{}", self.index),
            fresh,
            self.options.compaction,
        )?;
        *self.scheduler.lock() = Some(scheduler);
        warn!(index = self.index, backup = %backup.display(), "Instance store reset");
        Ok(())
    }

    /// Stop background work and make pending writes durable
    pub fn close(&self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        self.store().db().close()?;
        info!(index = self.index, "Instance closed");
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate(bucket: u32, key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(BucketError::InvalidArgument("empty key".into()));
    }
    if bucket > MAX_BUCKET_NUMBER {
        return Err(BucketError::InvalidArgument(format!(
            "bucket {} exceeds {}",
            bucket, MAX_BUCKET_NUMBER
        )));
    }
    Ok(())
}

fn check_expected_version(expected: u16, stored: u16) -> Result<()> {
    if expected != 0 && expected != stored {
        return Err(BucketError::VersionConflict { expected, stored });
    }
    Ok(())
}

/// Next version after `current`; 0 is reserved for "any version"
fn next_version(current: u16) -> u16 {
    match current.wrapping_add(1) {
        0 => 1,
        v => v,
    }
}

/// Absolute expire time for an offset given at `now`
fn expire_time(offset: u32, now: u32) -> u32 {
    match offset {
        0 => 0,
        o if o >= now => o,
        o => now.saturating_add(o),
    }
}

/// Counters charged for one record
fn usage(user_key_len: usize, payload_len: usize) -> UsageStat {
    UsageStat {
        data_size: (user_key_len + payload_len) as i64,
        use_size: (KEY_META_SIZE + user_key_len + crate::codec::ITEM_META_SIZE + payload_len) as i64,
        item_count: 1,
    }
}

fn read_stored(db: &Db, lookup: &[u8]) -> Result<Option<StoredItem>> {
    let Some(record) = db.get(lookup)? else {
        return Ok(None);
    };
    let Some(value) = record.value else {
        return Ok(None);
    };
    let (meta, payload) = decode_item(&value);
    if meta.is_expired(now_secs()) {
        return Ok(None);
    }
    let user_key_len = record.key.len() - KEY_META_SIZE;
    Ok(Some(StoredItem {
        meta,
        usage: usage(user_key_len, payload.len()),
    }))
}

/// `{parent}/ldb{index}.bak.{ts}`, made unique when resets repeat within a second
fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ldb".to_string());
    let ts = now_secs();
    let mut candidate = path.with_file_name(format!("{}.bak.{}", name, ts));
    let mut n = 1;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{}.bak.{}.{}", name, ts, n));
        n += 1;
    }
    candidate
}
