//! Storage Manager
//!
//! Owns the engine instances, the bucket indexer and the shared read cache,
//! and routes every per-bucket request to the instance that owns the bucket.
//!
//! ```text
//!            put / get / remove / batch_put
//!                        │
//!                 ┌──────▼──────┐   writes only
//!                 │  WriteGate  │◄── pause/resume (balancer)
//!                 └──────┬──────┘
//!                 ┌──────▼──────┐
//!                 │BucketIndexer│  bucket → index
//!                 └──────┬──────┘
//!        ┌───────────────┼───────────────┐
//!   ┌────▼────┐     ┌────▼────┐     ┌────▼────┐
//!   │ ldb0    │     │ ldb1    │ ... │ ldbN-1  │
//!   └─────────┘     └─────────┘     └─────────┘
//! ```

mod gate;

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::balancer::{self, BalanceReport, Balancer};
use crate::cache::{CacheStats, LruReadCache, ReadCache};
use crate::codec::ItemMeta;
use crate::config::Config;
use crate::error::{BucketError, Result};
use crate::indexer::BucketIndexer;
use crate::instance::{
    BatchRecord, CachePolicy, Instance, InstanceOptions, InstanceStats, Item, UsageStat,
};

pub use gate::{GatePass, WriteGate};

/// State shared between the manager and its balancer thread
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) instances: Arc<[Arc<Instance>]>,
    pub(crate) indexer: BucketIndexer,
    pub(crate) gate: WriteGate,
    /// Serializes ownership changes (init/close/balance units)
    pub(crate) admin: Mutex<()>,
    cache: Option<Arc<LruReadCache>>,
}

impl Shared {
    /// Reject bucket ids outside the configured bucket space
    pub(crate) fn check_bucket(&self, bucket: u32) -> Result<()> {
        let bucket_count = self.config.bucket_count;
        if bucket >= bucket_count {
            return Err(BucketError::InvalidArgument(format!(
                "bucket {} outside [0, {})",
                bucket, bucket_count
            )));
        }
        Ok(())
    }

    /// Instance currently serving `bucket`
    pub(crate) fn route(&self, bucket: u32) -> Result<&Arc<Instance>> {
        self.check_bucket(bucket)?;
        self.indexer
            .lookup(bucket)
            .and_then(|index| self.instances.get(index))
            .filter(|instance| instance.exist(bucket))
            .ok_or(BucketError::InstanceUnavailable(bucket))
    }

    /// Tag data of buckets an instance holds but does not own
    pub(crate) fn purge_strays(&self) -> Result<usize> {
        let mut purged = 0;
        for instance in self.instances.iter() {
            for bucket in instance.stored_buckets()? {
                if instance.exist(bucket) || instance.is_fully_tagged(bucket) {
                    continue;
                }
                warn!(index = instance.index(), bucket, "Purging stray bucket");
                instance.tag_bucket_garbage(bucket)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// Aggregated usage across instances
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub instances: Vec<InstanceStats>,
    pub total: UsageStat,
    pub cache: Option<CacheStats>,
}

/// Bucket-sharded storage over N engine instances
pub struct StorageManager {
    shared: Arc<Shared>,
    balancer: Mutex<Option<Balancer>>,
}

impl StorageManager {
    /// Open every instance under `config.data_dir`
    ///
    /// With the map strategy and a persisted map for the same instance count,
    /// bucket ownership is restored from the map and stray buckets left by an
    /// interrupted migration are purged.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let cache = config
            .use_cache
            .then(|| Arc::new(LruReadCache::new(config.cache_size)));
        let options = InstanceOptions::from(&config);
        let instances = (0..config.instance_count)
            .map(|index| {
                let cache = cache.clone().map(|c| c as Arc<dyn ReadCache>);
                Instance::open(index, &config.instance_dir(index), options.clone(), cache)
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        let indexer = BucketIndexer::open(config.indexer_strategy, &config.index_dir())?;

        let shared = Arc::new(Shared {
            instances: instances.into(),
            indexer,
            gate: WriteGate::new(),
            admin: Mutex::new(()),
            cache,
            config,
        });

        let restored = shared.indexer.index_map();
        if !restored.is_empty() {
            shared.indexer.resize(shared.instances.len())?;
            let mut owned = vec![Vec::new(); shared.instances.len()];
            for (bucket, index) in restored {
                match owned.get_mut(index) {
                    Some(list) => list.push(bucket),
                    None => warn!(bucket, index, "Ignoring bucket mapped past the instance count"),
                }
            }
            for (instance, list) in shared.instances.iter().zip(&owned) {
                instance.init_buckets(list);
            }
            shared.purge_strays()?;
        }

        info!(
            instances = shared.instances.len(),
            strategy = %shared.indexer.strategy(),
            cache = shared.cache.is_some(),
            data_dir = %shared.config.data_dir.display(),
            "Storage manager opened"
        );
        Ok(Self {
            shared,
            balancer: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn instance_count(&self) -> usize {
        self.shared.instances.len()
    }

    pub fn instance(&self, index: usize) -> Option<&Arc<Instance>> {
        self.shared.instances.get(index)
    }

    pub fn indexer(&self) -> &BucketIndexer {
        &self.shared.indexer
    }

    /// Index of the instance serving `bucket`
    pub fn owner_of(&self, bucket: u32) -> Option<usize> {
        self.shared.route(bucket).ok().map(|instance| instance.index())
    }

    // =========================================================================
    // Data Path
    // =========================================================================

    pub fn put(
        &self,
        bucket: u32,
        key: &[u8],
        item: &Item,
        version_care: bool,
        expire_offset: u32,
    ) -> Result<ItemMeta> {
        let _pass = self.shared.gate.enter(bucket);
        self.shared
            .route(bucket)?
            .put(bucket, key, item, version_care, expire_offset, CachePolicy::Fill)
    }

    pub fn get(&self, bucket: u32, key: &[u8]) -> Result<Item> {
        self.shared.route(bucket)?.get(bucket, key)
    }

    pub fn remove(&self, bucket: u32, key: &[u8], version_care: bool, version: u16) -> Result<()> {
        let _pass = self.shared.gate.enter(bucket);
        self.shared
            .route(bucket)?
            .remove(bucket, key, version_care, version)
    }

    pub fn batch_put(
        &self,
        bucket: u32,
        area: u16,
        records: &[BatchRecord],
        version_care: bool,
    ) -> Result<()> {
        let _pass = self.shared.gate.enter(bucket);
        self.shared
            .route(bucket)?
            .batch_put(bucket, area, records, version_care)
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Take ownership of `ids` in addition to the buckets already served
    ///
    /// All buckets are redistributed by the indexer; a bucket that changes
    /// instance here is closed on its old instance without copying data
    /// (use `balance` to move data).
    pub fn init_buckets(&self, ids: &[u32]) -> Result<()> {
        for bucket in ids {
            self.shared.check_bucket(*bucket)?;
        }

        let _admin = self.shared.admin.lock();
        let mut all: BTreeSet<u32> = self
            .shared
            .instances
            .iter()
            .flat_map(|instance| instance.get_buckets())
            .collect();
        all.extend(ids.iter().copied());
        let all: Vec<u32> = all.into_iter().collect();

        let lists = self.shared.indexer.assign(self.shared.instances.len(), &all)?;
        for (instance, list) in self.shared.instances.iter().zip(&lists) {
            let keep: BTreeSet<u32> = list.iter().copied().collect();
            let leaving: Vec<u32> = instance
                .get_buckets()
                .into_iter()
                .filter(|b| !keep.contains(b))
                .collect();
            if !leaving.is_empty() {
                instance.close_buckets(&leaving)?;
            }
            instance.init_buckets(list);
        }
        let purged = self.shared.purge_strays()?;
        info!(requested = ids.len(), total = all.len(), purged, "Buckets initialized");
        Ok(())
    }

    /// Stop serving `ids`; their data becomes garbage
    pub fn close_buckets(&self, ids: &[u32]) -> Result<()> {
        let _admin = self.shared.admin.lock();
        for instance in self.shared.instances.iter() {
            let owned: Vec<u32> = ids.iter().copied().filter(|b| instance.exist(*b)).collect();
            if !owned.is_empty() {
                instance.close_buckets(&owned)?;
            }
        }
        info!(buckets = ?ids, "Buckets closed");
        Ok(())
    }

    /// Drop every record of `area` on every instance
    pub fn clear(&self, area: u16) -> Result<()> {
        for instance in self.shared.instances.iter() {
            instance.clear_area(area)?;
        }
        Ok(())
    }

    pub fn flush_memtable(&self) -> Result<()> {
        for instance in self.shared.instances.iter() {
            instance.flush()?;
        }
        debug!("Memtables flushed");
        Ok(())
    }

    /// Start every instance over with an empty store
    pub fn reset_database(&self) -> Result<()> {
        let _admin = self.shared.admin.lock();
        for instance in self.shared.instances.iter() {
            instance.reset()?;
        }
        Ok(())
    }

    /// Manual compaction on every instance
    pub fn compact(&self) -> Result<()> {
        for instance in self.shared.instances.iter() {
            instance.compact()?;
        }
        Ok(())
    }

    pub fn pause_compaction(&self) {
        self.shared.instances.iter().for_each(|i| i.pause_compaction());
    }

    pub fn resume_compaction(&self) {
        self.shared.instances.iter().for_each(|i| i.resume_compaction());
    }

    pub fn get_stats(&self) -> ManagerStats {
        let instances: Vec<InstanceStats> =
            self.shared.instances.iter().map(|i| i.stats()).collect();
        let mut total = UsageStat::default();
        for stat in instances.iter().flat_map(|s| s.buckets.values()) {
            total += *stat;
        }
        ManagerStats {
            instances,
            total,
            cache: self.shared.cache.as_ref().map(|c| c.stats()),
        }
    }

    /// Block new writes to `bucket` until resumed
    pub fn pause_service(&self, bucket: u32) {
        self.shared.gate.pause(bucket);
    }

    pub fn resume_service(&self, bucket: u32) {
        self.shared.gate.resume(bucket);
    }

    pub fn is_service_paused(&self, bucket: u32) -> bool {
        self.shared.gate.is_paused(bucket)
    }

    /// Reroute `bucket` without moving data
    pub fn reindex(&self, bucket: u32, from: usize, to: usize) -> Result<()> {
        self.shared.indexer.reindex(bucket, from, to)
    }

    // =========================================================================
    // Balancing
    // =========================================================================

    /// Start a background balancing run
    pub fn balance(&self) -> Result<()> {
        let mut slot = self.balancer.lock();
        if slot.as_ref().map_or(false, |b| !b.is_finished()) {
            return Err(BucketError::InvalidArgument("balancer already running".into()));
        }
        if let Some(previous) = slot.take() {
            previous.join();
        }
        *slot = Some(Balancer::start(Arc::clone(&self.shared))?);
        Ok(())
    }

    /// Run one balancing pass on the calling thread
    pub fn balance_now(&self) -> Result<BalanceReport> {
        balancer::run(&self.shared, &|| false)
    }

    pub fn is_balancing(&self) -> bool {
        self.balancer
            .lock()
            .as_ref()
            .map_or(false, |b| !b.is_finished())
    }

    /// Wait for the background run and return its report
    pub fn wait_balance(&self) -> Option<BalanceReport> {
        self.balancer.lock().take().and_then(Balancer::join)
    }

    /// Ask the background run to stop after the current unit
    pub fn stop_balance(&self) -> Option<BalanceReport> {
        self.balancer.lock().take().and_then(Balancer::stop)
    }

    /// Stop background work and close every instance
    pub fn close(&self) -> Result<()> {
        self.stop_balance();
        for instance in self.shared.instances.iter() {
            instance.close()?;
        }
        info!("Storage manager closed");
        Ok(())
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        if let Some(balancer) = self.balancer.get_mut().take() {
            balancer.stop();
        }
    }
}
