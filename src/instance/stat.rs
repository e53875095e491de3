//! Usage counters
//!
//! Every instance keeps one counter per owned bucket and one per area.
//! The bucket map is republished copy-on-write: writers build a new map and
//! swap the `Arc`, readers keep whatever snapshot they cloned.

use std::collections::{BTreeMap, HashMap};
use std::ops::{AddAssign, Neg, SubAssign};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Point-in-time usage figures
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageStat {
    /// User-visible key + payload bytes
    pub data_size: i64,
    /// Stored key + record bytes (metadata included)
    pub use_size: i64,
    pub item_count: i64,
}

impl AddAssign for UsageStat {
    fn add_assign(&mut self, other: Self) {
        self.data_size += other.data_size;
        self.use_size += other.use_size;
        self.item_count += other.item_count;
    }
}

impl SubAssign for UsageStat {
    fn sub_assign(&mut self, other: Self) {
        self.data_size -= other.data_size;
        self.use_size -= other.use_size;
        self.item_count -= other.item_count;
    }
}

impl Neg for UsageStat {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            data_size: -self.data_size,
            use_size: -self.use_size,
            item_count: -self.item_count,
        }
    }
}

/// Lock-free usage counter
#[derive(Debug, Default)]
pub struct UsageCounter {
    data_size: AtomicI64,
    use_size: AtomicI64,
    item_count: AtomicI64,
}

impl UsageCounter {
    pub fn add(&self, delta: UsageStat) {
        self.data_size.fetch_add(delta.data_size, Ordering::Relaxed);
        self.use_size.fetch_add(delta.use_size, Ordering::Relaxed);
        self.item_count.fetch_add(delta.item_count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageStat {
        UsageStat {
            data_size: self.data_size.load(Ordering::Relaxed),
            use_size: self.use_size.load(Ordering::Relaxed),
            item_count: self.item_count.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.data_size.store(0, Ordering::Relaxed);
        self.use_size.store(0, Ordering::Relaxed);
        self.item_count.store(0, Ordering::Relaxed);
    }
}

type BucketMap = BTreeMap<u32, Arc<UsageCounter>>;

/// Bucket membership plus per-bucket and per-area usage of one instance
#[derive(Default)]
pub struct StatTable {
    buckets: RwLock<Arc<BucketMap>>,
    /// Serializes copy-on-write updates of `buckets`
    update_lock: Mutex<()>,
    areas: RwLock<HashMap<u16, Arc<UsageCounter>>>,
}

impl StatTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<BucketMap> {
        Arc::clone(&self.buckets.read())
    }

    /// Register buckets; existing counters are kept. Returns ids newly added.
    pub fn init_buckets(&self, ids: &[u32]) -> Vec<u32> {
        let _guard = self.update_lock.lock();
        let mut next = BucketMap::clone(&self.snapshot());
        let added: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|id| {
                if next.contains_key(id) {
                    false
                } else {
                    next.insert(*id, Arc::new(UsageCounter::default()));
                    true
                }
            })
            .collect();
        *self.buckets.write() = Arc::new(next);
        added
    }

    /// Deregister buckets. Returns ids that were registered.
    pub fn close_buckets(&self, ids: &[u32]) -> Vec<u32> {
        let _guard = self.update_lock.lock();
        let mut next = BucketMap::clone(&self.snapshot());
        let removed: Vec<u32> = ids.iter().copied().filter(|id| next.remove(id).is_some()).collect();
        *self.buckets.write() = Arc::new(next);
        removed
    }

    pub fn contains(&self, bucket: u32) -> bool {
        self.buckets.read().contains_key(&bucket)
    }

    pub fn bucket_ids(&self) -> Vec<u32> {
        self.snapshot().keys().copied().collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn area(&self, area: u16) -> Arc<UsageCounter> {
        if let Some(counter) = self.areas.read().get(&area) {
            return Arc::clone(counter);
        }
        Arc::clone(self.areas.write().entry(area).or_default())
    }

    /// Apply a delta to the bucket (if registered) and the area (if known)
    pub fn add(&self, bucket: u32, area: Option<u16>, delta: UsageStat) {
        if let Some(counter) = self.snapshot().get(&bucket) {
            counter.add(delta);
        }
        if let Some(area) = area {
            self.area(area).add(delta);
        }
    }

    /// Zero every bucket and area counter, keeping membership
    pub fn reset_counters(&self) {
        self.snapshot().values().for_each(|counter| counter.reset());
        self.areas.read().values().for_each(|counter| counter.reset());
    }

    /// Zero the counters of `area`
    pub fn clear_area(&self, area: u16) {
        if let Some(counter) = self.areas.read().get(&area) {
            counter.reset();
        }
    }

    pub fn bucket_stats(&self) -> BTreeMap<u32, UsageStat> {
        self.snapshot()
            .iter()
            .map(|(id, counter)| (*id, counter.snapshot()))
            .collect()
    }

    pub fn area_stats(&self) -> BTreeMap<u16, UsageStat> {
        self.areas
            .read()
            .iter()
            .map(|(id, counter)| (*id, counter.snapshot()))
            .collect()
    }
}
