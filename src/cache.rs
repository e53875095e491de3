//! Read Cache
//!
//! Optional cache in front of the instances. Instances only talk to it through
//! the narrow [`ReadCache`] contract (raw get/put/remove of encoded item
//! records), so any store can sit behind it. [`LruReadCache`] is the bundled
//! implementation: an LRU bounded by bytes rather than entries.
//!
//! Cache failures never fail a request whose engine step succeeded; callers
//! log and move on.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::codec::area_of;
use crate::error::{BucketError, Result};

/// Raw record cache consulted by instances
pub trait ReadCache: Send + Sync {
    /// Cached item record (metadata + payload) for `key` in `bucket`
    fn raw_get(&self, bucket: u32, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store an item record
    fn raw_put(&self, bucket: u32, key: &[u8], record: &[u8]) -> Result<()>;

    /// Invalidate one entry
    fn raw_remove(&self, bucket: u32, key: &[u8]) -> Result<()>;

    /// Invalidate every entry of `area`; returns how many were dropped
    fn clear_area(&self, area: u16) -> Result<usize>;

    /// Invalidate every entry of `bucket`; returns how many were dropped
    fn clear_bucket(&self, bucket: u32) -> Result<usize>;
}

/// (bucket, user key)
type CacheKey = (u32, Vec<u8>);

/// Cache statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct LruState {
    lru: LruCache<CacheKey, Vec<u8>>,
    used_bytes: usize,
    hits: u64,
    misses: u64,
}

impl LruState {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(old) = self.lru.pop(key) {
            self.used_bytes -= charge(key, &old);
        }
    }
}

/// Bytes charged for one entry
fn charge(key: &CacheKey, record: &[u8]) -> usize {
    key.1.len() + record.len() + std::mem::size_of::<CacheKey>()
}

/// LRU cache bounded by total key + record bytes
pub struct LruReadCache {
    state: Mutex<LruState>,
    capacity_bytes: usize,
}

impl LruReadCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                lru: LruCache::unbounded(),
                used_bytes: 0,
                hits: 0,
                misses: 0,
            }),
            capacity_bytes,
        }
    }

    /// Cache holding at most `entries` records, regardless of size
    pub fn with_entry_limit(entries: NonZeroUsize, capacity_bytes: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                lru: LruCache::new(entries),
                used_bytes: 0,
                hits: 0,
                misses: 0,
            }),
            capacity_bytes,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.lru.len(),
            used_bytes: state.used_bytes,
            capacity_bytes: self.capacity_bytes,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

impl ReadCache for LruReadCache {
    fn raw_get(&self, bucket: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let found = state.lru.get(&(bucket, key.to_vec())).cloned();
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        Ok(found)
    }

    fn raw_put(&self, bucket: u32, key: &[u8], record: &[u8]) -> Result<()> {
        let cache_key = (bucket, key.to_vec());
        let size = charge(&cache_key, record);
        let mut state = self.state.lock();
        state.remove(&cache_key);
        if size > self.capacity_bytes {
            return Err(BucketError::InvalidArgument(format!(
                "record of {} bytes exceeds cache capacity {}",
                size, self.capacity_bytes
            )));
        }

        while state.used_bytes + size > self.capacity_bytes {
            match state.lru.pop_lru() {
                Some((k, v)) => state.used_bytes -= charge(&k, &v),
                None => break,
            }
        }
        // an entry-limited cache may evict on push
        if let Some((k, v)) = state.lru.push(cache_key, record.to_vec()) {
            state.used_bytes -= charge(&k, &v);
        }
        state.used_bytes += size;
        Ok(())
    }

    fn raw_remove(&self, bucket: u32, key: &[u8]) -> Result<()> {
        self.state.lock().remove(&(bucket, key.to_vec()));
        Ok(())
    }

    fn clear_area(&self, area: u16) -> Result<usize> {
        Ok(self.remove_matching(|(_, key)| area_of(key) == Some(area)))
    }

    fn clear_bucket(&self, bucket: u32) -> Result<usize> {
        Ok(self.remove_matching(|(b, _)| *b == bucket))
    }
}

impl LruReadCache {
    fn remove_matching(&self, matches: impl Fn(&CacheKey) -> bool) -> usize {
        let mut state = self.state.lock();
        let victims: Vec<CacheKey> = state
            .lru
            .iter()
            .filter(|(k, _)| matches(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &victims {
            state.remove(key);
        }
        victims.len()
    }
}
