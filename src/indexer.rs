//! Bucket Indexer
//!
//! Maps a bucket id to the index of the instance that owns it.
//!
//! ## Strategies
//! - `Hash`: `index = spread_hash(bucket) % total`. Stateless, so buckets
//!   cannot be moved and `reindex` is rejected.
//! - `Map`: explicit `bucket -> index` table persisted to
//!   `{dir}/ldb_bucket_index_map`. The file is rewritten (temp file + rename)
//!   before a new table is published, so a crash never leaves routing ahead of
//!   what was persisted.
//!
//! ## Map File Format
//! ```text
//! 3          <- instance count
//! 0:0
//! 1:2
//! ...        <- bucket:index, ascending bucket
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::IndexerStrategy;
use crate::error::{BucketError, Result};

pub const INDEX_MAP_FILENAME: &str = "ldb_bucket_index_map";

/// Bucket → instance routing
pub enum BucketIndexer {
    Hash(HashIndexer),
    Map(MapIndexer),
}

impl BucketIndexer {
    /// Create the indexer for `strategy`; the map strategy loads its file
    /// from `dir` when present
    pub fn open(strategy: IndexerStrategy, dir: &Path) -> Result<Self> {
        Ok(match strategy {
            IndexerStrategy::Hash => BucketIndexer::Hash(HashIndexer::default()),
            IndexerStrategy::Map => BucketIndexer::Map(MapIndexer::open(dir)?),
        })
    }

    pub fn strategy(&self) -> IndexerStrategy {
        match self {
            BucketIndexer::Hash(_) => IndexerStrategy::Hash,
            BucketIndexer::Map(_) => IndexerStrategy::Map,
        }
    }

    /// Distribute `buckets` over `total` instances; entry `i` lists the
    /// buckets of instance `i`
    pub fn assign(&self, total: usize, buckets: &[u32]) -> Result<Vec<Vec<u32>>> {
        if total == 0 {
            return Err(BucketError::InvalidArgument("instance count is 0".into()));
        }
        match self {
            BucketIndexer::Hash(hash) => Ok(hash.assign(total, buckets)),
            BucketIndexer::Map(map) => map.assign(total, buckets),
        }
    }

    pub fn lookup(&self, bucket: u32) -> Option<usize> {
        match self {
            BucketIndexer::Hash(hash) => hash.lookup(bucket),
            BucketIndexer::Map(map) => map.lookup(bucket),
        }
    }

    /// Move `bucket` from instance `from` to `to`
    pub fn reindex(&self, bucket: u32, from: usize, to: usize) -> Result<()> {
        match self {
            BucketIndexer::Hash(_) => Err(BucketError::InvalidArgument(
                "hash indexer cannot reindex buckets".into(),
            )),
            BucketIndexer::Map(map) => map.reindex(bucket, from, to),
        }
    }

    /// Record a new instance count without moving any bucket
    ///
    /// Buckets mapped past the new count stay unrouted until reassigned.
    pub fn resize(&self, total: usize) -> Result<()> {
        match self {
            BucketIndexer::Hash(_) => Ok(()),
            BucketIndexer::Map(map) => map.resize(total),
        }
    }

    /// Every assigned bucket with its owner
    pub fn index_map(&self) -> BTreeMap<u32, usize> {
        match self {
            BucketIndexer::Hash(hash) => hash.index_map(),
            BucketIndexer::Map(map) => map.snapshot().buckets.clone(),
        }
    }
}

// =============================================================================
// Hash Strategy
// =============================================================================

#[derive(Default)]
pub struct HashIndexer {
    state: RwLock<(usize, Vec<u32>)>,
}

/// Bucket ids are already uniformly distributed, so the spread is the identity
fn spread_hash(bucket: u32) -> u32 {
    bucket
}

impl HashIndexer {
    fn assign(&self, total: usize, buckets: &[u32]) -> Vec<Vec<u32>> {
        let mut lists = vec![Vec::new(); total];
        for bucket in buckets {
            lists[spread_hash(*bucket) as usize % total].push(*bucket);
        }
        *self.state.write() = (total, buckets.to_vec());
        lists
    }

    fn lookup(&self, bucket: u32) -> Option<usize> {
        match self.state.read().0 {
            0 => None,
            total => Some(spread_hash(bucket) as usize % total),
        }
    }

    fn index_map(&self) -> BTreeMap<u32, usize> {
        let state = self.state.read();
        state
            .1
            .iter()
            .map(|b| (*b, spread_hash(*b) as usize % state.0))
            .collect()
    }
}

// =============================================================================
// Map Strategy
// =============================================================================

/// One published routing table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMap {
    pub total: usize,
    pub buckets: BTreeMap<u32, usize>,
}

pub struct MapIndexer {
    path: PathBuf,
    map: RwLock<Arc<IndexMap>>,
    /// Serializes persist-then-publish
    update_lock: Mutex<()>,
}

impl MapIndexer {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(INDEX_MAP_FILENAME);
        let map = if path.exists() {
            let map = parse_map(&fs::read_to_string(&path)?)?;
            info!(path = %path.display(), total = map.total, buckets = map.buckets.len(), "Bucket index map loaded");
            map
        } else {
            IndexMap::default()
        };
        Ok(Self {
            path,
            map: RwLock::new(Arc::new(map)),
            update_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<IndexMap> {
        Arc::clone(&self.map.read())
    }

    fn lookup(&self, bucket: u32) -> Option<usize> {
        self.map.read().buckets.get(&bucket).copied()
    }

    /// Keep every bucket already within its instance's quota; move only the
    /// surplus to instances below theirs
    fn assign(&self, total: usize, buckets: &[u32]) -> Result<Vec<Vec<u32>>> {
        let _guard = self.update_lock.lock();
        let current = self.snapshot();

        let mut lists: Vec<Vec<u32>> = vec![Vec::new(); total];
        let mut pool = Vec::new();
        for bucket in buckets {
            match current.buckets.get(bucket) {
                Some(index) if *index < total => lists[*index].push(*bucket),
                _ => pool.push(*bucket),
            }
        }

        // the instances already holding the most keep the ceil quotas
        let floor = buckets.len() / total;
        let extra = buckets.len() % total;
        let mut by_size: Vec<usize> = (0..total).collect();
        by_size.sort_by(|a, b| lists[*b].len().cmp(&lists[*a].len()).then(a.cmp(b)));
        let mut quota = vec![floor; total];
        for index in by_size.into_iter().take(extra) {
            quota[index] += 1;
        }

        for (index, list) in lists.iter_mut().enumerate() {
            list.sort_unstable();
            while list.len() > quota[index] {
                if let Some(bucket) = list.pop() {
                    pool.push(bucket);
                }
            }
        }
        pool.sort_unstable();
        let mut pool = pool.into_iter();
        for (index, list) in lists.iter_mut().enumerate() {
            while list.len() < quota[index] {
                match pool.next() {
                    Some(bucket) => list.push(bucket),
                    None => break,
                }
            }
            list.sort_unstable();
        }

        let mut next = IndexMap {
            total,
            buckets: BTreeMap::new(),
        };
        for (index, list) in lists.iter().enumerate() {
            next.buckets.extend(list.iter().map(|b| (*b, index)));
        }
        let moved = next
            .buckets
            .iter()
            .filter(|(b, i)| current.buckets.get(b).map_or(false, |old| old != *i))
            .count();
        self.publish(next)?;
        info!(total, buckets = buckets.len(), moved, "Buckets assigned");
        Ok(lists)
    }

    fn reindex(&self, bucket: u32, from: usize, to: usize) -> Result<()> {
        let _guard = self.update_lock.lock();
        let current = self.snapshot();
        if to >= current.total {
            return Err(BucketError::InvalidArgument(format!(
                "instance {} out of range ({} instances)",
                to, current.total
            )));
        }
        match current.buckets.get(&bucket) {
            Some(owner) if *owner == from => {}
            owner => {
                return Err(BucketError::InvalidArgument(format!(
                    "bucket {} is owned by {:?}, not {}",
                    bucket, owner, from
                )))
            }
        }
        let mut next = IndexMap::clone(&current);
        next.buckets.insert(bucket, to);
        self.publish(next)?;
        debug!(bucket, from, to, "Bucket reindexed");
        Ok(())
    }

    fn resize(&self, total: usize) -> Result<()> {
        let _guard = self.update_lock.lock();
        let current = self.snapshot();
        if current.total == total {
            return Ok(());
        }
        let next = IndexMap {
            total,
            buckets: current.buckets.clone(),
        };
        self.publish(next)?;
        warn!(from = current.total, to = total, "Bucket index map resized");
        Ok(())
    }

    fn publish(&self, next: IndexMap) -> Result<()> {
        persist_map(&self.path, &next)?;
        *self.map.write() = Arc::new(next);
        Ok(())
    }
}

fn persist_map(path: &Path, map: &IndexMap) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}", map.total)?;
        for (bucket, index) in &map.buckets {
            writeln!(file, "{}:{}", bucket, index)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn parse_map(text: &str) -> Result<IndexMap> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let total = match lines.next() {
        Some(line) => line
            .parse()
            .map_err(|_| BucketError::Storage(format!("bad instance count line: {}", line)))?,
        None => return Ok(IndexMap::default()),
    };
    let mut buckets = BTreeMap::new();
    for line in lines {
        let parsed = line
            .split_once(':')
            .and_then(|(b, i)| Some((b.parse::<u32>().ok()?, i.parse::<usize>().ok()?)));
        match parsed {
            Some((bucket, index)) => {
                buckets.insert(bucket, index);
            }
            None => warn!(line, "Skipping malformed bucket index line"),
        }
    }
    Ok(IndexMap { total, buckets })
}
