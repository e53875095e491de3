//! Garbage tag registry of one instance

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Pending-removal marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcNode {
    /// Store sequence at the time of marking; records at or below it are garbage
    pub sequence: u64,
    /// Unix seconds when the tag was added
    pub when: u32,
}

/// One pending tag, as handed to the compaction scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTarget {
    Bucket(u32, GcNode),
    Area(u16, GcNode),
}

impl GcTarget {
    pub fn node(&self) -> GcNode {
        match self {
            GcTarget::Bucket(_, node) | GcTarget::Area(_, node) => *node,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct GcState {
    buckets: BTreeMap<u32, GcNode>,
    areas: BTreeMap<u16, GcNode>,
}

/// Registry of buckets and areas awaiting physical deletion
///
/// Tags are added from the request path while compaction evaluates them, so
/// both maps live under one mutex. With a backing file every change is written
/// through before the call returns.
pub struct GcFactory {
    path: Option<PathBuf>,
    state: Mutex<GcState>,
}

impl GcFactory {
    /// In-memory registry (nothing persisted)
    pub fn new() -> Self {
        Self {
            path: None,
            state: Mutex::new(GcState::default()),
        }
    }

    /// Registry backed by `path`, loading any tags saved there
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let state: GcState = bincode::deserialize(&fs::read(path)?)?;
            if !state.buckets.is_empty() || !state.areas.is_empty() {
                info!(
                    buckets = state.buckets.len(),
                    areas = state.areas.len(),
                    "Loaded pending garbage tags"
                );
            }
            state
        } else {
            GcState::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    pub fn add_bucket(&self, bucket: u32, sequence: u64, when: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.buckets.insert(bucket, GcNode { sequence, when });
        debug!(bucket, sequence, when, "Bucket tagged as garbage");
        self.persist(&state)
    }

    pub fn add_area(&self, area: u16, sequence: u64, when: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.areas.insert(area, GcNode { sequence, when });
        debug!(area, sequence, when, "Area tagged as garbage");
        self.persist(&state)
    }

    /// Whether a record of `bucket`/`area` written at `sequence` is garbage
    pub fn should_drop(&self, bucket: u32, area: Option<u16>, sequence: u64) -> bool {
        let state = self.state.lock();
        if state
            .buckets
            .get(&bucket)
            .map_or(false, |node| node.sequence >= sequence)
        {
            return true;
        }
        area.and_then(|a| state.areas.get(&a))
            .map_or(false, |node| node.sequence >= sequence)
    }

    /// Next tag to compact: buckets before areas
    pub fn next_pending(&self) -> Option<GcTarget> {
        let state = self.state.lock();
        if let Some((bucket, node)) = state.buckets.iter().next() {
            return Some(GcTarget::Bucket(*bucket, *node));
        }
        state
            .areas
            .iter()
            .next()
            .map(|(area, node)| GcTarget::Area(*area, *node))
    }

    /// Drop `target` once its range has been compacted
    ///
    /// A tag re-added with a newer sequence in the meantime is kept.
    pub fn remove(&self, target: &GcTarget) -> Result<bool> {
        let mut state = self.state.lock();
        let removed = match target {
            GcTarget::Bucket(bucket, node) => {
                if state.buckets.get(bucket) == Some(node) {
                    state.buckets.remove(bucket);
                    true
                } else {
                    false
                }
            }
            GcTarget::Area(area, node) => {
                if state.areas.get(area) == Some(node) {
                    state.areas.remove(area);
                    true
                } else {
                    false
                }
            }
        };
        if removed {
            self.persist(&state)?;
        }
        Ok(removed)
    }

    /// Retire every tag added before a compaction round that started at
    /// `round_start`; returns how many were retired
    pub fn finish(&self, round_start: u32) -> Result<usize> {
        if round_start == 0 {
            return Ok(0);
        }
        let mut state = self.state.lock();
        let before = state.buckets.len() + state.areas.len();
        state.buckets.retain(|_, node| node.when >= round_start);
        state.areas.retain(|_, node| node.when >= round_start);
        let retired = before - (state.buckets.len() + state.areas.len());
        if retired > 0 {
            info!(retired, round_start, "Retired garbage tags");
            self.persist(&state)?;
        }
        Ok(retired)
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.buckets.is_empty() && state.areas.is_empty()
    }

    pub fn bucket_tag(&self, bucket: u32) -> Option<GcNode> {
        self.state.lock().buckets.get(&bucket).copied()
    }

    pub fn area_tag(&self, area: u16) -> Option<GcNode> {
        self.state.lock().areas.get(&area).copied()
    }

    /// Highest sequence recorded by any pending tag (0 when none)
    pub fn max_sequence(&self) -> u64 {
        let state = self.state.lock();
        state
            .buckets
            .values()
            .chain(state.areas.values())
            .map(|node| node.sequence)
            .max()
            .unwrap_or(0)
    }

    /// (bucket tags, area tags)
    pub fn pending_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.buckets.len(), state.areas.len())
    }

    fn persist(&self, state: &GcState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        let bytes = bincode::serialize(state)?;
        if let Err(e) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
            warn!(path = %path.display(), error = %e, "Failed to persist garbage tags");
            return Err(e.into());
        }
        Ok(())
    }
}

impl Default for GcFactory {
    fn default() -> Self {
        Self::new()
    }
}
