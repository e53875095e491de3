//! MemTable implementation
//!
//! Comparator-ordered BTreeMap with RwLock for concurrency.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::MemTableEntry;
use crate::lsm::{Comparator, Record};

/// Per-entry bookkeeping overhead counted toward the flush threshold
const ENTRY_OVERHEAD: usize = 16;

/// Map key ordered by the store comparator
struct OrderedKey {
    key: Vec<u8>,
    order: Arc<dyn Comparator>,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.order.compare(&self.key, &other.key)
    }
}

struct Slot {
    sequence: u64,
    entry: MemTableEntry,
}

/// In-memory table for recent writes
pub struct MemTable {
    data: RwLock<BTreeMap<OrderedKey, Slot>>,
    cmp: Arc<dyn Comparator>,
    /// Approximate size in bytes
    size: AtomicUsize,
    /// Smallest sequence written since the last clear (u64::MAX when empty)
    min_sequence: AtomicU64,
}

impl MemTable {
    pub fn new(cmp: Arc<dyn Comparator>) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            cmp,
            size: AtomicUsize::new(0),
            min_sequence: AtomicU64::new(u64::MAX),
        }
    }

    fn probe(&self, key: &[u8]) -> OrderedKey {
        OrderedKey {
            key: key.to_vec(),
            order: Arc::clone(&self.cmp),
        }
    }

    /// Latest version of `key`, tombstones included
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        let data = self.data.read();
        data.get_key_value(&self.probe(key))
            .map(|(k, slot)| to_record(k, slot))
    }

    /// Insert a value; returns the new approximate size
    pub fn put(&self, key: Vec<u8>, sequence: u64, value: Vec<u8>) -> usize {
        self.insert(key, sequence, MemTableEntry::Value(value))
    }

    /// Insert a tombstone; returns the new approximate size
    pub fn delete(&self, key: Vec<u8>, sequence: u64) -> usize {
        self.insert(key, sequence, MemTableEntry::Tombstone)
    }

    fn insert(&self, key: Vec<u8>, sequence: u64, entry: MemTableEntry) -> usize {
        let added = entry_size(&key, &entry);
        let ordered = OrderedKey {
            key,
            order: Arc::clone(&self.cmp),
        };

        let mut data = self.data.write();
        // remove first so the stored key bytes are the newest ones
        if let Some((old_key, old_slot)) = data.remove_entry(&ordered) {
            self.size
                .fetch_sub(entry_size(&old_key.key, &old_slot.entry), Ordering::SeqCst);
        }
        data.insert(ordered, Slot { sequence, entry });
        self.min_sequence.fetch_min(sequence, Ordering::SeqCst);
        self.size.fetch_add(added, Ordering::SeqCst) + added
    }

    /// Get approximate size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size() >= size_limit
    }

    /// Smallest sequence number currently held
    pub fn min_sequence(&self) -> Option<u64> {
        match self.min_sequence.load(Ordering::SeqCst) {
            u64::MAX => None,
            seq => Some(seq),
        }
    }

    /// Snapshot of all entries in comparator order (for flush)
    pub fn records(&self) -> Vec<Record> {
        let data = self.data.read();
        data.iter().map(|(k, slot)| to_record(k, slot)).collect()
    }

    /// Up to `limit` entries at or after `start` (strictly after when not
    /// `inclusive`); the flag reports whether more entries remain
    pub fn range_from(&self, start: &[u8], inclusive: bool, limit: usize) -> (Vec<Record>, bool) {
        let probe = self.probe(start);
        let lower = if inclusive {
            Bound::Included(probe)
        } else {
            Bound::Excluded(probe)
        };

        let data = self.data.read();
        let mut iter = data.range((lower, Bound::Unbounded));
        let records: Vec<Record> = iter
            .by_ref()
            .take(limit)
            .map(|(k, slot)| to_record(k, slot))
            .collect();
        let more = iter.next().is_some();
        (records, more)
    }

    /// Clear all entries (after successful flush)
    pub fn clear(&self) {
        let mut data = self.data.write();
        data.clear();
        self.size.store(0, Ordering::SeqCst);
        self.min_sequence.store(u64::MAX, Ordering::SeqCst);
    }
}

fn entry_size(key: &[u8], entry: &MemTableEntry) -> usize {
    let value_len = match entry {
        MemTableEntry::Value(v) => v.len(),
        MemTableEntry::Tombstone => 0,
    };
    key.len() + value_len + ENTRY_OVERHEAD
}

fn to_record(key: &OrderedKey, slot: &Slot) -> Record {
    Record {
        key: key.key.clone(),
        sequence: slot.sequence,
        value: match &slot.entry {
            MemTableEntry::Value(v) => Some(v.clone()),
            MemTableEntry::Tombstone => None,
        },
    }
}
