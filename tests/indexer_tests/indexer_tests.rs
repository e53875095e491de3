//! Tests for bucket → instance routing
//!
//! These tests verify:
//! - Every assigned bucket routes to exactly one instance
//! - Hash distribution of 1024 buckets over 3 instances
//! - Map persistence, reload and resize
//! - Reindex validation
//! - Reassignment keeps buckets already within quota

use std::collections::BTreeSet;
use std::fs;

use bucketkv::config::IndexerStrategy;
use bucketkv::indexer::{BucketIndexer, INDEX_MAP_FILENAME};
use bucketkv::BucketError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open(strategy: IndexerStrategy, temp: &TempDir) -> BucketIndexer {
    BucketIndexer::open(strategy, temp.path()).unwrap()
}

fn sizes(lists: &[Vec<u32>]) -> Vec<usize> {
    lists.iter().map(Vec::len).collect()
}

// =============================================================================
// Assignment Tests
// =============================================================================

#[test]
fn test_assign_is_total_and_disjoint() {
    for strategy in [IndexerStrategy::Hash, IndexerStrategy::Map] {
        let temp = TempDir::new().unwrap();
        let indexer = open(strategy, &temp);
        let buckets: Vec<u32> = (0..100).collect();

        let lists = indexer.assign(7, &buckets).unwrap();
        assert_eq!(lists.len(), 7);

        let mut seen = BTreeSet::new();
        for (index, list) in lists.iter().enumerate() {
            for bucket in list {
                assert!(seen.insert(*bucket), "bucket {} assigned twice", bucket);
                assert_eq!(indexer.lookup(*bucket), Some(index));
            }
        }
        assert_eq!(seen.len(), 100);
        assert_eq!(indexer.index_map().len(), 100);
    }
}

#[test]
fn test_hash_spreads_1024_over_3() {
    let temp = TempDir::new().unwrap();
    let indexer = open(IndexerStrategy::Hash, &temp);
    let buckets: Vec<u32> = (0..1024).collect();

    let lists = indexer.assign(3, &buckets).unwrap();
    assert_eq!(sizes(&lists), vec![342, 341, 341]);
    assert_eq!(indexer.lookup(1023), Some(0));
}

#[test]
fn test_map_balances_within_one() {
    let temp = TempDir::new().unwrap();
    let indexer = open(IndexerStrategy::Map, &temp);
    let buckets: Vec<u32> = (0..1024).collect();

    let lists = indexer.assign(3, &buckets).unwrap();
    let mut counts = sizes(&lists);
    counts.sort_unstable();
    assert_eq!(counts, vec![341, 341, 342]);
}

#[test]
fn test_zero_instances_rejected() {
    let temp = TempDir::new().unwrap();
    let indexer = open(IndexerStrategy::Map, &temp);
    assert!(matches!(
        indexer.assign(0, &[1, 2]),
        Err(BucketError::InvalidArgument(_))
    ));
}

#[test]
fn test_map_reassign_keeps_buckets_in_quota() {
    let temp = TempDir::new().unwrap();
    let indexer = open(IndexerStrategy::Map, &temp);
    let first: Vec<u32> = (0..6).collect();
    let before = indexer.assign(3, &first).unwrap();

    let mut grown = first.clone();
    grown.extend(6..9);
    let after = indexer.assign(3, &grown).unwrap();

    assert_eq!(sizes(&after), vec![3, 3, 3]);
    for (old, new) in before.iter().zip(&after) {
        assert!(old.iter().all(|b| new.contains(b)), "{:?} lost buckets in {:?}", old, new);
    }
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_map_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let assigned = {
        let indexer = open(IndexerStrategy::Map, &temp);
        indexer.assign(2, &[10, 11, 12, 13]).unwrap();
        indexer.reindex(10, 0, 1).unwrap();
        indexer.index_map()
    };

    let text = fs::read_to_string(temp.path().join(INDEX_MAP_FILENAME)).unwrap();
    assert!(text.starts_with("2\n"));
    assert!(text.contains("10:1\n"));

    let indexer = open(IndexerStrategy::Map, &temp);
    assert_eq!(indexer.index_map(), assigned);
    assert_eq!(indexer.lookup(10), Some(1));
}

#[test]
fn test_hash_is_not_persisted() {
    let temp = TempDir::new().unwrap();
    open(IndexerStrategy::Hash, &temp).assign(2, &[1, 2]).unwrap();

    assert!(!temp.path().join(INDEX_MAP_FILENAME).exists());
    assert!(open(IndexerStrategy::Hash, &temp).index_map().is_empty());
}

#[test]
fn test_resize_keeps_routes() {
    let temp = TempDir::new().unwrap();
    let indexer = open(IndexerStrategy::Map, &temp);
    indexer.assign(2, &[0, 1, 2, 3]).unwrap();

    indexer.resize(3).unwrap();
    assert_eq!(indexer.index_map().len(), 4);
    indexer.reindex(0, indexer.lookup(0).unwrap(), 2).unwrap();
    assert_eq!(indexer.lookup(0), Some(2));

    let reopened = open(IndexerStrategy::Map, &temp);
    assert_eq!(reopened.lookup(0), Some(2));
}

// =============================================================================
// Reindex Tests
// =============================================================================

#[test]
fn test_reindex_validation() {
    let temp = TempDir::new().unwrap();
    let indexer = open(IndexerStrategy::Map, &temp);
    indexer.assign(2, &[5]).unwrap();
    let owner = indexer.lookup(5).unwrap();
    let other = 1 - owner;

    // wrong source, unknown bucket, out of range destination
    assert!(indexer.reindex(5, other, owner).is_err());
    assert!(indexer.reindex(6, owner, other).is_err());
    assert!(indexer.reindex(5, owner, 2).is_err());
    assert_eq!(indexer.lookup(5), Some(owner));

    indexer.reindex(5, owner, other).unwrap();
    assert_eq!(indexer.lookup(5), Some(other));
}

#[test]
fn test_hash_rejects_reindex() {
    let temp = TempDir::new().unwrap();
    let indexer = open(IndexerStrategy::Hash, &temp);
    indexer.assign(2, &[5]).unwrap();

    assert!(matches!(
        indexer.reindex(5, 1, 0),
        Err(BucketError::InvalidArgument(_))
    ));
    assert_eq!(indexer.lookup(5), Some(1));
}
