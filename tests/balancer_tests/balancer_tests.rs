//! Tests for bucket migration between instances
//!
//! These tests verify:
//! - Growing the instance count and balancing moves data with its buckets
//! - Writes and deletes racing a background balance are not lost
//! - Hash strategy and balanced layouts need no moves
//! - A failing destination aborts the unit without moving ownership
//! - Copies left by an interrupted migration are purged on reopen

use std::path::Path;
use std::thread;
use std::time::Duration;

use bucketkv::balancer::plan;
use bucketkv::config::IndexerStrategy;
use bucketkv::instance::CachePolicy;
use bucketkv::{BucketError, Config, Item, StorageManager};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const BUCKETS: u32 = 12;

fn test_config(dir: &Path, instances: usize, strategy: IndexerStrategy) -> Config {
    Config::builder()
        .data_dir(dir)
        .instance_count(instances)
        .bucket_count(64)
        .indexer_strategy(strategy)
        .migrate_batch(4, 64 * 1024)
        .build()
}

fn open(temp: &TempDir, instances: usize) -> StorageManager {
    StorageManager::open(test_config(temp.path(), instances, IndexerStrategy::Map)).unwrap()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:03}", i).into_bytes()
}

/// Two instances holding `BUCKETS` buckets of `per_bucket` keys each, closed
fn seed(temp: &TempDir, per_bucket: usize) {
    let manager = open(temp, 2);
    manager.init_buckets(&(0..BUCKETS).collect::<Vec<u32>>()).unwrap();
    for bucket in 0..BUCKETS {
        for i in 0..per_bucket {
            let value = format!("{}:{}", bucket, i);
            manager.put(bucket, &key(i), &Item::new(value), false, 0).unwrap();
        }
    }
    manager.close().unwrap();
}

fn owned_counts(manager: &StorageManager) -> Vec<usize> {
    (0..manager.instance_count())
        .map(|i| manager.instance(i).unwrap().bucket_count())
        .collect()
}

// =============================================================================
// Balancing Tests
// =============================================================================

#[test]
fn test_balance_fills_new_instance() {
    let temp = TempDir::new().unwrap();
    seed(&temp, 10);

    let manager = open(&temp, 3);
    assert_eq!(owned_counts(&manager), vec![6, 6, 0]);

    let report = manager.balance_now().unwrap();
    assert_eq!(report.planned, 4);
    assert!(report.is_complete(), "{:?}", report);
    assert!(report.moved.iter().all(|unit| unit.to == 2));
    assert_eq!(owned_counts(&manager), vec![4, 4, 4]);

    for bucket in 0..BUCKETS {
        for i in 0..10 {
            let item = manager.get(bucket, &key(i)).unwrap();
            assert_eq!(item.payload, format!("{}:{}", bucket, i).into_bytes());
        }
    }

    let stats = manager.get_stats();
    assert_eq!(stats.total.item_count, (BUCKETS * 10) as i64);
    assert!(stats.instances[2].buckets.values().all(|s| s.item_count == 10));

    // moved buckets leave nothing behind on their sources
    manager.compact().unwrap();
    for unit in &report.moved {
        let source = manager.instance(unit.from).unwrap();
        assert!(!source.stored_buckets().unwrap().contains(&unit.bucket));
        assert_eq!(manager.owner_of(unit.bucket), Some(unit.to));
    }
}

#[test]
fn test_balanced_layout_plans_nothing() {
    let temp = TempDir::new().unwrap();
    let manager = open(&temp, 3);
    manager.init_buckets(&(0..BUCKETS).collect::<Vec<u32>>()).unwrap();

    let report = manager.balance_now().unwrap();
    assert_eq!(report.planned, 0);
    assert!(report.is_complete());
}

#[test]
fn test_hash_strategy_skips_balance() {
    let temp = TempDir::new().unwrap();
    let manager =
        StorageManager::open(test_config(temp.path(), 2, IndexerStrategy::Hash)).unwrap();
    manager.init_buckets(&[0, 1, 2]).unwrap();

    let report = manager.balance_now().unwrap();
    assert_eq!(report.planned, 0);
    assert!(report.moved.is_empty());
    assert!(matches!(manager.reindex(0, 0, 1), Err(BucketError::InvalidArgument(_))));
}

#[test]
fn test_writes_during_background_balance() {
    let temp = TempDir::new().unwrap();
    seed(&temp, 50);

    let manager = open(&temp, 3);
    manager.balance().unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for round in 0..5 {
                for bucket in 0..BUCKETS {
                    let value = format!("round{}", round);
                    manager.put(bucket, &key(0), &Item::new(value), false, 0).unwrap();
                    if round == 0 {
                        manager.remove(bucket, &key(1), false, 0).unwrap();
                    }
                }
            }
        });
    });

    let report = manager.wait_balance().unwrap();
    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(owned_counts(&manager), vec![4, 4, 4]);

    for bucket in 0..BUCKETS {
        assert_eq!(manager.get(bucket, &key(0)).unwrap().payload, b"round4");
        assert!(matches!(manager.get(bucket, &key(1)), Err(BucketError::NotFound)));
        assert_eq!(
            manager.get(bucket, &key(49)).unwrap().payload,
            format!("{}:49", bucket).into_bytes()
        );
    }
    assert_eq!(manager.get_stats().total.item_count, (BUCKETS * 49) as i64);
}

#[test]
fn test_stopped_balance_keeps_every_bucket_served() {
    let temp = TempDir::new().unwrap();
    seed(&temp, 20);

    let manager = open(&temp, 3);
    manager.balance().unwrap();
    let report = manager.stop_balance();

    for bucket in 0..BUCKETS {
        assert!(manager.owner_of(bucket).is_some());
        assert_eq!(
            manager.get(bucket, &key(19)).unwrap().payload,
            format!("{}:19", bucket).into_bytes()
        );
    }
    if let Some(report) = report {
        assert!(report.failed.is_none());
        assert_eq!(owned_counts(&manager).iter().sum::<usize>(), BUCKETS as usize);
    }

    // a later run finishes the job
    manager.balance_now().unwrap();
    assert_eq!(owned_counts(&manager), vec![4, 4, 4]);
}

#[test]
fn test_failed_write_aborts_unit_and_discards_copy() {
    let temp = TempDir::new().unwrap();
    seed(&temp, 40);

    let config = Config::builder()
        .data_dir(temp.path())
        .instance_count(3)
        .bucket_count(64)
        .indexer_strategy(IndexerStrategy::Map)
        .migrate_batch(4, 64 * 1024)
        .write_buffer_size(512)
        .build();
    let manager = StorageManager::open(config.clone()).unwrap();

    // the destination can no longer create tables, so its first memtable
    // flush during the copy fails
    let tables = config.instance_dir(2).join("sstables");
    let aside = config.instance_dir(2).join("sstables.aside");
    std::fs::rename(&tables, &aside).unwrap();
    std::fs::write(&tables, b"not a directory").unwrap();

    let report = manager.balance_now().unwrap();
    let (unit, _) = report.failed.clone().expect("unit should fail");
    assert!(report.moved.is_empty());
    assert!(!report.is_complete());
    assert_eq!(unit.to, 2);

    assert_eq!(manager.owner_of(unit.bucket), Some(unit.from));
    assert!(!manager.is_service_paused(unit.bucket));
    let dest = manager.instance(2).unwrap();
    assert!(!dest.exist(unit.bucket));
    assert!(dest.store().gc().bucket_tag(unit.bucket).is_some());

    // the source still serves reads and takes writes
    assert_eq!(
        manager.get(unit.bucket, &key(0)).unwrap().payload,
        format!("{}:0", unit.bucket).into_bytes()
    );
    manager
        .put(unit.bucket, b"after", &Item::new("fail"), false, 0)
        .unwrap();

    // once the disk is back a new run completes
    std::fs::remove_file(&tables).unwrap();
    std::fs::rename(&aside, &tables).unwrap();
    let report = manager.balance_now().unwrap();
    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(owned_counts(&manager), vec![4, 4, 4]);
    assert_eq!(manager.get(unit.bucket, b"after").unwrap().payload, b"fail");
    assert_eq!(
        manager.get(unit.bucket, &key(39)).unwrap().payload,
        format!("{}:39", unit.bucket).into_bytes()
    );
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_stray_copy_purged_on_reopen() {
    let temp = TempDir::new().unwrap();
    let (bucket, owner) = {
        let manager = open(&temp, 2);
        manager.init_buckets(&[0, 1, 2, 3]).unwrap();
        manager.put(0, b"key", &Item::new("real"), false, 0).unwrap();
        let owner = manager.owner_of(0).unwrap();

        // half-copied bucket on the other instance, as after a crash mid-migration
        let other = manager.instance(1 - owner).unwrap();
        other
            .put(0, b"key", &Item::new("stale"), false, 0, CachePolicy::Fill)
            .unwrap();
        assert_eq!(other.stored_buckets().unwrap(), vec![0]);
        manager.close().unwrap();
        (0u32, owner)
    };

    let tag = {
        let manager = open(&temp, 2);
        let other = manager.instance(1 - owner).unwrap();
        assert_eq!(other.stats().pending_gc, (1, 0));
        assert!(other.is_fully_tagged(bucket));
        assert_eq!(manager.get(bucket, b"key").unwrap().payload, b"real");
        let tag = other.store().gc().bucket_tag(bucket).unwrap();
        manager.close().unwrap();
        tag
    };

    // an existing tag that covers the copy is left alone on the next open
    thread::sleep(Duration::from_millis(1100));
    let manager = open(&temp, 2);
    let other = manager.instance(1 - owner).unwrap();
    assert_eq!(other.store().gc().bucket_tag(bucket), Some(tag));

    manager.compact().unwrap();
    assert!(other.stored_buckets().unwrap().is_empty());
    assert_eq!(other.stats().pending_gc, (0, 0));
    assert_eq!(manager.get(bucket, b"key").unwrap().payload, b"real");
}

#[test]
fn test_plan_moves_surplus_only() {
    let owned = vec![vec![0, 1, 2, 3, 4], vec![5], vec![6, 7, 8]];
    let units = plan(&owned);

    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|u| u.from == 0 && u.to == 1));
    let moved: Vec<u32> = units.iter().map(|u| u.bucket).collect();
    assert_eq!(moved, vec![4, 3]);
}
