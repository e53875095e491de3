//! Tests for a single engine instance
//!
//! These tests verify:
//! - Put/get/remove with version-care
//! - Lazy expiration
//! - Bulk import into an area
//! - Usage counters
//! - Paged bucket scans, one active scan per instance
//! - Bucket close, area clear and garbage compaction
//! - Store reset
//! - The read cache path

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bucketkv::cache::{LruReadCache, ReadCache};
use bucketkv::codec::merge_area;
use bucketkv::instance::{BatchRecord, CachePolicy, Instance, InstanceOptions, Item, UsageStat};
use bucketkv::{BucketError, Config};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .write_sync(true)
        .migrate_batch(3, 1024 * 1024)
        .build()
}

fn open_instance(temp: &TempDir) -> Instance {
    open_with_cache(temp, None)
}

fn open_with_cache(temp: &TempDir, cache: Option<Arc<dyn ReadCache>>) -> Instance {
    let config = test_config(temp.path());
    Instance::open(0, &config.instance_dir(0), InstanceOptions::from(&config), cache).unwrap()
}

fn put(instance: &Instance, bucket: u32, key: &[u8], payload: &[u8]) {
    instance
        .put(bucket, key, &Item::new(payload), false, 0, CachePolicy::Fill)
        .unwrap();
}

fn scan_all(instance: &Instance, bucket: u32) -> Vec<Vec<u8>> {
    instance.begin_scan(bucket).unwrap();
    let mut keys = Vec::new();
    loop {
        let (items, more) = instance.get_next_items().unwrap();
        assert!(items.len() <= 3, "page larger than the batch count");
        keys.extend(items.into_iter().map(|item| item.key));
        if !more {
            break;
        }
    }
    instance.end_scan();
    keys
}

// =============================================================================
// Data Path Tests
// =============================================================================

#[test]
fn test_put_get_roundtrip() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    let meta = instance
        .put(1, b"key", &Item::new("value"), true, 0, CachePolicy::Fill)
        .unwrap();
    assert_eq!(meta.version, 1);

    let item = instance.get(1, b"key").unwrap();
    assert_eq!(item.payload, b"value");
    assert_eq!(item.meta.version, 1);
    assert_eq!(item.meta.edate, 0);
    assert!(item.meta.cdate > 0);
    assert_eq!(item.meta.cdate, item.meta.mdate);

    assert!(matches!(instance.get(2, b"key"), Err(BucketError::NotFound)));
    assert!(matches!(instance.get(1, b""), Err(BucketError::InvalidArgument(_))));
}

#[test]
fn test_version_care() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    instance
        .put(1, b"key", &Item::new("v1"), true, 0, CachePolicy::Fill)
        .unwrap();

    let stale = instance.put(1, b"key", &Item::with_version("v2", 5), true, 0, CachePolicy::Fill);
    assert!(matches!(
        stale,
        Err(BucketError::VersionConflict {
            expected: 5,
            stored: 1
        })
    ));

    let meta = instance
        .put(1, b"key", &Item::with_version("v2", 1), true, 0, CachePolicy::Fill)
        .unwrap();
    assert_eq!(meta.version, 2);

    // version 0 matches anything
    let meta = instance
        .put(1, b"key", &Item::new("v3"), true, 0, CachePolicy::Fill)
        .unwrap();
    assert_eq!(meta.version, 3);
    assert_eq!(instance.get(1, b"key").unwrap().payload, b"v3");

    // without version care the caller's version is stored as given
    let meta = instance
        .put(1, b"key", &Item::with_version("v4", 77), false, 0, CachePolicy::Fill)
        .unwrap();
    assert_eq!(meta.version, 77);
}

#[test]
fn test_concurrent_version_care_has_one_winner() {
    let temp = TempDir::new().unwrap();
    let instance = Arc::new(open_instance(&temp));
    instance
        .put(1, b"counter", &Item::new("0"), true, 0, CachePolicy::Fill)
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let instance = Arc::clone(&instance);
            thread::spawn(move || {
                let item = Item::with_version(format!("writer{}", i), 1);
                instance.put(1, b"counter", &item, true, 0, CachePolicy::Fill)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter(|r| r.is_err())
        .all(|r| matches!(r, Err(BucketError::VersionConflict { expected: 1, stored: 2 }))));
    assert_eq!(instance.get(1, b"counter").unwrap().meta.version, 2);
}

#[test]
fn test_remove() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    assert!(matches!(instance.remove(1, b"key", false, 0), Err(BucketError::NotFound)));

    instance
        .put(1, b"key", &Item::new("value"), true, 0, CachePolicy::Fill)
        .unwrap();
    assert!(matches!(
        instance.remove(1, b"key", true, 9),
        Err(BucketError::VersionConflict { .. })
    ));
    instance.remove(1, b"key", true, 1).unwrap();
    assert!(matches!(instance.get(1, b"key"), Err(BucketError::NotFound)));
}

#[test]
fn test_expired_item_reads_as_missing() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    instance
        .put(1, b"short", &Item::new("bye"), false, 2, CachePolicy::Fill)
        .unwrap();
    put(&instance, 1, b"long", b"stay");
    assert!(instance.get(1, b"short").is_ok());

    thread::sleep(Duration::from_millis(3100));
    assert!(matches!(instance.get(1, b"short"), Err(BucketError::NotFound)));
    assert!(instance.get(1, b"long").is_ok());

    // an expired key behaves as absent for version-care writes too
    let meta = instance
        .put(1, b"short", &Item::with_version("again", 7), true, 0, CachePolicy::Fill)
        .unwrap();
    assert_eq!(meta.version, 1);
}

#[test]
fn test_data_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let instance = open_instance(&temp);
        put(&instance, 4, b"durable", b"yes");
        instance.close().unwrap();
    }

    let instance = open_instance(&temp);
    assert_eq!(instance.get(4, b"durable").unwrap().payload, b"yes");
}

#[test]
fn test_writes_after_reopen_outrank_old_garbage_tags() {
    let temp = TempDir::new().unwrap();
    let before = {
        let instance = open_instance(&temp);
        put(&instance, 1, b"k", b"v");
        instance.remove(1, b"k", false, 0).unwrap();
        instance.compact().unwrap();
        instance.init_buckets(&[5]);
        instance.close_buckets(&[5]).unwrap();
        let sequence = instance.latest_sequence();
        instance.close().unwrap();
        sequence
    };

    let instance = open_instance(&temp);
    assert!(instance.latest_sequence() >= before);
    instance.init_buckets(&[5]);
    put(&instance, 5, b"x", b"new");
    assert_eq!(instance.get(5, b"x").unwrap().payload, b"new");

    // the old tag must not collect the new record either
    instance.compact().unwrap();
    assert_eq!(instance.get(5, b"x").unwrap().payload, b"new");
}

// =============================================================================
// Bulk Import & Stats Tests
// =============================================================================

#[test]
fn test_batch_put_into_area() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);
    instance.init_buckets(&[3]);

    let records: Vec<BatchRecord> = (0..3)
        .map(|i| BatchRecord {
            key: format!("k{}", i).into_bytes(),
            item: Item::new(vec![b'x'; 10]),
            expire_offset: 0,
        })
        .collect();
    instance.batch_put(3, 9, &records, false).unwrap();

    for i in 0..3 {
        let key = merge_area(9, format!("k{}", i).as_bytes());
        assert_eq!(instance.get(3, &key).unwrap().payload.len(), 10);
    }
    let stats = instance.stats();
    assert_eq!(stats.areas[&9].item_count, 3);
    assert_eq!(stats.buckets[&3].item_count, 3);

    assert!(matches!(
        instance.batch_put(3, 9, &[], false),
        Err(BucketError::InvalidArgument(_))
    ));
}

#[test]
fn test_usage_counters() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);
    instance.init_buckets(&[1]);

    put(&instance, 1, b"abc", &[0u8; 10]);
    // data = key + payload, use = 7-byte key prefix + key + 16-byte meta + payload
    assert_eq!(
        instance.stats().buckets[&1],
        UsageStat {
            data_size: 13,
            use_size: 36,
            item_count: 1
        }
    );

    put(&instance, 1, b"abc", &[0u8; 4]);
    assert_eq!(instance.stats().buckets[&1].data_size, 7);
    assert_eq!(instance.stats().buckets[&1].item_count, 1);

    instance.remove(1, b"abc", false, 0).unwrap();
    assert_eq!(instance.stats().buckets[&1], UsageStat::default());

    // unowned buckets are not counted
    put(&instance, 2, b"abc", b"x");
    assert!(!instance.stats().buckets.contains_key(&2));
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_scan_pages_through_one_bucket() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    for i in 0..10 {
        put(&instance, 1, format!("key{:02}", i).as_bytes(), b"v");
    }
    for i in 0..5 {
        put(&instance, 2, format!("key{:02}", i).as_bytes(), b"v");
    }
    instance.flush().unwrap();
    put(&instance, 1, b"key10", b"in memtable");
    instance.remove(1, b"key03", false, 0).unwrap();

    let keys = scan_all(&instance, 1);
    let expected: Vec<Vec<u8>> = (0..11)
        .filter(|i| *i != 3)
        .map(|i| format!("key{:02}", i).into_bytes())
        .collect();
    assert_eq!(keys, expected);

    assert!(scan_all(&instance, 9).is_empty());
    assert!(matches!(
        instance.get_next_items(),
        Err(BucketError::InvalidArgument(_))
    ));
}

#[test]
fn test_second_scan_is_refused_while_one_is_active() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);
    for i in 0..5 {
        put(&instance, 4, format!("four{}", i).as_bytes(), b"v");
        put(&instance, 9, format!("nine{}", i).as_bytes(), b"v");
    }

    instance.begin_scan(4).unwrap();
    let (first, more) = instance.get_next_items().unwrap();
    assert!(more);
    assert!(matches!(instance.begin_scan(9), Err(BucketError::InvalidArgument(_))));

    // the active scan keeps reading its own bucket
    let mut keys: Vec<Vec<u8>> = first.into_iter().map(|item| item.key).collect();
    loop {
        let (items, more) = instance.get_next_items().unwrap();
        assert!(items.iter().all(|item| item.bucket == 4));
        keys.extend(items.into_iter().map(|item| item.key));
        if !more {
            break;
        }
    }
    assert_eq!(keys.len(), 5);
    assert!(keys.iter().all(|key| key.starts_with(b"four")));
    instance.end_scan();

    assert_eq!(scan_all(&instance, 9).len(), 5);
    assert!(matches!(instance.get_next_items(), Err(BucketError::InvalidArgument(_))));
}

#[test]
fn test_stored_buckets() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    put(&instance, 7, b"a", b"v");
    put(&instance, 3, b"a", b"v");
    put(&instance, 7, b"b", b"v");
    put(&instance, 100, b"a", b"v");
    assert_eq!(instance.stored_buckets().unwrap(), vec![3, 7, 100]);

    // the tombstone still occupies bucket 3 until compaction
    instance.remove(3, b"a", false, 0).unwrap();
    assert_eq!(instance.stored_buckets().unwrap(), vec![3, 7, 100]);
    instance.compact().unwrap();
    assert_eq!(instance.stored_buckets().unwrap(), vec![7, 100]);
}

#[test]
fn test_stored_buckets_counts_hidden_records() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    for i in 0..50 {
        instance
            .put(1, format!("k{}", i).as_bytes(), &Item::new("v"), false, 1, CachePolicy::Skip)
            .unwrap();
    }
    put(&instance, 2, b"a", b"v");
    put(&instance, 3, b"a", b"v");
    instance.flush().unwrap();
    instance.tag_bucket_garbage(3).unwrap();

    thread::sleep(Duration::from_millis(2100));
    assert!(matches!(instance.get(1, b"k0"), Err(BucketError::NotFound)));
    assert!(matches!(instance.get(3, b"a"), Err(BucketError::NotFound)));
    assert_eq!(instance.stored_buckets().unwrap(), vec![1, 2, 3]);

    instance.compact().unwrap();
    assert_eq!(instance.stored_buckets().unwrap(), vec![2]);
}

// =============================================================================
// Garbage & Lifecycle Tests
// =============================================================================

#[test]
fn test_close_bucket_then_compact() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);
    instance.init_buckets(&[1, 2]);

    for i in 0..20 {
        put(&instance, 1, format!("k{}", i).as_bytes(), b"gone");
        put(&instance, 2, format!("k{}", i).as_bytes(), b"kept");
    }
    instance.close_buckets(&[1]).unwrap();
    assert!(!instance.exist(1));
    assert_eq!(instance.get_buckets(), vec![2]);
    assert!(matches!(instance.get(1, b"k0"), Err(BucketError::NotFound)));
    assert_eq!(instance.stats().pending_gc, (1, 0));

    instance.compact().unwrap();
    assert_eq!(instance.stats().pending_gc, (0, 0));
    assert_eq!(instance.stored_buckets().unwrap(), vec![2]);

    // the bucket can be written again after collection
    put(&instance, 1, b"k0", b"back");
    assert_eq!(instance.get(1, b"k0").unwrap().payload, b"back");
    assert_eq!(instance.get(2, b"k19").unwrap().payload, b"kept");
}

#[test]
fn test_clear_area() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);
    instance.init_buckets(&[1]);

    put(&instance, 1, &merge_area(4, b"a"), b"v");
    put(&instance, 1, &merge_area(4, b"b"), b"v");
    put(&instance, 1, &merge_area(5, b"a"), b"v");

    instance.clear_area(4).unwrap();
    assert!(matches!(instance.get(1, &merge_area(4, b"a")), Err(BucketError::NotFound)));
    assert!(instance.get(1, &merge_area(5, b"a")).is_ok());
    assert_eq!(instance.stats().areas[&4], UsageStat::default());
    assert_eq!(instance.stats().areas[&5].item_count, 1);

    instance.compact().unwrap();
    assert_eq!(scan_all(&instance, 1), vec![merge_area(5, b"a")]);
}

#[test]
fn test_reset_starts_empty() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);
    instance.init_buckets(&[1]);
    put(&instance, 1, b"key", b"value");

    instance.reset().unwrap();

    assert!(matches!(instance.get(1, b"key"), Err(BucketError::NotFound)));
    assert!(instance.exist(1));
    assert_eq!(instance.stats().buckets[&1], UsageStat::default());

    // the old store is gone once nothing holds it
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
        .collect();
    assert!(leftovers.is_empty());

    put(&instance, 1, b"key", b"fresh");
    assert_eq!(instance.get(1, b"key").unwrap().payload, b"fresh");
}

#[test]
fn test_compaction_pause_flag() {
    let temp = TempDir::new().unwrap();
    let instance = open_instance(&temp);

    assert!(!instance.is_compaction_paused());
    instance.pause_compaction();
    assert!(instance.is_compaction_paused());
    instance.resume_compaction();
    assert!(!instance.is_compaction_paused());
}

// =============================================================================
// Cache Tests
// =============================================================================

#[test]
fn test_cache_fill_and_invalidate() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(LruReadCache::new(1024 * 1024));
    let instance = open_with_cache(&temp, Some(cache.clone() as Arc<dyn ReadCache>));

    put(&instance, 1, b"hot", b"value");
    assert_eq!(cache.stats().entries, 1);

    assert_eq!(instance.get(1, b"hot").unwrap().payload, b"value");
    assert_eq!(cache.stats().hits, 1);

    instance.remove(1, b"hot", false, 0).unwrap();
    assert_eq!(cache.stats().entries, 0);
    assert!(matches!(instance.get(1, b"hot"), Err(BucketError::NotFound)));

    instance
        .put(1, b"cold", &Item::new("value"), false, 0, CachePolicy::Skip)
        .unwrap();
    assert_eq!(cache.stats().entries, 0);
    assert!(instance.get(1, b"cold").is_ok());
    assert_eq!(cache.stats().entries, 1);

    instance.init_buckets(&[1]);
    instance.close_buckets(&[1]).unwrap();
    assert_eq!(cache.stats().entries, 0);
}

#[test]
fn test_close_racing_reads_leaves_no_cached_garbage() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(LruReadCache::new(4 * 1024 * 1024));
    let instance = open_with_cache(&temp, Some(cache.clone() as Arc<dyn ReadCache>));

    for round in 0..20 {
        instance.init_buckets(&[1]);
        let keys: Vec<Vec<u8>> = (0..50).map(|i| format!("r{}k{}", round, i).into_bytes()).collect();
        for key in &keys {
            instance
                .put(1, key, &Item::new("v"), false, 0, CachePolicy::Skip)
                .unwrap();
        }

        thread::scope(|scope| {
            scope.spawn(|| {
                for key in &keys {
                    let _ = instance.get(1, key);
                }
            });
            instance.close_buckets(&[1]).unwrap();
        });

        // every fill that raced the close was taken back out
        assert_eq!(cache.stats().entries, 0, "round {}", round);
        assert!(keys.iter().all(|key| instance.get(1, key).is_err()));
    }
}

