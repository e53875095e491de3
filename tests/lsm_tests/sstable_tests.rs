//! Tests for SSTable build and read
//!
//! These tests verify:
//! - Built tables read back every record, tombstones included
//! - Point lookups across sparse index blocks
//! - Range reads with limits and exclusive starts
//! - Snappy-compressed values round trip and shrink the file
//! - Checksum verification rejects a damaged table

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use bucketkv::config::CompressionType;
use bucketkv::lsm::sstable::{SSTableBuilder, SSTableReader};
use bucketkv::lsm::{BytewiseComparator, Comparator, TableOptions};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn cmp() -> Arc<dyn Comparator> {
    Arc::new(BytewiseComparator)
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn build(path: &PathBuf, count: usize, options: TableOptions) {
    let mut builder = SSTableBuilder::new(path, options, 0).unwrap();
    for i in 0..count {
        if i % 10 == 9 {
            builder.add_tombstone(&key(i), i as u64 + 1).unwrap();
        } else {
            builder
                .add(&key(i), i as u64 + 1, format!("value{}", i).as_bytes())
                .unwrap();
        }
    }
    let table = builder.finish().unwrap();
    assert_eq!(table.entry_count(), count as u64);
}

fn small_blocks() -> TableOptions {
    TableOptions {
        block_size: 128,
        compression: CompressionType::None,
    }
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_iter_returns_everything_in_order() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("000001.sst");
    build(&path, 100, small_blocks());

    let reader = SSTableReader::open(&path, cmp(), true).unwrap();
    let records: Vec<_> = reader.iter().unwrap().map(|r| r.unwrap()).collect();

    assert_eq!(records.len(), 100);
    assert_eq!(records[0].key, key(0));
    assert_eq!(records[99].key, key(99));
    assert!(records[9].is_tombstone());
    assert_eq!(records[10].value.as_deref(), Some(&b"value10"[..]));
    assert_eq!(reader.min_key(), &key(0)[..]);
    assert_eq!(reader.max_key(), &key(99)[..]);
    assert_eq!(reader.min_sequence(), 1);
    assert_eq!(reader.max_sequence(), 100);
}

#[test]
fn test_point_lookup_across_blocks() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("000001.sst");
    build(&path, 200, small_blocks());
    let reader = SSTableReader::open(&path, cmp(), false).unwrap();

    for i in [0, 1, 57, 128, 199] {
        let record = reader.get(&key(i)).unwrap().unwrap();
        assert_eq!(record.sequence, i as u64 + 1);
        assert_eq!(record.value, Some(format!("value{}", i).into_bytes()));
    }
    let tombstone = reader.get(&key(19)).unwrap().unwrap();
    assert!(tombstone.is_tombstone());

    assert!(reader.get(b"key00000x").unwrap().is_none());
    assert!(reader.get(b"a").unwrap().is_none());
    assert!(reader.get(b"z").unwrap().is_none());
}

#[test]
fn test_read_range_limit_and_exclusive_start() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("000001.sst");
    build(&path, 50, small_blocks());
    let reader = SSTableReader::open(&path, cmp(), false).unwrap();

    let (records, more) = reader.read_range(&key(10), true, 5).unwrap();
    let keys: Vec<Vec<u8>> = records.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, (10..15).map(key).collect::<Vec<_>>());
    assert!(more);

    let (records, more) = reader.read_range(&key(47), false, 10).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, key(48));
    assert!(!more);

    let (records, more) = reader.read_range(b"zzz", true, 10).unwrap();
    assert!(records.is_empty());
    assert!(!more);
}

#[test]
fn test_overlap_checks() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("000001.sst");
    build(&path, 20, small_blocks());
    let reader = SSTableReader::open(&path, cmp(), false).unwrap();

    assert!(reader.might_contain(&key(5)));
    assert!(!reader.might_contain(&key(20)));
    assert!(reader.overlaps(b"a", &key(0)));
    assert!(reader.overlaps(&key(19), b"z"));
    assert!(!reader.overlaps(&key(20), b"z"));
}

// =============================================================================
// Compression & Integrity Tests
// =============================================================================

#[test]
fn test_snappy_values_round_trip() {
    let temp = TempDir::new().unwrap();
    let raw_path = temp.path().join("raw.sst");
    let snappy_path = temp.path().join("snappy.sst");
    let value = vec![b'x'; 4096];

    for (path, compression) in [
        (&raw_path, CompressionType::None),
        (&snappy_path, CompressionType::Snappy),
    ] {
        let options = TableOptions {
            block_size: 4096,
            compression,
        };
        let mut builder = SSTableBuilder::new(path, options, 0).unwrap();
        for i in 0..20 {
            builder.add(&key(i), i as u64 + 1, &value).unwrap();
        }
        builder.finish().unwrap();
    }

    let raw_size = fs::metadata(&raw_path).unwrap().len();
    let snappy_size = fs::metadata(&snappy_path).unwrap().len();
    assert!(snappy_size < raw_size / 4);

    let reader = SSTableReader::open(&snappy_path, cmp(), true).unwrap();
    assert_eq!(reader.get(&key(7)).unwrap().unwrap().value, Some(value));
}

#[test]
fn test_empty_builder_fails() {
    let temp = TempDir::new().unwrap();
    let builder = SSTableBuilder::new(&temp.path().join("empty.sst"), small_blocks(), 0).unwrap();
    assert!(builder.finish().is_err());
}

#[test]
fn test_checksum_mismatch_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("000001.sst");
    build(&path, 30, small_blocks());

    let mut bytes = fs::read(&path).unwrap();
    // inside the first data entry's value
    bytes[40] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    assert!(SSTableReader::open(&path, cmp(), true).is_err());
}

#[test]
fn test_bad_magic_rejected() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("000001.sst");
    build(&path, 10, small_blocks());

    let mut bytes = fs::read(&path).unwrap();
    bytes[0] = b'X';
    fs::write(&path, &bytes).unwrap();

    assert!(SSTableReader::open(&path, cmp(), false).is_err());
}
