//! Tests for the key/item codec
//!
//! These tests verify:
//! - Composite key layout and decoding
//! - Comparator order ignores the expire-time prefix
//! - Area helpers
//! - Item records and expiry
//! - Malformed records are invariant violations

use std::cmp::Ordering;
use std::sync::Arc;

use bucketkv::codec::{
    area_of, bucket_range, decode_bucket, decode_expire_time, decode_item, decode_key,
    encode_bucket_prefix, encode_item, encode_key, merge_area, ItemMeta, ITEM_META_SIZE,
    KEY_META_SIZE, MAX_BUCKET_NUMBER,
};
use bucketkv::gc::{GcComparator, GcFactory};
use bucketkv::lsm::Comparator;

fn comparator() -> GcComparator {
    GcComparator::new(Arc::new(GcFactory::new()))
}

// =============================================================================
// Key Tests
// =============================================================================

#[test]
fn test_key_round_trip() {
    let key = encode_key(513, b"\x01\x00user", 1_700_000_000);

    assert_eq!(key.len(), KEY_META_SIZE + 6);
    assert_eq!(decode_key(&key), (1_700_000_000, 513, &b"\x01\x00user"[..]));
    assert_eq!(decode_bucket(&key), 513);
    assert_eq!(decode_expire_time(&key), 1_700_000_000);
}

#[test]
fn test_key_byte_layout() {
    let key = encode_key(0x0A0B0C, b"k", 0x01020304);
    // expire time little-endian, bucket big-endian
    assert_eq!(&key[..7], &[0x04, 0x03, 0x02, 0x01, 0x0A, 0x0B, 0x0C]);
    assert_eq!(&key[7..], b"k");
}

#[test]
fn test_order_ignores_expire_time() {
    let cmp = comparator();
    let never = encode_key(7, b"same", 0);
    let soon = encode_key(7, b"same", 42);
    assert_eq!(cmp.compare(&never, &soon), Ordering::Equal);

    let a = encode_key(7, b"a", 999);
    let b = encode_key(7, b"b", 1);
    assert_eq!(cmp.compare(&a, &b), Ordering::Less);
}

#[test]
fn test_buckets_sort_numerically() {
    let cmp = comparator();
    let low = encode_key(255, b"zzz", 0);
    let high = encode_key(256, b"aaa", 0);
    assert_eq!(cmp.compare(&low, &high), Ordering::Less);
}

#[test]
fn test_bucket_range_covers_bucket() {
    let cmp = comparator();
    let (start, end) = bucket_range(10);

    for key in [encode_key(10, b"\x00", 5), encode_key(10, &[0xFF; 32], 0)] {
        assert_eq!(cmp.compare(&start, &key), Ordering::Less);
        assert_eq!(cmp.compare(&key, &end), Ordering::Less);
    }
    assert_ne!(cmp.compare(&encode_key(11, b"a", 0), &end), Ordering::Less);
    assert_eq!(start, encode_bucket_prefix(10).to_vec());
}

#[test]
fn test_max_bucket_range_end_is_encodable() {
    let (_, end) = bucket_range(MAX_BUCKET_NUMBER);
    assert_eq!(decode_bucket(&end), MAX_BUCKET_NUMBER + 1);
}

// =============================================================================
// Area Tests
// =============================================================================

#[test]
fn test_area_round_trip() {
    let key = merge_area(0x1234, b"user");
    assert_eq!(&key[..2], &[0x34, 0x12]);
    assert_eq!(area_of(&key), Some(0x1234));
}

#[test]
fn test_area_of_short_key() {
    assert_eq!(area_of(b"x"), None);
    assert_eq!(area_of(b""), None);
}

// =============================================================================
// Item Tests
// =============================================================================

#[test]
fn test_item_round_trip() {
    let meta = ItemMeta {
        flag: 3,
        reserved: 0,
        version: 17,
        cdate: 100,
        mdate: 200,
        edate: 300,
    };
    let record = encode_item(&meta, b"payload");

    assert_eq!(record.len(), ITEM_META_SIZE + 7);
    let (decoded, payload) = decode_item(&record);
    assert_eq!(decoded, meta);
    assert_eq!(payload, b"payload");
}

#[test]
fn test_empty_payload() {
    let record = encode_item(&ItemMeta::default(), b"");
    let (_, payload) = decode_item(&record);
    assert!(payload.is_empty());
}

#[test]
fn test_item_expiry() {
    let mut meta = ItemMeta::default();
    assert!(!meta.is_expired(u32::MAX));

    meta.edate = 1_000;
    assert!(!meta.is_expired(999));
    assert!(meta.is_expired(1_000));
    assert!(meta.is_expired(1_001));
}

#[test]
#[should_panic]
fn test_short_record_panics() {
    decode_item(&[0u8; ITEM_META_SIZE - 1]);
}

#[test]
#[should_panic]
fn test_short_key_panics() {
    decode_key(&[0u8; KEY_META_SIZE - 1]);
}
