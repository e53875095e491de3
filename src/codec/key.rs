//! Composite key encoding

/// Bytes of the expire-time prefix
pub const EXPIRE_TIME_SIZE: usize = 4;

/// Bytes of the bucket number
pub const BUCKET_NUM_SIZE: usize = 3;

/// Expire time + bucket number
pub const KEY_META_SIZE: usize = EXPIRE_TIME_SIZE + BUCKET_NUM_SIZE;

/// Bytes of the area number at the head of a user key
pub const AREA_SIZE: usize = 2;

/// Largest bucket id the 3-byte field can carry (one value reserved for range ends)
pub const MAX_BUCKET_NUMBER: u32 = (1 << 24) - 2;

/// Encode `[expire_time][bucket][user_key]`
pub fn encode_key(bucket: u32, user_key: &[u8], expire_time: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_META_SIZE + user_key.len());
    buf.extend_from_slice(&encode_bucket_prefix_with(bucket, expire_time));
    buf.extend_from_slice(user_key);
    buf
}

/// Decode a composite key into `(expire_time, bucket, user_key)`
///
/// Panics if `key` is shorter than the key meta.
pub fn decode_key(key: &[u8]) -> (u32, u32, &[u8]) {
    assert!(
        key.len() >= KEY_META_SIZE,
        "composite key too short: {} bytes",
        key.len()
    );
    (
        decode_expire_time(key),
        decode_bucket(key),
        &key[KEY_META_SIZE..],
    )
}

/// The 7-byte key meta with a zero expire time; the smallest key of `bucket`
pub fn encode_bucket_prefix(bucket: u32) -> [u8; KEY_META_SIZE] {
    encode_bucket_prefix_with(bucket, 0)
}

fn encode_bucket_prefix_with(bucket: u32, expire_time: u32) -> [u8; KEY_META_SIZE] {
    assert!(bucket <= MAX_BUCKET_NUMBER + 1, "bucket {} out of range", bucket);
    let mut meta = [0u8; KEY_META_SIZE];
    meta[..EXPIRE_TIME_SIZE].copy_from_slice(&expire_time.to_le_bytes());
    // big-endian so the default bytewise order sorts buckets numerically
    let be = bucket.to_be_bytes();
    meta[EXPIRE_TIME_SIZE..].copy_from_slice(&be[1..]);
    meta
}

/// Expire time stored at offset 0
pub fn decode_expire_time(key: &[u8]) -> u32 {
    assert!(key.len() >= EXPIRE_TIME_SIZE, "composite key too short");
    u32::from_le_bytes([key[0], key[1], key[2], key[3]])
}

/// Bucket number stored after the expire time
pub fn decode_bucket(key: &[u8]) -> u32 {
    assert!(key.len() >= KEY_META_SIZE, "composite key too short");
    let b = &key[EXPIRE_TIME_SIZE..KEY_META_SIZE];
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

/// Area number carried by the first two bytes of a user key
pub fn area_of(user_key: &[u8]) -> Option<u16> {
    if user_key.len() < AREA_SIZE {
        return None;
    }
    Some(u16::from(user_key[1]) << 8 | u16::from(user_key[0]))
}

/// Prefix `key` with its area number
pub fn merge_area(area: u16, key: &[u8]) -> Vec<u8> {
    let mut merged = Vec::with_capacity(AREA_SIZE + key.len());
    merged.extend_from_slice(&area.to_le_bytes());
    merged.extend_from_slice(key);
    merged
}

/// `[start, end)` covering every key of `bucket`
pub fn bucket_range(bucket: u32) -> (Vec<u8>, Vec<u8>) {
    (
        encode_bucket_prefix(bucket).to_vec(),
        encode_bucket_prefix(bucket + 1).to_vec(),
    )
}
