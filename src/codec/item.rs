//! Value record encoding

/// Fixed size of the item metadata header
pub const ITEM_META_SIZE: usize = 16;

/// Metadata stored in front of every payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemMeta {
    pub flag: u8,
    pub reserved: u8,
    /// Monotonic per-key counter used for version-care
    pub version: u16,
    /// Create time (unix seconds)
    pub cdate: u32,
    /// Modify time (unix seconds)
    pub mdate: u32,
    /// Expire time (unix seconds, 0 = never); mirrors the key prefix
    pub edate: u32,
}

impl ItemMeta {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.flag);
        buf.push(self.reserved);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.cdate.to_le_bytes());
        buf.extend_from_slice(&self.mdate.to_le_bytes());
        buf.extend_from_slice(&self.edate.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Self {
            flag: buf[0],
            reserved: buf[1],
            version: u16::from_le_bytes([buf[2], buf[3]]),
            cdate: u32_at(4),
            mdate: u32_at(8),
            edate: u32_at(12),
        }
    }

    /// Whether the item has expired at `now`
    pub fn is_expired(&self, now: u32) -> bool {
        self.edate > 0 && self.edate <= now
    }
}

/// Encode `[meta][payload]`
pub fn encode_item(meta: &ItemMeta, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ITEM_META_SIZE + payload.len());
    meta.write_to(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a value record into its metadata and payload
///
/// Panics if `record` is shorter than the metadata header.
pub fn decode_item(record: &[u8]) -> (ItemMeta, &[u8]) {
    assert!(
        record.len() >= ITEM_META_SIZE,
        "item record too short: {} bytes",
        record.len()
    );
    (ItemMeta::read_from(record), &record[ITEM_META_SIZE..])
}
