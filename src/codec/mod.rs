//! Key/Item Codec
//!
//! Encodes the composite on-disk key and the value record written to every instance
//! store. Only this module writes these records, so decoding a malformed record is an
//! invariant violation and panics instead of returning an error.
//!
//! ## Key Format
//! ```text
//! ┌──────────────────┬───────────────────┬──────────────────────────────┐
//! │ ExpireTime (4 LE)│ Bucket (3 BE)     │ UserKey = [Area (2 LE)][...] │
//! └──────────────────┴───────────────────┴──────────────────────────────┘
//! ```
//! Ordering skips the expire-time prefix (see `gc::GcComparator`), so one bucket's keys
//! are contiguous regardless of TTL.
//!
//! ## Item Format
//! ```text
//! ┌──────┬──────────┬─────────┬───────┬───────┬───────┬──────────────┐
//! │Flag 1│Reserved 1│Version 2│Cdate 4│Mdate 4│Edate 4│   Payload    │
//! └──────┴──────────┴─────────┴───────┴───────┴───────┴──────────────┘
//! ```

mod item;
mod key;

pub use item::{decode_item, encode_item, ItemMeta, ITEM_META_SIZE};
pub use key::{
    area_of, bucket_range, decode_bucket, decode_expire_time, decode_key, encode_bucket_prefix,
    encode_key, merge_area, AREA_SIZE, BUCKET_NUM_SIZE, EXPIRE_TIME_SIZE, KEY_META_SIZE,
    MAX_BUCKET_NUMBER,
};
