//! Store comparator: TTL and garbage aware

use std::cmp::Ordering;
use std::sync::Arc;

use crate::codec::{area_of, decode_bucket, decode_expire_time, EXPIRE_TIME_SIZE, KEY_META_SIZE};
use crate::lsm::Comparator;

use super::GcFactory;

/// Orders composite keys by `[bucket][user_key]` and reports expired or
/// garbage-tagged records as droppable
pub struct GcComparator {
    gc: Arc<GcFactory>,
}

impl GcComparator {
    pub fn new(gc: Arc<GcFactory>) -> Self {
        Self { gc }
    }

    pub fn factory(&self) -> &Arc<GcFactory> {
        &self.gc
    }
}

/// Key bytes after the expire-time prefix
fn ordered_part(key: &[u8]) -> &[u8] {
    key.get(EXPIRE_TIME_SIZE..).unwrap_or(&[])
}

impl Comparator for GcComparator {
    fn name(&self) -> &str {
        "bucketkv.GcComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        ordered_part(a).cmp(ordered_part(b))
    }

    fn should_drop(&self, key: &[u8], sequence: u64, now: u32) -> bool {
        if key.len() < KEY_META_SIZE {
            return false;
        }
        let expire = decode_expire_time(key);
        if expire > 0 && expire <= now {
            return true;
        }
        let bucket = decode_bucket(key);
        let area = area_of(&key[KEY_META_SIZE..]);
        self.gc.should_drop(bucket, area, sequence)
    }
}
