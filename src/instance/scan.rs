//! Migration support: the per-bucket scan on the source side and verbatim
//! replay on the destination side
//!
//! One scan at a time per instance: a second `begin_scan` is refused until
//! the first is ended. Each call to `get_next_items` returns at
//! most `migrate_batch_count` records or `migrate_batch_size` bytes, whichever
//! comes first, skipping expired and garbage records.

use tracing::{debug, warn};

use super::{read_stored, usage, Instance, UsageStat};
use crate::codec::{area_of, bucket_range, decode_item, decode_key, encode_item, encode_key, ItemMeta};
use crate::error::{BucketError, Result};
use crate::lsm::WriteBatch;
use crate::util::now_secs;

/// One live record produced by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanItem {
    pub bucket: u32,
    /// User key (area prefix included)
    pub key: Vec<u8>,
    pub meta: ItemMeta,
    pub payload: Vec<u8>,
}

/// One change replayed onto a migration destination
#[derive(Debug, Clone)]
pub(crate) enum MigratedChange {
    Put(ScanItem),
    Delete { key: Vec<u8> },
}

pub(crate) struct ScanCursor {
    bucket: u32,
    next: Vec<u8>,
    inclusive: bool,
    end: Vec<u8>,
    done: bool,
}

impl Instance {
    /// Position a scan at the first record of `bucket`
    ///
    /// Fails while another scan is in progress on this instance; the owner
    /// of that scan must call `end_scan` first.
    pub fn begin_scan(&self, bucket: u32) -> Result<()> {
        if bucket > crate::codec::MAX_BUCKET_NUMBER {
            return Err(BucketError::InvalidArgument(format!("bucket {}", bucket)));
        }
        let mut guard = self.scan.lock();
        if let Some(active) = guard.as_ref() {
            return Err(BucketError::InvalidArgument(format!(
                "scan of bucket {} already in progress",
                active.bucket
            )));
        }
        let (start, end) = bucket_range(bucket);
        *guard = Some(ScanCursor {
            bucket,
            next: start,
            inclusive: true,
            end,
            done: false,
        });
        debug!(index = self.index, bucket, "Scan started");
        Ok(())
    }

    /// Next page of the current scan; the flag is true while more may follow
    pub fn get_next_items(&self) -> Result<(Vec<ScanItem>, bool)> {
        let mut guard = self.scan.lock();
        let cursor = guard
            .as_mut()
            .ok_or_else(|| BucketError::InvalidArgument("no scan in progress".into()))?;

        let store = self.store();
        let now = now_secs();
        let mut items = Vec::new();
        while items.is_empty() && !cursor.done {
            let batch = store.db().scan(
                &cursor.next,
                cursor.inclusive,
                Some(&cursor.end),
                self.options.migrate_batch_count,
                self.options.migrate_batch_size,
                false,
            )?;
            match batch.resume_key {
                Some(key) => {
                    cursor.next = key;
                    cursor.inclusive = false;
                }
                None => cursor.done = true,
            }
            if batch.exhausted {
                cursor.done = true;
            }

            for record in batch.records {
                let Some(value) = record.value else { continue };
                let (meta, payload) = decode_item(&value);
                if meta.is_expired(now) {
                    continue;
                }
                let (_, bucket, key) = decode_key(&record.key);
                if bucket != cursor.bucket {
                    return Err(BucketError::Storage(format!(
                        "scan of bucket {} reached a record of bucket {}",
                        cursor.bucket, bucket
                    )));
                }
                items.push(ScanItem {
                    bucket,
                    key: key.to_vec(),
                    meta,
                    payload: payload.to_vec(),
                });
            }
        }
        Ok((items, !cursor.done))
    }

    pub fn end_scan(&self) {
        if self.scan.lock().take().is_some() {
            debug!(index = self.index, "Scan ended");
        }
    }

    /// Apply migrated changes to `bucket` as one write batch, keeping each
    /// item's metadata and expire time as the source stored them
    pub(crate) fn apply_migrated(&self, bucket: u32, changes: &[MigratedChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let store = self.store();
        let (_, deltas) = store.db().write_with(|db| {
            let mut batch = WriteBatch::new();
            let mut deltas: Vec<(Option<u16>, UsageStat)> = Vec::with_capacity(changes.len());
            for change in changes {
                match change {
                    MigratedChange::Put(item) => {
                        let old = read_stored(db, &encode_key(bucket, &item.key, 0))?;
                        batch.put(
                            &encode_key(bucket, &item.key, item.meta.edate),
                            &encode_item(&item.meta, &item.payload),
                        );
                        let mut delta = usage(item.key.len(), item.payload.len());
                        if let Some(old) = old {
                            delta -= old.usage;
                        }
                        deltas.push((area_of(&item.key), delta));
                    }
                    MigratedChange::Delete { key } => {
                        let lookup = encode_key(bucket, key, 0);
                        if let Some(old) = read_stored(db, &lookup)? {
                            deltas.push((area_of(key), -old.usage));
                        }
                        batch.delete(&lookup);
                    }
                }
            }
            Ok((batch, deltas))
        })?;

        for (area, delta) in deltas {
            self.stats.add(bucket, area, delta);
        }
        if let Some(cache) = &self.cache {
            for change in changes {
                let key = match change {
                    MigratedChange::Put(item) => &item.key,
                    MigratedChange::Delete { key } => key,
                };
                if let Err(e) = cache.raw_remove(bucket, key) {
                    warn!(bucket, error = %e, "Cache invalidation during migration failed");
                }
            }
        }
        Ok(())
    }
}
