//! Balancer
//!
//! Moves buckets between instances until every instance owns ⌊avg⌋ or
//! ⌈avg⌉ of them. Map strategy only; the hash strategy cannot reroute.
//!
//! ## Migration Unit
//! ```text
//!  Computing ──► Copying ──► Pausing ──► Committing
//!                  │            │            │
//!          scan source,   pause writes,  reindex → to,
//!          batch into     drain changes  flush dest,
//!          destination    since copy     close on source,
//!                         started        resume writes
//! ```
//!
//! Until the indexer flips, the source keeps serving the bucket and the
//! destination's copy is unowned garbage. A failed or interrupted unit tags
//! that copy for collection; a crash leaves it to the stray purge on the next
//! open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::codec::{bucket_range, decode_item, decode_key};
use crate::config::IndexerStrategy;
use crate::error::{BucketError, Result};
use crate::instance::{Instance, InstanceStore, MigratedChange, ScanItem};
use crate::manager::Shared;

/// One bucket to move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationUnit {
    pub bucket: u32,
    pub from: usize,
    pub to: usize,
}

/// Outcome of one balancing run
#[derive(Debug, Clone, Default)]
pub struct BalanceReport {
    pub planned: usize,
    pub moved: Vec<MigrationUnit>,
    /// First failing unit; the run stops there
    pub failed: Option<(MigrationUnit, String)>,
    pub stopped: bool,
}

impl BalanceReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none() && !self.stopped && self.moved.len() == self.planned
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Units that bring every instance within ⌊avg⌋/⌈avg⌉ of the mean
///
/// `owned[i]` lists the buckets of instance `i`. Instances already holding the
/// most buckets keep the ⌈avg⌉ quotas; the surplus (highest bucket ids first)
/// is dealt round-robin to instances below their quota.
pub fn plan(owned: &[Vec<u32>]) -> Vec<MigrationUnit> {
    let total = owned.len();
    if total == 0 {
        return Vec::new();
    }
    let count: usize = owned.iter().map(Vec::len).sum();
    let floor = count / total;
    let extra = count % total;

    let mut by_size: Vec<usize> = (0..total).collect();
    by_size.sort_by(|a, b| owned[*b].len().cmp(&owned[*a].len()).then(a.cmp(b)));
    let mut quota = vec![floor; total];
    for index in by_size.into_iter().take(extra) {
        quota[index] += 1;
    }

    let mut surplus = Vec::new();
    for (index, buckets) in owned.iter().enumerate() {
        if buckets.len() > quota[index] {
            let mut sorted = buckets.clone();
            sorted.sort_unstable();
            let give = sorted.len() - quota[index];
            surplus.extend(sorted.into_iter().rev().take(give).map(|b| (b, index)));
        }
    }

    let mut deficit: Vec<(usize, usize)> = owned
        .iter()
        .enumerate()
        .filter(|(index, buckets)| buckets.len() < quota[*index])
        .map(|(index, buckets)| (index, quota[index] - buckets.len()))
        .collect();

    let mut units = Vec::with_capacity(surplus.len());
    let mut cursor = 0;
    for (bucket, from) in surplus {
        if deficit.is_empty() {
            break;
        }
        cursor %= deficit.len();
        let (to, need) = &mut deficit[cursor];
        units.push(MigrationUnit {
            bucket,
            from,
            to: *to,
        });
        *need -= 1;
        if *need == 0 {
            deficit.remove(cursor);
        } else {
            cursor += 1;
        }
    }
    units
}

// =============================================================================
// Running
// =============================================================================

/// One balancing pass; stops at the first failing unit
pub(crate) fn run(shared: &Shared, stop: &dyn Fn() -> bool) -> Result<BalanceReport> {
    if shared.indexer.strategy() == IndexerStrategy::Hash {
        warn!("Balancing skipped: hash indexer cannot reroute buckets");
        return Ok(BalanceReport::default());
    }

    let owned: Vec<Vec<u32>> = shared.instances.iter().map(|i| i.get_buckets()).collect();
    let units = plan(&owned);
    let mut report = BalanceReport {
        planned: units.len(),
        ..Default::default()
    };
    if units.is_empty() {
        info!("Buckets already balanced");
        return Ok(report);
    }
    warn!(units = units.len(), "Balancing started");

    for unit in units {
        if stop() {
            report.stopped = true;
            break;
        }
        match migrate(shared, unit, stop) {
            Ok(true) => report.moved.push(unit),
            Ok(false) => {
                report.stopped = true;
                break;
            }
            Err(e) => {
                error!(?unit, error = %e, "Bucket migration failed; balancing aborted");
                report.failed = Some((unit, e.to_string()));
                break;
            }
        }
    }

    warn!(
        planned = report.planned,
        moved = report.moved.len(),
        stopped = report.stopped,
        failed = report.failed.is_some(),
        "Balancing finished"
    );
    Ok(report)
}

/// Move one bucket; `Ok(false)` when stopped before the commit
fn migrate(shared: &Shared, unit: MigrationUnit, stop: &dyn Fn() -> bool) -> Result<bool> {
    let _admin = shared.admin.lock();
    let (Some(source), Some(dest)) = (shared.instances.get(unit.from), shared.instances.get(unit.to))
    else {
        return Err(BucketError::InvalidArgument(format!("no such instance in {:?}", unit)));
    };
    if !source.exist(unit.bucket) || shared.indexer.lookup(unit.bucket) != Some(unit.from) {
        return Err(BucketError::InvalidArgument(format!(
            "bucket {} is not served by instance {}",
            unit.bucket, unit.from
        )));
    }

    // stale data from an earlier attempt must not leak into the new copy
    dest.tag_bucket_garbage(unit.bucket)?;
    dest.init_buckets(&[unit.bucket]);

    let outcome = transfer(shared, source, dest, unit, stop);
    if !matches!(outcome, Ok(true)) {
        shared.gate.resume(unit.bucket);
        if let Err(e) = dest.close_buckets(&[unit.bucket]) {
            error!(?unit, error = %e, "Failed to discard partial copy");
        }
    }
    outcome
}

fn transfer(
    shared: &Shared,
    source: &Instance,
    dest: &Instance,
    unit: MigrationUnit,
    stop: &dyn Fn() -> bool,
) -> Result<bool> {
    let started = Instant::now();
    let src_store = source.store();
    let pin = src_store
        .db()
        .pin_sequence(src_store.db().latest_sequence());
    let copy_start = pin.sequence();

    // Copying
    let Some(copied) = copy(source, dest, unit.bucket, stop)? else {
        info!(?unit, "Migration stopped during copy");
        return Ok(false);
    };

    // Pausing
    shared.gate.pause(unit.bucket);
    let drained = drain(&src_store, dest, unit.bucket, copy_start, source.options().migrate_batch_count)?;

    // Committing
    shared.indexer.reindex(unit.bucket, unit.from, unit.to)?;
    if let Err(e) = dest.flush() {
        warn!(?unit, error = %e, "Destination flush after migration failed");
    }
    if let Err(e) = source.close_buckets(&[unit.bucket]) {
        error!(?unit, error = %e, "Closing migrated bucket on source failed");
    }
    shared.gate.resume(unit.bucket);
    drop(pin);

    warn!(
        ?unit,
        copied,
        drained,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Bucket migrated"
    );
    Ok(true)
}

/// Stream the bucket from `source` into `dest`; `None` when stopped
fn copy(
    source: &Instance,
    dest: &Instance,
    bucket: u32,
    stop: &dyn Fn() -> bool,
) -> Result<Option<usize>> {
    source.begin_scan(bucket)?;
    let result = (|| -> Result<Option<usize>> {
        let mut copied = 0;
        loop {
            if stop() {
                return Ok(None);
            }
            let (items, more) = source.get_next_items()?;
            let changes: Vec<MigratedChange> = items.into_iter().map(MigratedChange::Put).collect();
            dest.apply_migrated(bucket, &changes)?;
            copied += changes.len();
            debug!(bucket, batch = changes.len(), copied, "Migration batch copied");
            if !more {
                return Ok(Some(copied));
            }
        }
    })();
    source.end_scan();
    result
}

/// Replay every change the source took after `copy_start`, deletions included
fn drain(
    src_store: &InstanceStore,
    dest: &Instance,
    bucket: u32,
    copy_start: u64,
    batch_count: usize,
) -> Result<usize> {
    let (start, end) = bucket_range(bucket);
    let mut next = start;
    let mut inclusive = true;
    let mut drained = 0;
    loop {
        let batch = src_store
            .db()
            .scan(&next, inclusive, Some(&end), batch_count, 0, true)?;
        let changes: Vec<MigratedChange> = batch
            .records
            .into_iter()
            .filter(|record| record.sequence > copy_start)
            .map(|record| {
                let (_, _, key) = decode_key(&record.key);
                match record.value {
                    Some(value) => {
                        let (meta, payload) = decode_item(&value);
                        MigratedChange::Put(ScanItem {
                            bucket,
                            key: key.to_vec(),
                            meta,
                            payload: payload.to_vec(),
                        })
                    }
                    None => MigratedChange::Delete { key: key.to_vec() },
                }
            })
            .collect();
        dest.apply_migrated(bucket, &changes)?;
        drained += changes.len();

        match batch.resume_key {
            Some(key) if !batch.exhausted => {
                next = key;
                inclusive = false;
            }
            _ => break,
        }
    }
    Ok(drained)
}

// =============================================================================
// Background Worker
// =============================================================================

/// Handle to a background balancing run
pub struct Balancer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Option<BalanceReport>>>,
}

impl Balancer {
    pub(crate) fn start(shared: Arc<Shared>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("balancer".into())
            .spawn(move || match run(&shared, &|| flag.load(Ordering::SeqCst)) {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(error = %e, "Balancing run failed");
                    None
                }
            })
            .map_err(|e| BucketError::EngineIo(format!("spawn balancer thread: {}", e)))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the run to finish on its own
    pub fn join(mut self) -> Option<BalanceReport> {
        self.wait()
    }

    /// Stop after the current batch and wait
    pub fn stop(mut self) -> Option<BalanceReport> {
        self.stop.store(true, Ordering::SeqCst);
        self.wait()
    }

    fn wait(&mut self) -> Option<BalanceReport> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(report) => report,
            Err(_) => {
                error!("Balancer thread panicked");
                None
            }
        }
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wait();
    }
}
