//! Compaction Scheduler
//!
//! One background thread per instance. Each tick (a `recv_timeout` on the stop
//! channel) it does nothing outside the configured hour window, while paused,
//! or while its previous work is still running. Otherwise:
//!
//! 1. Pending garbage first: take one tag (buckets before areas), compact the
//!    tables holding its key range that were written at or before the tag's
//!    sequence, then remove the tag and move on to the next.
//! 2. With no garbage pending, at most once per `full_interval`, run a full
//!    round and retire every tag older than the round start.
//!
//! Failures are logged and retried on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Local, Timelike};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec::{bucket_range, encode_bucket_prefix, MAX_BUCKET_NUMBER};
use crate::config::{Config, HourRange};
use crate::error::{BucketError, Result};
use crate::gc::GcTarget;
use crate::instance::InstanceStore;
use crate::util::now_secs;

/// Scheduler timing
#[derive(Debug, Clone, Copy)]
pub struct CompactionSettings {
    /// Local hours in which compaction may run
    pub hour_range: HourRange,
    /// Tick period
    pub check_interval: Duration,
    /// Minimum pause between full rounds
    pub full_interval: Duration,
}

impl From<&Config> for CompactionSettings {
    fn from(config: &Config) -> Self {
        Self {
            hour_range: config.compact_hour_range,
            check_interval: config.check_compact_interval,
            full_interval: config.full_compaction_interval,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    stopping: AtomicBool,
    paused: AtomicBool,
    running: AtomicBool,
    last_full_round: Mutex<Option<Instant>>,
}

/// Handle to a running scheduler thread; stopping (or dropping) joins it
pub struct CompactionScheduler {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    state: Arc<SchedulerState>,
}

impl CompactionScheduler {
    pub fn start(
        name: &str,
        store: Arc<InstanceStore>,
        settings: CompactionSettings,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded(1);
        let state = Arc::new(SchedulerState::default());
        let worker_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name(format!("compact-{}", name))
            .spawn(move || run_worker(stop_rx, store, settings, worker_state))
            .map_err(|e| BucketError::EngineIo(format!("spawn compaction thread: {}", e)))?;

        debug!(name, ?settings, "Compaction scheduler started");
        Ok(Self {
            stop_tx,
            handle: Some(handle),
            state,
        })
    }

    /// Skip ticks until resumed
    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    /// A tick is doing compaction work right now
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Signal the thread and wait for it; the current compaction finishes first
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Compaction thread panicked");
            }
        }
    }
}

impl Drop for CompactionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    stop_rx: Receiver<()>,
    store: Arc<InstanceStore>,
    settings: CompactionSettings,
    state: Arc<SchedulerState>,
) {
    loop {
        match stop_rx.recv_timeout(settings.check_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if state.paused.load(Ordering::SeqCst) {
            continue;
        }
        let hour = Local::now().hour();
        if !settings.hour_range.contains(hour) {
            continue;
        }
        if state.running.swap(true, Ordering::SeqCst) {
            continue;
        }

        tick(&store, &settings, &state);
        state.running.store(false, Ordering::SeqCst);
    }
    debug!(path = %store.db().path().display(), "Compaction scheduler stopped");
}

fn tick(store: &InstanceStore, settings: &CompactionSettings, state: &SchedulerState) {
    let stop_requested = || state.stopping.load(Ordering::SeqCst);

    if !store.gc().is_empty() {
        if let Err(e) = compact_pending(store, &stop_requested) {
            error!(error = %e, path = %store.db().path().display(), "Garbage compaction failed");
        }
        return;
    }

    let last_round = *state.last_full_round.lock();
    let due = last_round.map_or(true, |last| last.elapsed() >= settings.full_interval);
    if !due {
        return;
    }
    match full_round(store) {
        Ok(_) => *state.last_full_round.lock() = Some(Instant::now()),
        Err(e) => error!(error = %e, path = %store.db().path().display(), "Full compaction round failed"),
    }
}

/// Key range holding every record a tag covers
pub(crate) fn target_range(target: &GcTarget) -> (Vec<u8>, Vec<u8>) {
    match target {
        GcTarget::Bucket(bucket, _) => bucket_range(*bucket),
        // areas span every bucket
        GcTarget::Area(..) => (
            Vec::new(),
            encode_bucket_prefix(MAX_BUCKET_NUMBER + 1).to_vec(),
        ),
    }
}

/// Compact the range of each pending tag in turn and remove it; returns the
/// number of tags removed
pub(crate) fn compact_pending(store: &InstanceStore, stop: &dyn Fn() -> bool) -> Result<usize> {
    let mut removed = 0;
    while let Some(target) = store.gc().next_pending() {
        if stop() {
            break;
        }
        let (start, end) = target_range(&target);
        let stats = store
            .db()
            .compact_range(&start, &end, target.node().sequence)?;
        if store.gc().remove(&target)? {
            removed += 1;
        }
        info!(
            ?target,
            dropped = stats.dropped,
            converted = stats.converted,
            "Garbage tag compacted"
        );
    }
    Ok(removed)
}

/// Full compaction round followed by tag retirement; returns tags retired
pub(crate) fn full_round(store: &InstanceStore) -> Result<usize> {
    let round_start = now_secs();
    let stats = store.db().compact_all()?;
    let retired = store.gc().finish(round_start)?;
    if retired > 0 {
        warn!(retired, "Garbage tags retired by full round");
    }
    info!(
        round_start,
        inputs = stats.input_files,
        outputs = stats.output_files,
        dropped = stats.dropped,
        "Full compaction round finished"
    );
    Ok(retired)
}
