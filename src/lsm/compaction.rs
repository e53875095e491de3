//! Compaction merge
//!
//! Merges a set of input tables into new level-1 tables. For every key only the
//! newest version survives; older versions are always discarded. What happens
//! to the survivor depends on whether the inputs are *exclusive*, i.e. no table
//! outside the job overlaps their key span:
//!
//! | newest version              | exclusive, not pinned | otherwise          |
//! |-----------------------------|-----------------------|--------------------|
//! | tombstone                   | dropped               | kept               |
//! | live, `should_drop` = true  | dropped               | becomes tombstone  |
//! | live                        | kept                  | kept               |
//!
//! A version is *pinned* when its sequence is above the smallest pinned sequence
//! of the store; pinned changes must stay observable as deletions.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::lsm::sstable::{SSTableBuilder, SSTableIterator, SSTableReader};
use crate::lsm::tables::TableSet;
use crate::lsm::{Comparator, Record};

/// Counters for one compaction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub input_files: usize,
    pub output_files: usize,
    /// Records read from inputs
    pub records_in: u64,
    /// Records written to outputs
    pub records_out: u64,
    /// Newest versions discarded outright
    pub dropped: u64,
    /// Live versions rewritten as tombstones
    pub converted: u64,
}

impl CompactionStats {
    pub(crate) fn merge(&mut self, other: CompactionStats) {
        self.input_files += other.input_files;
        self.output_files += other.output_files;
        self.records_in += other.records_in;
        self.records_out += other.records_out;
        self.dropped += other.dropped;
        self.converted += other.converted;
    }
}

pub(crate) struct CompactionJob {
    pub inputs: Vec<Arc<SSTableReader>>,
    pub exclusive: bool,
    /// Smallest pinned sequence, if any
    pub pinned_floor: Option<u64>,
    /// Wall clock handed to `should_drop`
    pub now: u32,
}

/// Run `job` and install its output in place of the inputs
pub(crate) fn run(
    tables: &TableSet,
    cmp: &dyn Comparator,
    job: CompactionJob,
    target_file_size: u64,
) -> Result<CompactionStats> {
    let mut stats = CompactionStats {
        input_files: job.inputs.len(),
        ..Default::default()
    };
    if job.inputs.is_empty() {
        return Ok(stats);
    }

    let mut output = OutputSet::new(tables, target_file_size);
    if let Err(e) = merge_into(&mut output, cmp, &job, &mut stats) {
        output.abandon();
        return Err(e);
    }
    let ids = output.finish()?;

    let mut readers = Vec::with_capacity(ids.len());
    for id in &ids {
        match tables.open_table(*id) {
            Ok(reader) => readers.push(reader),
            Err(e) => {
                ids.iter().for_each(|id| tables.discard(*id));
                return Err(e);
            }
        }
    }
    stats.output_files = readers.len();

    let removed: Vec<u64> = job.inputs.iter().map(|t| t.id()).collect();
    tables.install(readers, &removed)?;

    info!(
        inputs = stats.input_files,
        outputs = stats.output_files,
        records_in = stats.records_in,
        records_out = stats.records_out,
        dropped = stats.dropped,
        converted = stats.converted,
        exclusive = job.exclusive,
        "Compaction finished"
    );
    Ok(stats)
}

fn merge_into(
    output: &mut OutputSet<'_>,
    cmp: &dyn Comparator,
    job: &CompactionJob,
    stats: &mut CompactionStats,
) -> Result<()> {
    let mut iters: Vec<SSTableIterator> = Vec::with_capacity(job.inputs.len());
    for table in &job.inputs {
        iters.push(table.iter()?);
    }
    let mut heads: Vec<Option<Record>> = Vec::with_capacity(iters.len());
    for iter in iters.iter_mut() {
        heads.push(iter.next().transpose()?);
    }

    loop {
        // smallest key among the heads
        let mut smallest: Option<usize> = None;
        for (i, head) in heads.iter().enumerate() {
            if let Some(record) = head {
                let better = match smallest.and_then(|s| heads[s].as_ref()) {
                    Some(current) => cmp.compare(&record.key, &current.key) == CmpOrdering::Less,
                    None => true,
                };
                if better {
                    smallest = Some(i);
                }
            }
        }
        let Some(first) = smallest else {
            break;
        };
        let key = match &heads[first] {
            Some(record) => record.key.clone(),
            None => break,
        };

        // collect every head with that key, keeping the newest
        let mut newest: Option<Record> = None;
        for i in 0..heads.len() {
            let matches = heads[i]
                .as_ref()
                .map_or(false, |r| cmp.compare(&r.key, &key) == CmpOrdering::Equal);
            if !matches {
                continue;
            }
            let record = heads[i].take();
            heads[i] = iters[i].next().transpose()?;
            stats.records_in += 1;
            if let Some(record) = record {
                if newest.as_ref().map_or(true, |n| record.sequence > n.sequence) {
                    newest = Some(record);
                }
            }
        }

        if let Some(record) = newest {
            if let Some(out) = decide(record, cmp, job, stats) {
                output.add(&out)?;
                stats.records_out += 1;
            }
        }
    }
    Ok(())
}

/// Apply the drop rules to the newest version of a key
fn decide(
    record: Record,
    cmp: &dyn Comparator,
    job: &CompactionJob,
    stats: &mut CompactionStats,
) -> Option<Record> {
    let can_vanish = job.exclusive && job.pinned_floor.map_or(true, |floor| record.sequence <= floor);

    if record.is_tombstone() {
        if can_vanish {
            stats.dropped += 1;
            return None;
        }
        return Some(record);
    }

    if cmp.should_drop(&record.key, record.sequence, job.now) {
        if can_vanish {
            stats.dropped += 1;
            return None;
        }
        stats.converted += 1;
        return Some(Record {
            value: None,
            ..record
        });
    }
    Some(record)
}

/// Output files of one compaction, cut at the target size
struct OutputSet<'a> {
    tables: &'a TableSet,
    target_file_size: u64,
    current: Option<(u64, SSTableBuilder)>,
    finished: Vec<u64>,
}

impl<'a> OutputSet<'a> {
    fn new(tables: &'a TableSet, target_file_size: u64) -> Self {
        Self {
            tables,
            target_file_size,
            current: None,
            finished: Vec::new(),
        }
    }

    fn add(&mut self, record: &Record) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(self.tables.new_builder(1)?);
        }
        if let Some((_, builder)) = self.current.as_mut() {
            builder.add_record(record)?;
            if builder.estimated_size() >= self.target_file_size {
                self.cut()?;
            }
        }
        Ok(())
    }

    fn cut(&mut self) -> Result<()> {
        if let Some((id, builder)) = self.current.take() {
            let meta = builder.finish()?;
            debug!(path = %meta.path.display(), entries = meta.entry_count, "Compaction output cut");
            self.finished.push(id);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u64>> {
        if let Err(e) = self.cut() {
            self.abandon();
            return Err(e);
        }
        Ok(std::mem::take(&mut self.finished))
    }

    fn abandon(&mut self) {
        if let Some((id, builder)) = self.current.take() {
            drop(builder);
            self.tables.discard(id);
        }
        for id in self.finished.drain(..) {
            self.tables.discard(id);
        }
    }
}
