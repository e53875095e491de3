//! SSTable Iterator
//!
//! Sequential iteration over a range of data-block entries. Each iterator owns
//! its own file handle, so it never contends with point lookups.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use crate::error::Result;
use crate::lsm::Record;

use super::read_entry;

/// Iterator over SSTable entries in comparator order
pub struct SSTableIterator {
    file: BufReader<File>,
    /// Stop reading when we reach this offset (start of index block)
    end_offset: u64,
    /// Current position in file
    current_offset: u64,
    /// Set after the first error; iteration stops there
    failed: bool,
}

impl SSTableIterator {
    pub(super) fn open(path: &Path, start_offset: u64, end_offset: u64) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        file.seek(SeekFrom::Start(start_offset))?;
        Ok(Self {
            file,
            end_offset,
            current_offset: start_offset,
            failed: false,
        })
    }
}

impl Iterator for SSTableIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.current_offset >= self.end_offset {
            return None;
        }

        match read_entry(&mut self.file) {
            Ok((record, size)) => {
                self.current_offset += size;
                Some(Ok(record))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
