//! SSTable Reader
//!
//! Opens SSTable files and serves point lookups through the sparse index.
//! The file handle sits behind a mutex so lookups only need `&self`; scans and
//! compaction open their own handle through [`SSTableIterator`].

use std::cmp::Ordering as CmpOrdering;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Buf;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{BucketError, Result};
use crate::lsm::{Comparator, Record};

use super::iterator::SSTableIterator;
use super::{parse_table_id, read_entry, SSTable, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Reader for one SSTable file
pub struct SSTableReader {
    id: u64,
    file: Mutex<BufReader<File>>,
    /// Sparse index: first key of each block → offset
    index: Vec<(Vec<u8>, u64)>,
    meta: SSTable,
    /// Index block starting offset (end of data)
    index_offset: u64,
    cmp: Arc<dyn Comparator>,
    /// Set once the table has been replaced; the file is removed on drop
    obsolete: AtomicBool,
}

impl SSTableReader {
    /// Open an SSTable for reading
    ///
    /// Loads the sparse index into memory; with `verify_checksums` the whole data
    /// section is read once and checked against the footer CRC.
    pub fn open(path: &Path, cmp: Arc<dyn Comparator>, verify_checksums: bool) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(BucketError::Storage(format!(
                "SSTable {} too small: {} bytes",
                path.display(),
                file_size
            )));
        }

        // Read and validate header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(BucketError::Storage(format!(
                "Invalid SSTable magic in {}: {:?}",
                path.display(),
                &header[0..4]
            )));
        }
        let mut buf = &header[4..];
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(BucketError::Storage(format!(
                "Unsupported SSTable version: {}",
                version
            )));
        }
        let entry_count = buf.get_u64_le();

        // Footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let mut buf = &footer[..];
        let index_offset = buf.get_u64_le();
        let meta_offset = buf.get_u64_le();
        let data_crc = buf.get_u32_le();
        let level = buf.get_u32_le();
        let min_sequence = buf.get_u64_le();
        let max_sequence = buf.get_u64_le();

        let footer_start = file_size - FOOTER_SIZE;
        if index_offset < HEADER_SIZE || meta_offset < index_offset || meta_offset > footer_start {
            return Err(BucketError::Storage(format!(
                "Corrupt SSTable footer in {}",
                path.display()
            )));
        }

        // Index and meta blocks are contiguous
        file.seek(SeekFrom::Start(index_offset))?;
        let mut tail = vec![0u8; (footer_start - index_offset) as usize];
        file.read_exact(&mut tail)?;
        let (index_block, meta_block) = tail.split_at((meta_offset - index_offset) as usize);
        let index = parse_index(index_block).ok_or_else(|| {
            BucketError::Storage(format!("Corrupt SSTable index in {}", path.display()))
        })?;
        let max_key = parse_meta(meta_block).ok_or_else(|| {
            BucketError::Storage(format!("Corrupt SSTable meta in {}", path.display()))
        })?;

        if verify_checksums {
            file.seek(SeekFrom::Start(HEADER_SIZE))?;
            let mut hasher = crc32fast::Hasher::new();
            let mut remaining = index_offset - HEADER_SIZE;
            let mut chunk = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let n = remaining.min(chunk.len() as u64) as usize;
                file.read_exact(&mut chunk[..n])?;
                hasher.update(&chunk[..n]);
                remaining -= n as u64;
            }
            if hasher.finalize() != data_crc {
                return Err(BucketError::Storage(format!(
                    "SSTable checksum mismatch in {}",
                    path.display()
                )));
            }
        }

        let min_key = index.first().map(|(k, _)| k.clone()).unwrap_or_default();
        let meta = SSTable {
            path: path.to_path_buf(),
            entry_count,
            min_key,
            max_key,
            file_size,
            level,
            min_sequence,
            max_sequence,
        };
        debug!(path = %path.display(), entry_count, level, "Opened SSTable");

        Ok(Self {
            id: parse_table_id(path).unwrap_or(0),
            file: Mutex::new(BufReader::new(file)),
            index,
            meta,
            index_offset,
            cmp,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Look up `key`; tombstones are returned as records without a value
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        if !self.might_contain(key) {
            return Ok(None);
        }
        let (start, end) = match self.block_for(key) {
            Some(bounds) => bounds,
            None => return Ok(None),
        };

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(start))?;
        let mut offset = start;
        while offset < end {
            let (record, size) = read_entry(&mut *file)?;
            offset += size;
            match self.cmp.compare(&record.key, key) {
                CmpOrdering::Less => continue,
                CmpOrdering::Equal => return Ok(Some(record)),
                CmpOrdering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Up to `limit` records at or after `start` (strictly after when not
    /// `inclusive`); the flag reports whether more records remain
    pub fn read_range(
        &self,
        start: &[u8],
        inclusive: bool,
        limit: usize,
    ) -> Result<(Vec<Record>, bool)> {
        if self.cmp.compare(start, &self.meta.max_key) == CmpOrdering::Greater {
            return Ok((Vec::new(), false));
        }

        let mut records = Vec::new();
        for item in self.iter_from(start)? {
            let record = item?;
            match self.cmp.compare(&record.key, start) {
                CmpOrdering::Less => continue,
                CmpOrdering::Equal if !inclusive => continue,
                _ => {}
            }
            if records.len() == limit {
                return Ok((records, true));
            }
            records.push(record);
        }
        Ok((records, false))
    }

    /// Iterate over every entry (compaction, dumps)
    pub fn iter(&self) -> Result<SSTableIterator> {
        SSTableIterator::open(&self.meta.path, HEADER_SIZE, self.index_offset)
    }

    /// Iterate from the block that may contain `key`; earlier keys in that block
    /// are yielded too
    pub fn iter_from(&self, key: &[u8]) -> Result<SSTableIterator> {
        let start = self.block_for(key).map_or(HEADER_SIZE, |(start, _)| start);
        SSTableIterator::open(&self.meta.path, start, self.index_offset)
    }

    /// Byte range of the block whose first key is the greatest one ≤ `key`
    fn block_for(&self, key: &[u8]) -> Option<(u64, u64)> {
        let pos = self
            .index
            .partition_point(|(first, _)| self.cmp.compare(first, key) != CmpOrdering::Greater);
        if pos == 0 {
            return None;
        }
        let start = self.index[pos - 1].1;
        let end = self.index.get(pos).map_or(self.index_offset, |(_, off)| *off);
        Some((start, end))
    }

    /// Range check against [min_key, max_key] in comparator order
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.cmp.compare(key, &self.meta.min_key) != CmpOrdering::Less
            && self.cmp.compare(key, &self.meta.max_key) != CmpOrdering::Greater
    }

    /// Whether [min_key, max_key] intersects `[start, end]` (`end` inclusive)
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.cmp.compare(&self.meta.max_key, start) != CmpOrdering::Less
            && self.cmp.compare(&self.meta.min_key, end) != CmpOrdering::Greater
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn meta(&self) -> &SSTable {
        &self.meta
    }

    pub fn path(&self) -> &PathBuf {
        &self.meta.path
    }

    pub fn entry_count(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn level(&self) -> u32 {
        self.meta.level
    }

    pub fn min_key(&self) -> &[u8] {
        &self.meta.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.meta.max_key
    }

    pub fn min_sequence(&self) -> u64 {
        self.meta.min_sequence
    }

    pub fn max_sequence(&self) -> u64 {
        self.meta.max_sequence
    }

    /// Schedule the file for deletion once the last reference is dropped
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }
}

impl Drop for SSTableReader {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            if let Err(e) = fs::remove_file(&self.meta.path) {
                warn!(path = %self.meta.path.display(), error = %e, "Failed to remove obsolete SSTable");
            }
        }
    }
}

/// Parse index entries: [key_len(4)][offset(8)][key]
fn parse_index(mut data: &[u8]) -> Option<Vec<(Vec<u8>, u64)>> {
    let mut index = Vec::new();
    while data.has_remaining() {
        if data.remaining() < 12 {
            return None;
        }
        let key_len = data.get_u32_le() as usize;
        let offset = data.get_u64_le();
        if data.remaining() < key_len {
            return None;
        }
        index.push((data[..key_len].to_vec(), offset));
        data.advance(key_len);
    }
    Some(index)
}

fn parse_meta(mut data: &[u8]) -> Option<Vec<u8>> {
    if data.remaining() < 4 {
        return None;
    }
    let len = data.get_u32_le() as usize;
    if data.remaining() != len {
        return None;
    }
    Some(data.to_vec())
}
