//! SSTable Builder
//!
//! Writes comparator-sorted records to a new SSTable file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BufMut;

use crate::error::{BucketError, Result};
use crate::lsm::Record;

use super::{
    encode_value, SSTable, TableOptions, ENTRY_HEADER_SIZE, HEADER_SIZE, MAGIC, TOMBSTONE_MARKER,
    VERSION,
};

/// Builder for creating new SSTables from sorted entries
pub struct SSTableBuilder {
    path: PathBuf,
    writer: BufWriter<File>,
    options: TableOptions,
    level: u32,
    entry_count: u64,
    /// Current write position
    current_offset: u64,
    /// Offset of the entry that opened the current index block
    block_start: Option<u64>,
    /// Sparse index: first key of each block → offset
    index: Vec<(Vec<u8>, u64)>,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    min_sequence: u64,
    max_sequence: u64,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
    /// Reused encode buffer
    scratch: Vec<u8>,
}

impl SSTableBuilder {
    /// Create a new SSTable builder
    ///
    /// Writes header immediately; call `add()`/`add_tombstone()` in comparator order,
    /// then `finish()` to write index, meta and footer.
    pub fn new(path: &Path, options: TableOptions, level: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?; // entry count, patched in finish

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            options,
            level,
            entry_count: 0,
            current_offset: HEADER_SIZE,
            block_start: None,
            index: Vec::new(),
            min_key: None,
            max_key: None,
            min_sequence: u64::MAX,
            max_sequence: 0,
            data_hasher: crc32fast::Hasher::new(),
            scratch: Vec::new(),
        })
    }

    /// Add a live value
    pub fn add(&mut self, key: &[u8], sequence: u64, value: &[u8]) -> Result<()> {
        self.write_entry(key, sequence, Some(value))
    }

    /// Add a tombstone
    pub fn add_tombstone(&mut self, key: &[u8], sequence: u64) -> Result<()> {
        self.write_entry(key, sequence, None)
    }

    pub fn add_record(&mut self, record: &Record) -> Result<()> {
        self.write_entry(&record.key, record.sequence, record.value.as_deref())
    }

    fn write_entry(&mut self, key: &[u8], sequence: u64, value: Option<&[u8]>) -> Result<()> {
        let block_full = match self.block_start {
            Some(start) => self.current_offset - start >= self.options.block_size as u64,
            None => true,
        };
        if block_full {
            self.index.push((key.to_vec(), self.current_offset));
            self.block_start = Some(self.current_offset);
        }

        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = Some(key.to_vec());
        self.min_sequence = self.min_sequence.min(sequence);
        self.max_sequence = self.max_sequence.max(sequence);

        let (flag, stored) = match value {
            Some(v) => {
                let (flag, stored) = encode_value(v, self.options.compression)?;
                (flag, Some(stored))
            }
            None => (0, None),
        };

        let buf = &mut self.scratch;
        buf.clear();
        buf.put_u32_le(key.len() as u32);
        buf.put_u32_le(stored.as_ref().map_or(TOMBSTONE_MARKER, |v| v.len() as u32));
        buf.put_u64_le(sequence);
        buf.put_u8(flag);
        debug_assert_eq!(buf.len(), ENTRY_HEADER_SIZE);
        buf.extend_from_slice(key);
        if let Some(v) = &stored {
            buf.extend_from_slice(v);
        }

        self.writer.write_all(buf)?;
        self.data_hasher.update(buf);
        self.current_offset += buf.len() as u64;
        self.entry_count += 1;
        Ok(())
    }

    /// Bytes written so far (used to cut compaction output files)
    pub fn estimated_size(&self) -> u64 {
        self.current_offset
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Finish building: write index, meta and footer, and return metadata
    pub fn finish(mut self) -> Result<SSTable> {
        if self.entry_count == 0 {
            return Err(BucketError::Storage(format!(
                "Refusing to finish empty SSTable {}",
                self.path.display()
            )));
        }

        let index_offset = self.current_offset;
        let mut block = Vec::new();
        for (key, offset) in &self.index {
            block.put_u32_le(key.len() as u32);
            block.put_u64_le(*offset);
            block.extend_from_slice(key);
        }
        self.writer.write_all(&block)?;

        let meta_offset = index_offset + block.len() as u64;
        let max_key = self.max_key.clone().unwrap_or_default();
        self.writer.write_all(&(max_key.len() as u32).to_le_bytes())?;
        self.writer.write_all(&max_key)?;

        let data_crc = self.data_hasher.clone().finalize();
        let mut footer = Vec::with_capacity(super::FOOTER_SIZE as usize);
        footer.put_u64_le(index_offset);
        footer.put_u64_le(meta_offset);
        footer.put_u32_le(data_crc);
        footer.put_u32_le(self.level);
        footer.put_u64_le(self.min_sequence);
        footer.put_u64_le(self.max_sequence);
        self.writer.write_all(&footer)?;
        self.writer.flush()?;

        // Seek back and update entry count in header
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| BucketError::Storage(format!("Failed to flush SSTable: {}", e)))?;
        file.seek(SeekFrom::Start(6))?; // After magic + version
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();

        Ok(SSTable {
            path: self.path,
            entry_count: self.entry_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key,
            file_size,
            level: self.level,
            min_sequence: self.min_sequence,
            max_sequence: self.max_sequence,
        })
    }
}
