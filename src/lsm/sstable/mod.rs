//! SSTable Module
//!
//! Sorted String Table - immutable on-disk sorted storage, ordered by the store
//! comparator.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "BKSS" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen u32][ValLen u32][Seq u64][Flag u8][Key][Value]│
//! │   ... repeated for each entry ...                       │
//! │   (ValLen = u32::MAX means tombstone, no value bytes)   │
//! │   (Flag 1 = value is snappy-compressed)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (sparse, one entry per ~block_size bytes)   │
//! │   [KeyLen: u32][Offset: u64][Key]                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Meta Block                                              │
//! │   [MaxKeyLen: u32][MaxKey]                              │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (40 bytes)                                       │
//! │   IndexOffset u64 | MetaOffset u64 | DataCRC u32        │
//! │   Level u32 | MinSeq u64 | MaxSeq u64                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod builder;
mod iterator;
mod reader;

use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Buf;

use crate::config::CompressionType;
use crate::error::{BucketError, Result};
use crate::lsm::Record;

pub use builder::SSTableBuilder;
pub use iterator::SSTableIterator;
pub use reader::SSTableReader;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a bucketkv SSTable file
pub(crate) const MAGIC: &[u8; 4] = b"BKSS";

/// Current SSTable format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: IndexOffset (8) + MetaOffset (8) + CRC (4) + Level (4) + MinSeq (8) + MaxSeq (8)
pub(crate) const FOOTER_SIZE: u64 = 40;

/// Entry header: KeyLen (4) + ValLen (4) + Seq (8) + Flag (1)
pub(crate) const ENTRY_HEADER_SIZE: usize = 17;

/// Sentinel value indicating a tombstone (deleted key)
pub(crate) const TOMBSTONE_MARKER: u32 = u32::MAX;

/// Values shorter than this are never compressed
pub(crate) const COMPRESSION_THRESHOLD: usize = 64;

const FLAG_RAW: u8 = 0;
const FLAG_SNAPPY: u8 = 1;

// =============================================================================
// Options & Metadata
// =============================================================================

/// Per-file build options
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub block_size: usize,
    pub compression: CompressionType,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            compression: CompressionType::Snappy,
        }
    }
}

/// SSTable metadata returned by the builder and kept by every reader
#[derive(Debug, Clone)]
pub struct SSTable {
    /// Path to the SSTable file
    pub path: PathBuf,
    /// Number of entries in this SSTable
    pub entry_count: u64,
    /// Smallest key (comparator order)
    pub min_key: Vec<u8>,
    /// Largest key (comparator order)
    pub max_key: Vec<u8>,
    /// File size in bytes
    pub file_size: u64,
    /// 0 for memtable flushes, 1 for compaction output
    pub level: u32,
    pub min_sequence: u64,
    pub max_sequence: u64,
}

impl SSTable {
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }
}

// =============================================================================
// File Naming
// =============================================================================

/// "sstable_000042.sst" for id 42
pub(crate) fn table_file_name(id: u64) -> String {
    format!("sstable_{:06}.sst", id)
}

/// "sstable_000042.sst" → Some(42)
pub(crate) fn parse_table_id(path: &Path) -> Option<u64> {
    if path.extension()? != "sst" {
        return None;
    }
    let name = path.file_stem()?.to_string_lossy();
    name.strip_prefix("sstable_")?.parse().ok()
}

// =============================================================================
// Entry Codec
// =============================================================================

/// Encode a value for the data block, returning the flag and stored bytes
pub(crate) fn encode_value(value: &[u8], compression: CompressionType) -> Result<(u8, Vec<u8>)> {
    if compression == CompressionType::Snappy && value.len() >= COMPRESSION_THRESHOLD {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(value)
            .map_err(|e| BucketError::Storage(format!("snappy compress: {}", e)))?;
        if compressed.len() < value.len() {
            return Ok((FLAG_SNAPPY, compressed));
        }
    }
    Ok((FLAG_RAW, value.to_vec()))
}

fn decode_value(flag: u8, stored: Vec<u8>) -> Result<Vec<u8>> {
    match flag {
        FLAG_RAW => Ok(stored),
        FLAG_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(&stored)
            .map_err(|e| BucketError::Storage(format!("snappy decompress: {}", e))),
        other => Err(BucketError::Storage(format!(
            "Unknown value flag in SSTable entry: {}",
            other
        ))),
    }
}

/// Read one data-block entry; returns the record and its on-disk size
pub(crate) fn read_entry(reader: &mut impl Read) -> Result<(Record, u64)> {
    let mut header = [0u8; ENTRY_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let mut buf = &header[..];
    let key_len = buf.get_u32_le() as usize;
    let val_len = buf.get_u32_le();
    let sequence = buf.get_u64_le();
    let flag = buf.get_u8();

    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;

    let mut size = (ENTRY_HEADER_SIZE + key_len) as u64;
    let value = if val_len == TOMBSTONE_MARKER {
        None
    } else {
        let mut stored = vec![0u8; val_len as usize];
        reader.read_exact(&mut stored)?;
        size += u64::from(val_len);
        Some(decode_value(flag, stored)?)
    };

    Ok((
        Record {
            key,
            sequence,
            value,
        },
        size,
    ))
}
