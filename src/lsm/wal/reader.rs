//! WAL Reader
//!
//! Sequentially reads entries from a WAL file, classifying each one.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use bytes::Buf;

use crate::error::Result;

use super::{WalEntry, HEADER_SIZE};

/// Upper bound on a single entry's data section; larger lengths are garbage
const MAX_ENTRY_SIZE: usize = 256 * 1024 * 1024;

/// Outcome of reading one record
#[derive(Debug)]
pub enum ReadResult {
    /// Intact entry
    Valid(WalEntry),
    /// Complete record whose checksum or payload is bad
    Corrupted { lsn: u64 },
    /// Record cut short by a crash; nothing after it is readable
    Partial,
}

/// Reads entries from a WAL file
pub struct WalReader {
    reader: BufReader<File>,
    /// Offset just past the last complete record
    offset: u64,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Offset just past the last complete record read so far
    pub fn valid_offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record; `Ok(None)` at a clean end of file
    pub fn next_record(&mut self) -> Result<Option<ReadResult>> {
        let mut header = [0u8; HEADER_SIZE];
        match read_fully(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => return Ok(Some(ReadResult::Partial)),
            _ => {}
        }

        let mut buf = &header[..];
        let lsn = buf.get_u64_le();
        let crc = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if len > MAX_ENTRY_SIZE {
            return Ok(Some(ReadResult::Partial));
        }

        let mut data = vec![0u8; len];
        if read_fully(&mut self.reader, &mut data)? < len {
            return Ok(Some(ReadResult::Partial));
        }
        self.offset += (HEADER_SIZE + len) as u64;

        if crc32fast::hash(&data) != crc {
            return Ok(Some(ReadResult::Corrupted { lsn }));
        }
        match WalEntry::deserialize(&data) {
            Ok(entry) if entry.lsn == lsn => Ok(Some(ReadResult::Valid(entry))),
            _ => Ok(Some(ReadResult::Corrupted { lsn })),
        }
    }
}

/// Fill `buf` as far as the file allows; returns bytes read
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
