//! Write-Ahead Log (WAL) Module
//!
//! Provides durability for the memtable. One entry per write batch; the entry's
//! LSN is the sequence number of the batch's first operation, and operation `i`
//! of the batch gets sequence `lsn + i`.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2 ...                             │
//! └─────────────────────────────────────────┘
//! ```
//! `Data` is the bincode encoding of [`WalEntry`]; the CRC covers `Data` only.

mod entry;
mod reader;
mod recovery;
mod writer;

pub use entry::{Operation, WalEntry, HEADER_SIZE};
pub use reader::{ReadResult, WalReader};
pub use recovery::{RecoveryResult, WalRecovery};
pub use writer::WalWriter;
