//! MemTable Module
//!
//! In-memory table for recent writes.
//!
//! ## Responsibilities
//! - Fast reads and writes in memory
//! - Order keys with the store's [`Comparator`](super::Comparator), not bytewise
//! - Remember the sequence of every entry and the smallest one still unflushed
//! - Track size for flush triggers
//!
//! ## Data Structure Choice
//! BTreeMap behind a RwLock. The map key carries the comparator so `Ord` can
//! delegate to it; the stored key bytes are replaced on every write because two
//! comparator-equal keys may differ in bytes the comparator ignores.

mod table;

pub use table::MemTable;

/// Entry stored in the MemTable
#[derive(Debug, Clone, PartialEq)]
pub enum MemTableEntry {
    /// A live value
    Value(Vec<u8>),

    /// A tombstone (deleted key)
    Tombstone,
}
