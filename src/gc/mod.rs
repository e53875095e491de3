//! Garbage Collection
//!
//! Deletion in bucketkv is never immediate. Closing a bucket or clearing an
//! area only records a *garbage tag* `(sequence, when)`; the store comparator
//! then reports every record of that bucket/area written at or before the
//! tagged sequence as droppable, and compaction erases it.
//!
//! ```text
//!   close_buckets / clear(area)
//!            │ add_bucket / add_area (seq = store's latest sequence)
//!            ▼
//!     ┌─────────────┐  should_drop(key, seq)   ┌──────────────┐
//!     │  GcFactory  │◄─────────────────────────│ GcComparator │◄── compaction / reads
//!     └──────┬──────┘                          └──────────────┘
//!            │ remove(target) after a targeted compaction
//!            │ finish(round_start) after a full round
//!            ▼
//!        gc.meta (bincode, rewritten on every change)
//! ```

mod comparator;
mod factory;

pub use comparator::GcComparator;
pub use factory::{GcFactory, GcNode, GcTarget};
