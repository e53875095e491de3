//! # bucketkv
//!
//! Bucket-sharded key-value storage on embedded LSM stores:
//! - Composite keys carrying expire time and bucket id
//! - Version-care (optimistic concurrency) and lazy TTL expiration
//! - Garbage collection of closed buckets and cleared areas through compaction
//! - Online rebalancing of buckets between instances
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageManager                          │
//! │        (WriteGate → BucketIndexer → instance routing)       │
//! └─────────────────────┬───────────────────────────┬───────────┘
//!                       │                           │
//!          ┌────────────┴────────────┐       ┌──────▼──────┐
//!          ▼                         ▼       │  Balancer   │
//!   ┌─────────────┐          ┌─────────────┐ └─────────────┘
//!   │  Instance 0 │   ...    │ Instance N-1│
//!   │ cache/stats │          │ cache/stats │
//!   └──────┬──────┘          └─────────────┘
//!          │
//!          ▼
//!   ┌─────────────┐   should_drop   ┌─────────────┐
//!   │  LSM Db     │◄────────────────│GcComparator │◄── GcFactory
//!   │ WAL/Mem/SST │                 └─────────────┘
//!   └──────▲──────┘
//!          │ compact_range / compact_all
//!   ┌──────┴──────────────┐
//!   │ CompactionScheduler │
//!   └─────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
mod util;

pub mod codec;
pub mod lsm;
pub mod gc;
pub mod cache;
pub mod instance;
pub mod compaction;
pub mod indexer;
pub mod manager;
pub mod balancer;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use balancer::{BalanceReport, MigrationUnit};
pub use config::Config;
pub use error::{BucketError, Result};
pub use instance::{BatchRecord, Item};
pub use manager::{ManagerStats, StorageManager};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of bucketkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
