//! linstore - A concurrent linear hash index over paged memory
//!
//! This crate provides:
//! - **Hash table**: a linear hash table that grows one bucket at a time, with
//!   bounded overflow pages kept in a heap store
//! - **Heap store**: a tuple store over slotted pages addressed by tuple id
//! - **Lock table**: hash-sharded version words with optimistic and
//!   pessimistic guards
//!
//! # Features
//!
//! - Lock-free reads validated against per-record version words
//! - Incremental splits that never block the whole table
//! - Transient conflicts handled internally by restarting the attempt
//! - Pluggable key hash (`hash-xxh3` or `hash-xxh64`)
//!
//! # Quick Start
//!
//! ```rust
//! use linstore::{HashTable, HashTableConfig, Status};
//!
//! let table = HashTable::new(HashTableConfig::default()).unwrap();
//! assert_eq!(table.insert(b"key", b"value"), Status::Ok);
//! assert_eq!(table.get(b"key"), Some(b"value".to_vec()));
//! assert_eq!(table.remove(b"key"), Status::Ok);
//! assert_eq!(table.remove(b"key"), Status::NotFound);
//! ```

#![warn(missing_docs)]

pub mod buffer;
pub mod config;
pub mod hash;
pub mod heap;
pub mod locks;
pub mod status;
pub mod table;
pub mod utility;

// Re-exports for convenience
pub use buffer::{BufferPool, GuardMode, PageHooks, PageId};
pub use config::{ConfigError, LinstoreConfig};
pub use hash::KeyHash;
pub use heap::{HeapConfig, HeapStore, TupleId};
pub use locks::{LockTable, RecordGuard, VersionGuard};
pub use status::Status;
pub use table::{HashTable, HashTableConfig, SplitState};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Page size (4 KiB)
    pub const PAGE_SIZE: usize = 1 << 12;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::heap::{HeapConfig, HeapStore, TupleId};
    pub use crate::locks::{LockTable, VersionGuard};
    pub use crate::status::Status;
    pub use crate::table::{HashTable, HashTableConfig};
}
