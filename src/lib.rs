//! kvengine - an embedded, single-writer/multi-reader ACID key-value store.
//!
//! Built on a paged B+-tree with a write-ahead log, a bounded page cache,
//! and an incrementally-vacuumed free list. Column families are tracked in
//! a dedicated catalog tree; keys may carry an optional TTL.

#![allow(dead_code)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod integrity;
pub mod kv;
pub mod os;
pub mod storage;
pub mod txn;
pub mod types;
pub mod util;

pub use catalog::CfHandle;
pub use config::{StoreConfig, SyncLevel};
pub use error::{Error, ErrorCode, Result};
pub use integrity::{IntegrityIssue, IntegrityReport};
pub use kv::{KvIterator, Store, StoreStats, NO_TTL};
pub use storage::pager::JournalMode;
pub use storage::wal::CheckpointMode;
