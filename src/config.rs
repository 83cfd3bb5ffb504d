//! Store-wide configuration knobs.

use crate::storage::pager::{JournalMode, DEFAULT_PAGE_SIZE};

/// Fsync discipline for commits (maps to `PRAGMA synchronous`-style levels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncLevel {
    /// Never fsync; fastest, least durable.
    Off,
    /// fsync the WAL/journal at commit but not the main file.
    #[default]
    Normal,
    /// fsync both the WAL/journal and the main file at commit.
    Full,
}

/// Configuration for opening a [`crate::kv::Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Rollback-journal vs write-ahead logging.
    pub journal_mode: JournalMode,
    /// How aggressively to fsync at commit boundaries.
    pub sync_level: SyncLevel,
    /// Target page-cache size, in pages.
    pub cache_size_pages: u32,
    /// Page size in bytes. Must be a power of two between 512 and 65536.
    /// Only meaningful on initial database creation.
    pub page_size: u32,
    /// Open the store without acquiring write locks.
    pub read_only: bool,
    /// Deadline for the busy-retry loop when a lock can't be acquired
    /// immediately, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Auto-checkpoint the WAL back into the main file once it grows past
    /// this many frames.
    pub wal_size_limit_frames: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            journal_mode: JournalMode::Wal,
            sync_level: SyncLevel::Normal,
            cache_size_pages: 2000,
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
            busy_timeout_ms: 5000,
            wal_size_limit_frames: 1000,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    pub fn cache_size_pages(mut self, pages: u32) -> Self {
        self.cache_size_pages = pages;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_wal_and_normal_sync() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.journal_mode, JournalMode::Wal);
        assert_eq!(cfg.sync_level, SyncLevel::Normal);
        assert!(!cfg.read_only);
    }

    #[test]
    fn builder_methods_chain() {
        let cfg = StoreConfig::new().read_only(true).busy_timeout_ms(250);
        assert!(cfg.read_only);
        assert_eq!(cfg.busy_timeout_ms, 250);
    }
}
