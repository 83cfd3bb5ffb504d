//! Explicit transaction control: `begin`/`commit`/`rollback`, nesting
//! rejection, and the busy-retry schedule that guards write-transaction
//! acquisition.

use crate::error::{Error, ErrorCode, Result};
use crate::kv::Store;
use crate::storage::wal::CheckpointMode;
use std::thread;
use std::time::{Duration, Instant};

impl Store {
    /// Open an explicit transaction. Write transactions acquire RESERVED;
    /// read transactions take SHARED and pin a snapshot. A second `begin`
    /// before `commit`/`rollback` is a protocol violation, not a nested
    /// transaction.
    pub fn begin(&mut self, write: bool) -> Result<()> {
        if self.in_txn {
            return Err(Error::with_message(ErrorCode::Protocol, "transaction already active; nesting is not supported"));
        }
        if write {
            self.begin_write_with_retry()?;
        } else {
            self.pager.shared_lock()?;
        }
        self.in_txn = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(Error::with_message(ErrorCode::Protocol, "no transaction is active"));
        }
        self.pager.commit_phase_one(None)?;
        self.pager.commit_phase_two()?;
        self.in_txn = false;
        self.maybe_checkpoint()
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(Error::with_message(ErrorCode::Protocol, "no transaction is active"));
        }
        self.pager.rollback()?;
        self.in_txn = false;
        Ok(())
    }

    /// Acquire the write lock, retrying on `BUSY`/`LOCKED` with exponential
    /// backoff (1ms, doubling, capped at 100ms, ±20% jitter) until
    /// `busy_timeout_ms` elapses.
    pub(crate) fn begin_write_with_retry(&mut self) -> Result<()> {
        let deadline = Duration::from_millis(self.config.busy_timeout_ms);
        let start = Instant::now();
        let mut delay_ms: u64 = 1;
        loop {
            match self.pager.begin(true) {
                Ok(()) => return Ok(()),
                Err(e) if matches!(e.code(), ErrorCode::Busy | ErrorCode::Locked) => {
                    if start.elapsed() >= deadline {
                        return Err(e);
                    }
                    let jitter = (delay_ms as f64 * 0.2 * jitter_fraction()) as u64;
                    let sleep_for = Duration::from_millis(delay_ms + jitter).min(deadline.saturating_sub(start.elapsed()));
                    thread::sleep(sleep_for);
                    delay_ms = (delay_ms * 2).min(100);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a `PASSIVE` checkpoint if the WAL has grown past the configured
    /// frame threshold. No-op outside WAL mode or when the limit is 0.
    fn maybe_checkpoint(&mut self) -> Result<()> {
        if self.config.wal_size_limit_frames == 0 {
            return Ok(());
        }
        let frames = self.pager.wal.as_ref().map(|w| w.max_frame).unwrap_or(0);
        if frames >= self.config.wal_size_limit_frames {
            log::debug!("wal grew to {frames} frames, running passive checkpoint");
            self.pager.checkpoint(CheckpointMode::Passive)?;
        }
        Ok(())
    }
}

/// A pseudo-random fraction in `[-1.0, 1.0]`, derived from the low bits of
/// the current instant so the busy-retry loop doesn't need a `rand`
/// dependency the teacher never carried.
fn jitter_fraction() -> f64 {
    let nanos = Instant::now().elapsed().as_nanos() as u64 ^ (Instant::now().elapsed().as_nanos() as u64).rotate_left(17);
    ((nanos % 2001) as f64 - 1000.0) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    #[test]
    fn begin_commit_persists_writes() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        store.begin(true).unwrap();
        store.put(&cf, b"a", b"1").unwrap();
        store.commit().unwrap();
        assert_eq!(store.get(&cf, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn begin_rollback_discards_writes() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        store.begin(true).unwrap();
        store.put(&cf, b"a", b"1").unwrap();
        store.put(&cf, b"b", b"2").unwrap();
        store.rollback().unwrap();
        assert_eq!(store.get(&cf, b"a").unwrap(), None);
        assert_eq!(store.get(&cf, b"b").unwrap(), None);
    }

    #[test]
    fn nested_begin_is_a_protocol_error() {
        let (mut store, _dir) = temp_store();
        store.begin(true).unwrap();
        let err = store.begin(true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
        store.rollback().unwrap();
    }

    #[test]
    fn commit_without_begin_is_a_protocol_error() {
        let (mut store, _dir) = temp_store();
        let err = store.commit().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
    }
}
