//! The key-value facade: `Store` ties the pager, catalog, and b-tree
//! together into `put`/`get`/`delete`/`exists`, ordered and prefix
//! iteration, and the TTL operations.
//!
//! Every public operation participates in a transaction: if the caller
//! hasn't opened one explicitly (see `txn.rs`), the operation wraps itself
//! in an auto-commit transaction so single calls are always atomic.

use crate::catalog::{CfHandle, Catalog};
use crate::config::{StoreConfig, SyncLevel};
use crate::error::{Error, ErrorCode, Result};
use crate::os::unix::UnixVfs;
use crate::os::vfs::{OpenFlags, Vfs};
use crate::storage::btree::{types::Comparator, Cursor};
use crate::storage::pager::{Pager, PagerFlags, PagerOpenFlags};
use crate::types::Pgno;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// `expire_epoch_ms` value meaning "never expires".
pub const NO_TTL: i64 = 0;

/// Milliseconds since the Unix epoch, used throughout TTL bookkeeping.
/// `put_ttl` takes an absolute expiry computed from this, never a relative
/// delta, so tests can inject explicit expiry timestamps without sleeping.
pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
    pub iterations: AtomicU64,
    pub errors: AtomicU64,
}

impl StoreStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.puts.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.iterations.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// An open store: one pager/catalog pair over a single database file.
pub struct Store {
    pub(crate) pager: Pager,
    pub(crate) catalog: Catalog,
    pub(crate) config: StoreConfig,
    pub(crate) in_txn: bool,
    pub(crate) last_error: Option<String>,
    pub stats: StoreStats,
}

impl Store {
    /// Open (creating if necessary) the store at `path` with the given
    /// configuration.
    pub fn open_v2(path: &str, config: StoreConfig) -> Result<Self> {
        let vfs: Arc<dyn Vfs> = Arc::new(UnixVfs::new());
        let vfs_flags = if config.read_only {
            OpenFlags::READONLY
        } else {
            OpenFlags::READWRITE | OpenFlags::CREATE
        };
        let mut pager = Pager::open(vfs, path, PagerOpenFlags::empty(), vfs_flags)?;
        if config.page_size != crate::storage::pager::DEFAULT_PAGE_SIZE {
            pager.set_page_size(config.page_size, 0)?;
        }
        pager.set_cache_size(config.cache_size_pages as i32);
        pager.set_journal_mode(config.journal_mode)?;
        pager.set_flags(match config.sync_level {
            SyncLevel::Off => PagerFlags::SYNCHRONOUS_OFF,
            SyncLevel::Normal => PagerFlags::SYNCHRONOUS_NORMAL,
            SyncLevel::Full => PagerFlags::SYNCHRONOUS_FULL,
        });
        pager.shared_lock()?;

        let is_new = pager.page_count() == 0;
        let catalog = if is_new {
            pager.begin(true)?;
            let c = Catalog::create(&mut pager)?;
            pager.commit_phase_one(None)?;
            pager.commit_phase_two()?;
            c
        } else {
            Catalog::open(&mut pager)?
        };

        Ok(Store {
            pager,
            catalog,
            config,
            in_txn: false,
            last_error: None,
            stats: StoreStats::default(),
        })
    }

    /// Open with default configuration.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_v2(path, StoreConfig::default())
    }

    pub fn close(mut self) -> Result<()> {
        self.pager.close()
    }

    pub fn errmsg(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn stats(&self) -> (u64, u64, u64, u64, u64) {
        self.stats.snapshot()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.pager.sync()
    }

    /// Run up to `n_pages` incremental-vacuum steps, relocating live pages
    /// from the tail of the file into earlier free slots and truncating
    /// when possible. Returns the number of steps that made progress; fewer
    /// than `n_pages` means the file is already as compact as it can get.
    pub fn incremental_vacuum(&mut self, n_pages: u32) -> Result<u32> {
        let auto = self.begin_auto(true)?;
        let mut steps = 0;
        let result = (|| -> Result<u32> {
            for _ in 0..n_pages {
                let mut pending_root: Option<(Pgno, Pgno)> = None;
                let progressed = crate::storage::ptrmap::incremental_vacuum_step(
                    &mut self.pager,
                    &mut self.catalog.freelist_head,
                    &mut |pager, entry_type, parent, old, new| {
                        if entry_type == crate::storage::ptrmap::PTRMAP_ROOT {
                            pending_root = Some((old, new));
                            Ok(())
                        } else {
                            crate::storage::btree::fixup_reference(pager, entry_type, parent, old, new)
                        }
                    },
                )?;
                if let Some((old, new)) = pending_root {
                    self.catalog.relocate_root(&mut self.pager, old, new)?;
                }
                if !progressed {
                    break;
                }
                steps += 1;
            }
            Ok(steps)
        })();
        self.end_auto(auto, result.is_ok())?;
        result
    }

    /// Run a WAL checkpoint in the given mode. Returns
    /// `(wal_frames_total, frames_checkpointed)`.
    pub fn checkpoint(&mut self, mode: crate::storage::wal::CheckpointMode) -> Result<(i32, i32)> {
        self.pager.checkpoint(mode)
    }

    /// Walk every reachable tree and report any structural inconsistency.
    pub fn integrity_check(&mut self) -> Result<crate::integrity::IntegrityReport> {
        crate::integrity::check(self)
    }

    pub fn cf_get_default(&mut self) -> CfHandle {
        self.catalog.cf_get_default()
    }

    pub fn cf_create(&mut self, name: &str) -> Result<CfHandle> {
        let auto = self.begin_auto(true)?;
        let result = self.catalog.cf_create(&mut self.pager, name);
        self.end_auto(auto, result.is_ok())?;
        self.record(result)
    }

    pub fn cf_open(&mut self, name: &str) -> Result<CfHandle> {
        self.catalog.cf_open(&mut self.pager, name)
    }

    pub fn cf_list(&mut self) -> Result<Vec<String>> {
        self.catalog.cf_list(&mut self.pager)
    }

    pub fn cf_drop(&mut self, name: &str) -> Result<()> {
        let auto = self.begin_auto(true)?;
        let result = self.catalog.cf_drop(&mut self.pager, name);
        self.end_auto(auto, result.is_ok())?;
        self.record(result)
    }

    pub fn cf_close(&mut self, _handle: CfHandle) {}

    fn check_handle(&mut self, cf: &CfHandle) -> Result<()> {
        if !self.catalog.is_handle_current(&cf.name, cf) {
            return Err(Error::with_message(ErrorCode::Protocol, "column family handle is stale"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Core KV operations
    // ------------------------------------------------------------------

    pub fn put(&mut self, cf: &CfHandle, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_handle(cf)?;
        let auto = self.begin_auto(true)?;
        let result = self.put_inner(cf, key, value, None);
        self.end_auto(auto, result.is_ok())?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.record(result)
    }

    pub fn put_ttl(&mut self, cf: &CfHandle, key: &[u8], value: &[u8], expire_epoch_ms: i64) -> Result<()> {
        self.check_handle(cf)?;
        let auto = self.begin_auto(true)?;
        let result = self.put_inner(cf, key, value, if expire_epoch_ms > 0 { Some(expire_epoch_ms) } else { None });
        self.end_auto(auto, result.is_ok())?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.record(result)
    }

    fn put_inner(&mut self, cf: &CfHandle, key: &[u8], value: &[u8], ttl: Option<i64>) -> Result<()> {
        let mut data_cur = Cursor::new(cf.data_root, Comparator::Blob);
        let had_match = data_cur.move_to(&mut self.pager, key)? == 0;
        let old_expire = if had_match {
            let raw = data_cur.payload(&mut self.pager)?;
            decode_stored(&raw)?.1
        } else {
            None
        };
        if let Some(old) = old_expire {
            let mut ttl_cur = Cursor::new(cf.ttl_root, Comparator::Blob);
            let tkey = ttl_key(old, key);
            if ttl_cur.move_to(&mut self.pager, &tkey)? == 0 {
                ttl_cur.delete(&mut self.pager, &mut self.catalog.freelist_head)?;
            }
        }

        let stored = encode_stored(value, ttl);
        data_cur.insert(&mut self.pager, &mut self.catalog.freelist_head, key, &stored)?;

        if let Some(expire) = ttl {
            let mut ttl_cur = Cursor::new(cf.ttl_root, Comparator::Blob);
            let tkey = ttl_key(expire, key);
            ttl_cur.insert(&mut self.pager, &mut self.catalog.freelist_head, &tkey, &[])?;
        }
        Ok(())
    }

    pub fn get(&mut self, cf: &CfHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        match self.get_ttl(cf, key)? {
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    /// Returns `(value, remaining_ms)` where `remaining_ms` is `NO_TTL`
    /// when the key has no expiry. Lazily deletes (data row + TTL row) and
    /// returns `None` if the row has expired.
    pub fn get_ttl(&mut self, cf: &CfHandle, key: &[u8]) -> Result<Option<(Vec<u8>, i64)>> {
        self.check_handle(cf)?;
        let auto = self.begin_auto(false)?;
        let mut cur = Cursor::new(cf.data_root, Comparator::Blob);
        if cur.move_to(&mut self.pager, key)? != 0 {
            self.end_auto(auto, true)?;
            return Ok(None);
        }
        let raw = cur.payload(&mut self.pager)?;
        let (value, expire) = decode_stored(&raw)?;
        let value = value.to_vec();

        if let Some(exp) = expire {
            if now_ms() >= exp {
                self.expire_one(cf, key, exp)?;
                self.end_auto(auto, true)?;
                return Ok(None);
            }
        }
        self.end_auto(auto, true)?;
        Ok(Some((value, expire.map(|e| e - now_ms()).unwrap_or(NO_TTL))))
    }

    pub fn ttl_remaining(&mut self, cf: &CfHandle, key: &[u8]) -> Result<i64> {
        match self.get_ttl(cf, key)? {
            Some((_, remaining)) => Ok(remaining),
            None => Err(Error::new(ErrorCode::NotFound)),
        }
    }

    fn expire_one(&mut self, cf: &CfHandle, key: &[u8], expire: i64) -> Result<()> {
        let auto = self.begin_auto(true)?;
        let mut data_cur = Cursor::new(cf.data_root, Comparator::Blob);
        if data_cur.move_to(&mut self.pager, key)? == 0 {
            data_cur.delete(&mut self.pager, &mut self.catalog.freelist_head)?;
        }
        let mut ttl_cur = Cursor::new(cf.ttl_root, Comparator::Blob);
        let tkey = ttl_key(expire, key);
        if ttl_cur.move_to(&mut self.pager, &tkey)? == 0 {
            ttl_cur.delete(&mut self.pager, &mut self.catalog.freelist_head)?;
        }
        self.end_auto(auto, true)
    }

    pub fn delete(&mut self, cf: &CfHandle, key: &[u8]) -> Result<()> {
        self.check_handle(cf)?;
        let auto = self.begin_auto(true)?;
        let result = (|| -> Result<()> {
            let mut data_cur = Cursor::new(cf.data_root, Comparator::Blob);
            if data_cur.move_to(&mut self.pager, key)? != 0 {
                return Ok(());
            }
            let raw = data_cur.payload(&mut self.pager)?;
            let (_, expire) = decode_stored(&raw)?;
            data_cur.delete(&mut self.pager, &mut self.catalog.freelist_head)?;
            if let Some(exp) = expire {
                let mut ttl_cur = Cursor::new(cf.ttl_root, Comparator::Blob);
                let tkey = ttl_key(exp, key);
                if ttl_cur.move_to(&mut self.pager, &tkey)? == 0 {
                    ttl_cur.delete(&mut self.pager, &mut self.catalog.freelist_head)?;
                }
            }
            Ok(())
        })();
        self.end_auto(auto, result.is_ok())?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.record(result)
    }

    pub fn exists(&mut self, cf: &CfHandle, key: &[u8]) -> Result<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Delete every row in `cf` whose TTL has passed `now_ms()`. Returns
    /// the number of keys removed.
    pub fn purge_expired(&mut self, cf: &CfHandle) -> Result<u64> {
        self.check_handle(cf)?;
        let auto = self.begin_auto(true)?;
        let now = now_ms();
        let mut expired = Vec::new();
        {
            let mut cur = Cursor::new(cf.ttl_root, Comparator::Blob);
            cur.first(&mut self.pager)?;
            while cur.is_valid() {
                let tkey = cur.key(&mut self.pager)?;
                if tkey.len() < 8 {
                    break;
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(&tkey[..8]);
                let expire = u64::from_be_bytes(b) as i64;
                if expire > now {
                    break;
                }
                expired.push((expire, tkey[8..].to_vec()));
                cur.next(&mut self.pager)?;
            }
        }
        for (expire, key) in &expired {
            let mut data_cur = Cursor::new(cf.data_root, Comparator::Blob);
            if data_cur.move_to(&mut self.pager, key)? == 0 {
                data_cur.delete(&mut self.pager, &mut self.catalog.freelist_head)?;
            }
            let mut ttl_cur = Cursor::new(cf.ttl_root, Comparator::Blob);
            let tkey = ttl_key(*expire, key);
            if ttl_cur.move_to(&mut self.pager, &tkey)? == 0 {
                ttl_cur.delete(&mut self.pager, &mut self.catalog.freelist_head)?;
            }
        }
        self.end_auto(auto, true)?;
        Ok(expired.len() as u64)
    }

    /// Purge every column family's expired rows; returns the total count.
    pub fn purge_expired_all(&mut self) -> Result<u64> {
        let names = self.cf_list()?;
        let mut total = 0u64;
        for name in names {
            let handle = self.cf_open(&name)?;
            total += self.purge_expired(&handle)?;
        }
        Ok(total)
    }

    pub fn iterator(&mut self, cf: &CfHandle) -> KvIterator<'_> {
        self.stats.iterations.fetch_add(1, Ordering::Relaxed);
        KvIterator {
            pager: &mut self.pager,
            cursor: Cursor::new(cf.data_root, Comparator::Blob),
            prefix: None,
            positioned: false,
            done: false,
        }
    }

    pub fn prefix_iterator(&mut self, cf: &CfHandle, prefix: &[u8]) -> Result<KvIterator<'_>> {
        self.stats.iterations.fetch_add(1, Ordering::Relaxed);
        let mut cursor = Cursor::new(cf.data_root, Comparator::Blob);
        cursor.move_to(&mut self.pager, prefix)?;
        Ok(KvIterator {
            pager: &mut self.pager,
            cursor,
            prefix: Some(prefix.to_vec()),
            positioned: true,
            done: false,
        })
    }

    pub(crate) fn begin_auto(&mut self, write: bool) -> Result<bool> {
        if self.in_txn {
            return Ok(false);
        }
        if write {
            self.pager.begin(true)?;
        } else {
            self.pager.shared_lock()?;
        }
        Ok(true)
    }

    pub(crate) fn end_auto(&mut self, opened: bool, succeeded: bool) -> Result<()> {
        if !opened {
            return Ok(());
        }
        if succeeded {
            self.pager.commit_phase_one(None)?;
            self.pager.commit_phase_two()
        } else {
            self.pager.rollback()
        }
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.last_error = Some(e.to_string());
        }
        result
    }
}

fn ttl_key(expire: i64, user_key: &[u8]) -> Vec<u8> {
    let mut k = (expire as u64).to_be_bytes().to_vec();
    k.extend_from_slice(user_key);
    k
}

/// Append a trailing flag byte (and, if set, the 8-byte BE expiry before
/// it) to a value so `get`/`get_ttl` can tell a plain put from a TTL put
/// without a side table. See spec design notes: a metadata byte is an
/// accepted alternative to the bare trailer.
fn encode_stored(value: &[u8], ttl: Option<i64>) -> Vec<u8> {
    let mut out = value.to_vec();
    match ttl {
        Some(expire) => {
            out.extend_from_slice(&(expire as u64).to_be_bytes());
            out.push(1);
        }
        None => out.push(0),
    }
    out
}

fn decode_stored(stored: &[u8]) -> Result<(&[u8], Option<i64>)> {
    if stored.is_empty() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let flag = stored[stored.len() - 1];
    match flag {
        0 => Ok((&stored[..stored.len() - 1], None)),
        1 => {
            if stored.len() < 9 {
                return Err(Error::new(ErrorCode::Corrupt));
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&stored[stored.len() - 9..stored.len() - 1]);
            Ok((&stored[..stored.len() - 9], Some(u64::from_be_bytes(b) as i64)))
        }
        _ => Err(Error::new(ErrorCode::Corrupt)),
    }
}

/// A forward cursor over a column family's data tree, skipping (but not
/// deleting) expired rows. `purge_expired` is the deletion path; the
/// iterator only hides them from the caller.
pub struct KvIterator<'a> {
    pager: &'a mut Pager,
    cursor: Cursor,
    prefix: Option<Vec<u8>>,
    positioned: bool,
    done: bool,
}

impl<'a> Iterator for KvIterator<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let advance = if !self.positioned {
                self.positioned = true;
                self.cursor.first(self.pager)
            } else {
                self.cursor.next(self.pager)
            };
            if let Err(e) = advance {
                self.done = true;
                return Some(Err(e));
            }
            if !self.cursor.is_valid() {
                self.done = true;
                return None;
            }
            let key = match self.cursor.key(self.pager) {
                Ok(k) => k,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if let Some(prefix) = &self.prefix {
                if !key.starts_with(prefix.as_slice()) {
                    self.done = true;
                    return None;
                }
            }
            let raw = match self.cursor.payload(self.pager) {
                Ok(v) => v,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let (value, expire) = match decode_stored(&raw) {
                Ok(v) => v,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if let Some(exp) = expire {
                if now_ms() >= exp {
                    continue;
                }
            }
            return Some(Ok((key, value.to_vec())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        store.put(&cf, b"a", b"1").unwrap();
        assert_eq!(store.get(&cf, b"a").unwrap(), Some(b"1".to_vec()));
        assert!(store.exists(&cf, b"a").unwrap());
        store.delete(&cf, b"a").unwrap();
        assert_eq!(store.get(&cf, b"a").unwrap(), None);
        assert!(!store.exists(&cf, b"a").unwrap());
    }

    #[test]
    fn ttl_expiry_hides_value_after_deadline() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        let now = now_ms();
        store.put_ttl(&cf, b"flash", b"x", now - 1).unwrap();
        assert_eq!(store.get(&cf, b"flash").unwrap(), None);
        assert!(store.ttl_remaining(&cf, b"flash").is_err());
    }

    #[test]
    fn ttl_not_yet_expired_reports_remaining() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        let now = now_ms();
        store.put_ttl(&cf, b"k", b"v", now + 60_000).unwrap();
        let remaining = store.ttl_remaining(&cf, b"k").unwrap();
        assert!(remaining > 0 && remaining <= 60_000);
    }

    #[test]
    fn purge_expired_removes_only_due_keys() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        let now = now_ms();
        store.put_ttl(&cf, b"old", b"v", now - 1000).unwrap();
        store.put_ttl(&cf, b"fresh", b"v", now + 60_000).unwrap();
        let deleted = store.purge_expired(&cf).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.get(&cf, b"fresh").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn prefix_iterator_only_yields_matching_keys() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        store.put(&cf, b"user:1", b"a").unwrap();
        store.put(&cf, b"user:2", b"b").unwrap();
        store.put(&cf, b"order:1", b"c").unwrap();
        let mut keys: Vec<Vec<u8>> = store
            .prefix_iterator(&cf, b"user:")
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        keys.sort();
        assert_eq!(keys, vec![b"user:1".to_vec(), b"user:2".to_vec()]);
    }

    #[test]
    fn column_families_are_isolated() {
        let (mut store, _dir) = temp_store();
        let default = store.cf_get_default();
        let users = store.cf_create("users").unwrap();
        store.put(&default, b"k", b"default-value").unwrap();
        store.put(&users, b"k", b"users-value").unwrap();
        assert_eq!(store.get(&default, b"k").unwrap(), Some(b"default-value".to_vec()));
        assert_eq!(store.get(&users, b"k").unwrap(), Some(b"users-value".to_vec()));
    }

    #[test]
    fn incremental_vacuum_on_a_fresh_store_makes_no_progress() {
        let (mut store, _dir) = temp_store();
        let steps = store.incremental_vacuum(16).unwrap();
        assert_eq!(steps, 0);
    }

    #[test]
    fn incremental_vacuum_reclaims_pages_freed_by_deletes() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        for i in 0..200u32 {
            let key = format!("k{i:04}");
            store.put(&cf, key.as_bytes(), &vec![b'x'; 512]).unwrap();
        }
        for i in 0..180u32 {
            let key = format!("k{i:04}");
            store.delete(&cf, key.as_bytes()).unwrap();
        }
        let steps = store.incremental_vacuum(1000).unwrap();
        assert!(steps > 0, "expected at least one page to be relocated after large-scale deletes");
        for i in 180..200u32 {
            let key = format!("k{i:04}");
            assert_eq!(store.get(&cf, key.as_bytes()).unwrap(), Some(vec![b'x'; 512]));
        }
    }

    #[test]
    fn checkpoint_on_an_empty_wal_is_a_no_op() {
        let (mut store, _dir) = temp_store();
        let (total, written) = store.checkpoint(crate::storage::wal::CheckpointMode::Passive).unwrap();
        assert_eq!(total, 0);
        assert_eq!(written, 0);
    }

    #[test]
    fn integrity_check_reports_clean_for_well_formed_store() {
        let (mut store, _dir) = temp_store();
        let cf = store.cf_get_default();
        store.put(&cf, b"a", b"1").unwrap();
        store.put(&cf, b"b", b"2").unwrap();
        let report = store.integrity_check().unwrap();
        assert!(report.is_ok(), "unexpected issues: {:?}", report.issues);
        assert!(report.pages_visited > 0);
    }
}
