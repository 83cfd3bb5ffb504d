//! Page cache management
//!
//! The Pager manages the on-disk page image, the rollback journal or WAL,
//! and the transaction/locking state machine. It is the layer between the
//! B-tree and the OS file system: the B-tree asks for pages by number, the
//! pager decides whether that means a cache hit, a disk read, or (on first
//! touch of a page in a write transaction) journaling the pre-image.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{LockType, OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::storage::wal::Wal;
use crate::types::Pgno;

// ============================================================================
// Constants
// ============================================================================

/// Default maximum size for persistent journal files (-1 = no limit)
pub const DEFAULT_JOURNAL_SIZE_LIMIT: i64 = -1;

/// Journal header magic number
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Size of the journal header in bytes
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Default page size
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Minimum page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Maximum page size
pub const MAX_PAGE_SIZE: u32 = 65536;

// ============================================================================
// Pager Flags
// ============================================================================

bitflags! {
    /// Flags for Pager::open()
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerOpenFlags: u32 {
        /// Do not use a rollback journal
        const OMIT_JOURNAL = 0x0001;
        /// In-memory database
        const MEMORY = 0x0002;
    }

    /// Flags for Pager::get()
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerGetFlags: u8 {
        /// Do not load data from disk
        const NOCONTENT = 0x01;
        /// Read-only page is acceptable
        const READONLY = 0x02;
    }

    /// Flags for Pager::set_flags() - synchronous mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerFlags: u32 {
        /// synchronous=OFF
        const SYNCHRONOUS_OFF = 0x01;
        /// synchronous=NORMAL
        const SYNCHRONOUS_NORMAL = 0x02;
        /// synchronous=FULL
        const SYNCHRONOUS_FULL = 0x03;
        /// Mask for synchronous values
        const SYNCHRONOUS_MASK = 0x07;
        /// fullfsync=ON
        const FULLFSYNC = 0x08;
        /// checkpoint_fullfsync=ON
        const CKPT_FULLFSYNC = 0x10;
        /// cache_spill=ON
        const CACHESPILL = 0x20;
    }

    /// Page state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PgFlags: u8 {
        /// Page is clean (unmodified)
        const CLEAN = 0x00;
        /// Page has been modified since the last commit
        const DIRTY = 0x01;
        /// Page's pre-image has already been journaled this transaction
        const JOURNALED = 0x02;
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Pager state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum PagerState {
    /// No lock held, pager is open
    Open = 0,
    /// Shared lock held, can read
    Reader = 1,
    /// Reserved lock held, writing to journal
    Writer = 2,
    /// Exclusive lock held, committing
    WriterLocked = 3,
    /// Commit complete, releasing locks
    WriterFinished = 4,
    /// Error occurred, pager is in error state
    Error = 5,
}

/// Journal mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JournalMode {
    /// Commit by deleting journal file
    Delete = 0,
    /// Commit by zeroing journal header
    Persist = 1,
    /// Journal omitted (unsafe)
    Off = 2,
    /// Commit by truncating journal to zero
    Truncate = 3,
    /// In-memory journal file
    Memory = 4,
    /// Use write-ahead logging
    Wal = 5,
}

impl JournalMode {
    /// Check if this is WAL mode
    pub fn is_wal(&self) -> bool {
        matches!(self, JournalMode::Wal)
    }
}

/// Locking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LockingMode {
    /// Normal locking - release locks after transaction
    Normal = 0,
    /// Exclusive locking - hold exclusive lock
    Exclusive = 1,
}

/// Savepoint operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    /// Begin a new savepoint
    Begin,
    /// Release (commit) savepoint
    Release,
    /// Rollback to savepoint
    Rollback,
}

// ============================================================================
// Cached page
// ============================================================================

/// A page held in the pager's cache.
struct CachedPage {
    data: Vec<u8>,
    flags: PgFlags,
}

impl CachedPage {
    fn is_dirty(&self) -> bool {
        self.flags.contains(PgFlags::DIRTY)
    }
}

// ============================================================================
// Savepoint
// ============================================================================

/// Savepoint state
pub struct Savepoint {
    /// Offset in the journal
    pub offset: i64,
    /// Sub-journal offset
    pub sub_rec: u32,
    /// Original database size at savepoint
    pub orig_db_size: Pgno,
    /// Number of pages in savepoint
    pub n_orig: Pgno,
    /// Savepoint name hash
    pub name_hash: u32,
}

impl Savepoint {
    /// Create a new savepoint
    pub fn new(offset: i64, db_size: Pgno) -> Self {
        Savepoint {
            offset,
            sub_rec: 0,
            orig_db_size: db_size,
            n_orig: db_size,
            name_hash: 0,
        }
    }
}

// ============================================================================
// Journal Header
// ============================================================================

/// Rollback journal header (28 bytes)
#[derive(Debug, Clone)]
pub struct JournalHeader {
    /// Magic number (8 bytes)
    pub magic: [u8; 8],
    /// Page count in this segment
    pub page_count: u32,
    /// Random nonce for checksum
    pub nonce: u32,
    /// Initial database page count
    pub initial_pages: u32,
    /// Disk sector size
    pub sector_size: u32,
    /// Page size
    pub page_size: u32,
}

impl JournalHeader {
    /// Create a new journal header
    pub fn new(page_count: u32, initial_pages: u32, sector_size: u32, page_size: u32) -> Self {
        JournalHeader {
            magic: JOURNAL_MAGIC,
            page_count,
            nonce: rand_nonce(),
            initial_pages,
            sector_size,
            page_size,
        }
    }

    /// Parse a journal header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < JOURNAL_HEADER_SIZE {
            return Err(Error::new(ErrorCode::Corrupt));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[0..8]);

        if magic != JOURNAL_MAGIC {
            return Err(Error::new(ErrorCode::Corrupt));
        }

        Ok(JournalHeader {
            magic,
            page_count: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            nonce: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            initial_pages: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            sector_size: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            page_size: u32::from_be_bytes([data[24], data[25], data[26], data[27]]),
        })
    }

    /// Serialize journal header to bytes
    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.page_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        buf[16..20].copy_from_slice(&self.initial_pages.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        buf
    }
}

/// Generate a random nonce for journal checksum
fn rand_nonce() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (duration.as_nanos() & 0xFFFFFFFF) as u32
}

// ============================================================================
// Pager
// ============================================================================

/// Main pager object managing a database file
pub struct Pager {
    /// VFS used to open the journal file and delete it on commit
    vfs: Arc<dyn Vfs>,

    // File handles
    /// Database file handle
    pub fd: Option<Box<dyn VfsFile>>,
    /// Journal file handle
    pub jfd: Option<Box<dyn VfsFile>>,

    // Paths
    /// Database file path
    pub db_path: String,
    /// Journal file path
    pub journal_path: String,

    // State
    /// Current pager state
    pub state: PagerState,
    /// Current lock level
    pub lock: LockType,
    /// Journal mode
    pub journal_mode: JournalMode,
    /// Locking mode
    pub locking_mode: LockingMode,
    /// Error code if in error state
    pub err_code: ErrorCode,

    // Page management
    /// Database page size
    pub page_size: u32,
    /// Usable bytes per page (page_size - reserved)
    pub usable_size: u32,
    /// Database size in pages
    pub db_size: Pgno,
    /// Original database size (at transaction start)
    pub db_orig_size: Pgno,
    /// Maximum allowed page count
    pub max_page_count: Pgno,

    // Cache: pages touched since the pager was opened. Not evicted under
    // normal operation; `shrink_cache` drops clean, unreferenced pages down
    // to `cache_size` pages when called between transactions.
    pages: HashMap<Pgno, CachedPage>,
    /// Page cache target size (in pages)
    pub cache_size: i32,
    /// Spill size threshold
    pub spill_size: i32,
    /// Memory-mapped I/O limit (unused; kept for API parity)
    pub mmap_limit: i64,

    // Journal state
    /// Current position in journal
    pub journal_offset: i64,
    /// Start of current journal header
    pub journal_header: i64,
    /// Records in current journal segment
    pub n_rec: u32,
    /// Journal size limit
    pub journal_size_limit: i64,
    /// Pages already journaled this transaction (pre-image written once)
    journaled_this_txn: std::collections::HashSet<Pgno>,

    /// Write-ahead log, present only in WAL journal mode
    pub wal: Option<Wal>,

    // Stats
    /// Pages read from disk
    pub n_read: u32,
    /// Pages written to disk
    pub n_write: u32,

    // Options
    /// Pager flags (sync mode, etc.)
    pub flags: PagerFlags,
    /// Is this an in-memory database
    pub mem_db: bool,
    /// Read-only database
    pub read_only: bool,

    // Savepoints
    /// Active savepoints
    pub savepoints: Vec<Savepoint>,

    // Temporary space
    /// Temporary buffer for page operations
    pub tmp_space: Vec<u8>,
}

impl Pager {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open a pager on a database file
    pub fn open(
        vfs: Arc<dyn Vfs>,
        path: &str,
        flags: PagerOpenFlags,
        vfs_flags: OpenFlags,
    ) -> Result<Self> {
        let journal_path = format!("{}-journal", path);
        let mem_db = flags.contains(PagerOpenFlags::MEMORY);
        let read_only = !vfs_flags.contains(OpenFlags::READWRITE);

        let fd = if mem_db {
            None
        } else {
            log::debug!("pager: opening {path}");
            Some(vfs.open(Some(path), vfs_flags)?)
        };

        Ok(Pager {
            vfs,
            fd,
            jfd: None,
            db_path: path.to_string(),
            journal_path,
            state: PagerState::Open,
            lock: LockType::None,
            journal_mode: if flags.contains(PagerOpenFlags::OMIT_JOURNAL) {
                JournalMode::Off
            } else {
                JournalMode::Delete
            },
            locking_mode: LockingMode::Normal,
            err_code: ErrorCode::Ok,
            page_size: DEFAULT_PAGE_SIZE,
            usable_size: DEFAULT_PAGE_SIZE,
            db_size: 0,
            db_orig_size: 0,
            max_page_count: 0xFFFFFFFF,
            pages: HashMap::new(),
            cache_size: 2000,
            spill_size: 1,
            mmap_limit: 0,
            journal_offset: 0,
            journal_header: 0,
            n_rec: 0,
            journal_size_limit: DEFAULT_JOURNAL_SIZE_LIMIT,
            journaled_this_txn: std::collections::HashSet::new(),
            wal: None,
            n_read: 0,
            n_write: 0,
            flags: PagerFlags::SYNCHRONOUS_FULL,
            mem_db,
            read_only,
            savepoints: Vec::new(),
            tmp_space: vec![0u8; DEFAULT_PAGE_SIZE as usize],
        })
    }

    /// Close the pager and release resources
    pub fn close(&mut self) -> Result<()> {
        if self.state >= PagerState::Writer {
            let _ = self.rollback();
        }
        self.unlock(LockType::None)?;
        self.fd = None;
        self.jfd = None;
        self.state = PagerState::Open;
        Ok(())
    }

    /// Read the database file header into `buf`
    pub fn read_file_header(&mut self, buf: &mut [u8]) -> Result<()> {
        if let Some(ref fd) = self.fd {
            let n = fd.read(buf, 0)?;
            if n < buf.len() {
                buf[n..].fill(0);
            }
            Ok(())
        } else {
            buf.fill(0);
            Ok(())
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Set the page size
    pub fn set_page_size(&mut self, page_size: u32, reserve: i32) -> Result<()> {
        if page_size < MIN_PAGE_SIZE || page_size > MAX_PAGE_SIZE {
            return Err(Error::new(ErrorCode::Protocol));
        }
        if !page_size.is_power_of_two() {
            return Err(Error::new(ErrorCode::Protocol));
        }
        if self.state != PagerState::Open {
            return Err(Error::new(ErrorCode::Protocol));
        }

        self.page_size = page_size;
        let reserve = reserve.max(0) as u32;
        self.usable_size = page_size - reserve.min(page_size - 480);
        self.tmp_space = vec![0u8; page_size as usize];

        Ok(())
    }

    pub fn get_page_size(&self) -> u32 {
        self.page_size
    }

    pub fn set_max_page_count(&mut self, max: Pgno) -> Pgno {
        if max > 0 {
            self.max_page_count = max;
        }
        self.max_page_count
    }

    pub fn set_cache_size(&mut self, size: i32) {
        self.cache_size = size;
    }

    pub fn set_spill_size(&mut self, size: i32) -> i32 {
        let old = self.spill_size;
        if size >= 0 {
            self.spill_size = size;
        }
        old
    }

    pub fn set_mmap_limit(&mut self, limit: i64) {
        self.mmap_limit = limit;
    }

    pub fn set_flags(&mut self, flags: PagerFlags) {
        self.flags = flags;
    }

    pub fn locking_mode(&mut self, mode: Option<LockingMode>) -> LockingMode {
        if let Some(m) = mode {
            self.locking_mode = m;
        }
        self.locking_mode
    }

    /// Set journal mode. Switching into or out of WAL can only happen
    /// outside of a write transaction.
    pub fn set_journal_mode(&mut self, mode: JournalMode) -> Result<JournalMode> {
        if self.state >= PagerState::Writer {
            return Ok(self.journal_mode);
        }
        if mode.is_wal() && self.wal.is_none() && !self.mem_db {
            let wal_path = format!("{}-wal", self.db_path);
            let mut wal = Wal::open(self.vfs.clone(), &self.db_path, &wal_path, self.page_size)?;
            wal.recover()?;
            self.wal = Some(wal);
        } else if !mode.is_wal() {
            self.wal = None;
        }
        self.journal_mode = mode;
        Ok(mode)
    }

    pub fn get_journal_mode(&self) -> JournalMode {
        self.journal_mode
    }

    pub fn set_journal_size_limit(&mut self, limit: i64) -> i64 {
        if limit >= -1 {
            self.journal_size_limit = limit;
        }
        self.journal_size_limit
    }

    // ========================================================================
    // Page Acquisition
    // ========================================================================

    fn load_from_disk(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.page_size as usize];
        if let Some(wal) = &mut self.wal {
            if let Some(frame_data) = wal.read_page(pgno)? {
                data.copy_from_slice(&frame_data[..data.len().min(frame_data.len())]);
                self.n_read += 1;
                return Ok(data);
            }
        }
        if let Some(ref fd) = self.fd {
            let offset = ((pgno - 1) as i64) * (self.page_size as i64);
            let _ = fd.read(&mut data, offset);
            self.n_read += 1;
        }
        Ok(data)
    }

    /// Borrow a page's bytes for reading, acquiring a shared lock and
    /// reading through to disk/WAL on first touch.
    pub fn read_page(&mut self, pgno: Pgno) -> Result<&[u8]> {
        if pgno == 0 {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        if self.state < PagerState::Reader {
            self.shared_lock()?;
        }
        if !self.pages.contains_key(&pgno) {
            let data = self.load_from_disk(pgno)?;
            self.pages.insert(
                pgno,
                CachedPage {
                    data,
                    flags: PgFlags::CLEAN,
                },
            );
        }
        Ok(&self.pages.get(&pgno).unwrap().data)
    }

    /// Look up a page only if already cached, without touching disk.
    pub fn lookup(&self, pgno: Pgno) -> Option<&[u8]> {
        self.pages.get(&pgno).map(|p| p.data.as_slice())
    }

    /// Borrow a page's bytes for writing. Journals the pre-image the first
    /// time a page is touched in the current transaction.
    pub fn write_page(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        if self.state < PagerState::Writer {
            self.begin(false)?;
        }
        if !self.pages.contains_key(&pgno) {
            let data = self.load_from_disk(pgno)?;
            self.pages.insert(
                pgno,
                CachedPage {
                    data,
                    flags: PgFlags::CLEAN,
                },
            );
        }

        if self.journal_mode != JournalMode::Off
            && !self.journal_mode.is_wal()
            && self.journaled_this_txn.insert(pgno)
        {
            let pre_image = self.pages.get(&pgno).unwrap().data.clone();
            self.journal_page(pgno, &pre_image)?;
        }

        let page = self.pages.get_mut(&pgno).unwrap();
        page.flags.insert(PgFlags::DIRTY);
        Ok(&mut page.data)
    }

    /// Allocate a brand-new page at the end of the database, zeroed and
    /// already marked dirty (no pre-image to journal: it didn't exist).
    pub fn allocate_page(&mut self) -> Result<Pgno> {
        if self.state < PagerState::Writer {
            self.begin(false)?;
        }
        self.db_size += 1;
        let pgno = self.db_size;
        self.pages.insert(
            pgno,
            CachedPage {
                data: vec![0u8; self.page_size as usize],
                flags: PgFlags::DIRTY,
            },
        );
        self.journaled_this_txn.insert(pgno);
        Ok(pgno)
    }

    /// Drop the cached copy of a page that has been freed and truncated
    /// away from the end of the file.
    pub fn forget_page(&mut self, pgno: Pgno) {
        self.pages.remove(&pgno);
    }

    /// Evict clean, currently-unused pages down toward `cache_size`.
    /// Conservative: this engine does not track per-page refcounts across
    /// calls, so only pages beyond twice the target are trimmed.
    pub fn shrink_cache(&mut self) {
        let target = self.cache_size.max(0) as usize;
        if self.pages.len() <= target.saturating_mul(2).max(16) {
            return;
        }
        let mut clean: Vec<Pgno> = self
            .pages
            .iter()
            .filter(|(_, p)| !p.is_dirty())
            .map(|(&pgno, _)| pgno)
            .collect();
        clean.sort_unstable();
        let excess = self.pages.len().saturating_sub(target);
        for pgno in clean.into_iter().take(excess) {
            self.pages.remove(&pgno);
        }
    }

    // ========================================================================
    // Transaction Control
    // ========================================================================

    /// Acquire a shared lock and learn the current database size.
    pub fn shared_lock(&mut self) -> Result<()> {
        if self.state >= PagerState::Reader {
            return Ok(());
        }

        self.lock(LockType::Shared)?;

        if let Some(wal) = &mut self.wal {
            wal.begin_read_transaction()?;
            self.db_size = wal.db_size();
        } else if let Some(ref fd) = self.fd {
            let size = fd.file_size()?;
            self.db_size = (size / self.page_size as i64) as Pgno;
        }

        self.state = PagerState::Reader;
        Ok(())
    }

    /// Begin a write transaction.
    pub fn begin(&mut self, exclusive: bool) -> Result<()> {
        if self.state >= PagerState::Writer {
            return Ok(());
        }
        if self.state < PagerState::Reader {
            self.shared_lock()?;
        }

        self.lock(LockType::Reserved)?;
        self.db_orig_size = self.db_size;
        self.journaled_this_txn.clear();

        if let Some(wal) = &mut self.wal {
            wal.begin_write_transaction()?;
        } else {
            self.open_journal()?;
        }

        self.state = PagerState::Writer;

        if exclusive {
            self.lock(LockType::Exclusive)?;
            self.state = PagerState::WriterLocked;
        }

        Ok(())
    }

    /// Commit phase one - sync journal/WAL
    pub fn commit_phase_one(&mut self, _super_journal: Option<&str>) -> Result<()> {
        if self.state < PagerState::Writer {
            return Ok(());
        }

        if self.wal.is_none() {
            if let Some(ref mut jfd) = self.jfd {
                jfd.sync(SyncFlags::NORMAL)?;
            }
            self.lock(LockType::Exclusive)?;
        }
        self.state = PagerState::WriterLocked;
        Ok(())
    }

    /// Commit phase two - write dirty pages out and finalize.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        if self.state < PagerState::WriterLocked {
            return Ok(());
        }

        let mut dirty: Vec<Pgno> = self
            .pages
            .iter()
            .filter(|(_, p)| p.is_dirty())
            .map(|(&pgno, _)| pgno)
            .collect();
        dirty.sort_unstable();

        if let Some(wal) = &mut self.wal {
            let frames: Vec<(Pgno, Vec<u8>)> = dirty
                .iter()
                .map(|&pgno| (pgno, self.pages[&pgno].data.clone()))
                .collect();
            let frame_refs: Vec<(Pgno, &[u8])> =
                frames.iter().map(|(p, d)| (*p, d.as_slice())).collect();
            let sync_flags = if (self.flags & PagerFlags::SYNCHRONOUS_MASK)
                == PagerFlags::SYNCHRONOUS_OFF
            {
                SyncFlags::empty()
            } else {
                SyncFlags::NORMAL
            };
            wal.write_frames(self.page_size, &frame_refs, self.db_size, true, sync_flags)?;
            self.n_write += dirty.len() as u32;
        } else if let Some(ref mut fd) = self.fd {
            for &pgno in &dirty {
                let offset = ((pgno - 1) as i64) * (self.page_size as i64);
                fd.write(&self.pages[&pgno].data, offset)?;
                self.n_write += 1;
            }
            fd.sync(SyncFlags::NORMAL)?;
        }

        for pgno in dirty {
            if let Some(p) = self.pages.get_mut(&pgno) {
                p.flags.remove(PgFlags::DIRTY);
            }
        }

        self.end_journal()?;

        if let Some(wal) = &mut self.wal {
            wal.end_write_transaction()?;
        }

        if self.locking_mode == LockingMode::Normal {
            self.unlock(LockType::Shared)?;
            self.state = PagerState::Reader;
        } else {
            self.state = PagerState::WriterFinished;
        }

        Ok(())
    }

    /// Roll back the current write transaction, discarding dirty pages and
    /// restoring the database size recorded at `begin`.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state < PagerState::Writer {
            return Ok(());
        }

        if self.wal.is_some() {
            // Nothing was made visible to readers yet; just discard.
            self.pages.retain(|_, p| !p.is_dirty());
        } else if self.jfd.is_some() {
            self.playback_journal()?;
            self.pages.clear();
        }

        self.db_size = self.db_orig_size;
        self.end_journal()?;

        if let Some(wal) = &mut self.wal {
            wal.end_write_transaction()?;
        }

        if self.locking_mode == LockingMode::Normal {
            self.unlock(LockType::Shared)?;
            self.state = PagerState::Reader;
        } else {
            self.state = PagerState::WriterFinished;
        }

        Ok(())
    }

    /// Sync pager to disk
    pub fn sync(&mut self) -> Result<()> {
        if let Some(ref mut fd) = self.fd {
            fd.sync(SyncFlags::NORMAL)?;
        }
        Ok(())
    }

    /// Checkpoint the WAL back into the main database file, if WAL mode is
    /// active. No-op otherwise. Returns `(wal_frames_total, frames_checkpointed)`.
    pub fn checkpoint(&mut self, mode: crate::storage::wal::CheckpointMode) -> Result<(i32, i32)> {
        let Some(ref mut fd) = self.fd else {
            return Ok((0, 0));
        };
        if let Some(wal) = &mut self.wal {
            wal.checkpoint(fd.as_mut(), mode, None)
        } else {
            Ok((0, 0))
        }
    }

    // ========================================================================
    // Savepoint Operations
    // ========================================================================

    pub fn open_savepoint(&mut self, n: i32) -> Result<()> {
        while self.savepoints.len() < n as usize {
            let savepoint = Savepoint::new(self.journal_offset, self.db_size);
            self.savepoints.push(savepoint);
        }
        Ok(())
    }

    pub fn savepoint(&mut self, op: SavepointOp, index: i32) -> Result<()> {
        let idx = index as usize;

        match op {
            SavepointOp::Release => {
                if idx < self.savepoints.len() {
                    self.savepoints.truncate(idx);
                }
            }
            SavepointOp::Rollback => {
                if idx < self.savepoints.len() {
                    let savepoint_db_size = self.savepoints[idx].orig_db_size;
                    self.db_size = savepoint_db_size;
                    self.pages.retain(|&pgno, _| pgno <= savepoint_db_size);
                }
            }
            SavepointOp::Begin => {
                self.open_savepoint(index + 1)?;
            }
        }

        Ok(())
    }

    // ========================================================================
    // Lock Management
    // ========================================================================

    fn lock(&mut self, level: LockType) -> Result<()> {
        if level <= self.lock {
            return Ok(());
        }
        if let Some(ref mut fd) = self.fd {
            fd.lock(level)?;
        }
        self.lock = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockType) -> Result<()> {
        if level >= self.lock {
            return Ok(());
        }
        if let Some(ref mut fd) = self.fd {
            fd.unlock(level)?;
        }
        self.lock = level;
        Ok(())
    }

    pub fn exclusive_lock(&mut self) -> Result<()> {
        self.lock(LockType::Exclusive)
    }

    // ========================================================================
    // Rollback Journal Operations
    // ========================================================================

    fn open_journal(&mut self) -> Result<()> {
        if self.jfd.is_some() {
            return Ok(());
        }
        if self.journal_mode == JournalMode::Off || self.mem_db {
            self.journal_offset = 0;
            self.journal_header = 0;
            self.n_rec = 0;
            return Ok(());
        }

        let open_flags = OpenFlags::READWRITE
            | OpenFlags::CREATE
            | OpenFlags::MAIN_JOURNAL
            | OpenFlags::EXCLUSIVE;
        let jfd = self.vfs.open(Some(&self.journal_path), open_flags)?;
        self.jfd = Some(jfd);

        let header = JournalHeader::new(0, self.db_orig_size, 512, self.page_size);
        let bytes = header.to_bytes();
        if let Some(ref mut jfd) = self.jfd {
            jfd.write(&bytes, 0)?;
        }
        self.journal_offset = JOURNAL_HEADER_SIZE as i64;
        self.journal_header = 0;
        self.n_rec = 0;

        Ok(())
    }

    /// Write a page's pre-image to the journal as
    /// `[pgno: u32 BE][page bytes][checksum: u32 BE]`.
    fn journal_page(&mut self, pgno: Pgno, pre_image: &[u8]) -> Result<()> {
        if self.journal_mode == JournalMode::Off {
            return Ok(());
        }
        let checksum = Self::checksum_data(pre_image);

        if let Some(ref mut jfd) = self.jfd {
            jfd.write(&pgno.to_be_bytes(), self.journal_offset)?;
            self.journal_offset += 4;
            jfd.write(pre_image, self.journal_offset)?;
            self.journal_offset += pre_image.len() as i64;
            jfd.write(&checksum.to_be_bytes(), self.journal_offset)?;
            self.journal_offset += 4;
            self.n_rec += 1;
        }

        Ok(())
    }

    fn end_journal(&mut self) -> Result<()> {
        match self.journal_mode {
            JournalMode::Delete => {
                self.jfd = None;
                let _ = self.vfs.delete(&self.journal_path, false);
            }
            JournalMode::Truncate => {
                if let Some(ref mut jfd) = self.jfd {
                    jfd.truncate(0)?;
                }
            }
            JournalMode::Persist => {
                if let Some(ref mut jfd) = self.jfd {
                    let zeros = [0u8; JOURNAL_HEADER_SIZE];
                    jfd.write(&zeros, 0)?;
                }
            }
            JournalMode::Memory | JournalMode::Off | JournalMode::Wal => {}
        }

        self.journal_offset = 0;
        self.journal_header = 0;
        self.n_rec = 0;
        self.journaled_this_txn.clear();

        Ok(())
    }

    /// Replay journal records back into the database file, restoring every
    /// page to the pre-image it had when the transaction began.
    fn playback_journal(&mut self) -> Result<()> {
        let Some(ref mut jfd) = self.jfd else {
            return Ok(());
        };

        let mut offset = JOURNAL_HEADER_SIZE as i64;
        let page_size = self.page_size as usize;
        let mut record = vec![0u8; 4 + page_size + 4];

        loop {
            let n = jfd.read(&mut record, offset).unwrap_or(0);
            if n < record.len() {
                break;
            }
            let pgno = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
            let data = &record[4..4 + page_size];
            let stored_checksum =
                u32::from_be_bytes(record[4 + page_size..8 + page_size].try_into().unwrap());
            if pgno == 0 || Self::checksum_data(data) != stored_checksum {
                break;
            }

            if let Some(ref mut fd) = self.fd {
                let db_offset = ((pgno - 1) as i64) * self.page_size as i64;
                fd.write(data, db_offset)?;
            }

            offset += record.len() as i64;
        }

        if let Some(ref mut fd) = self.fd {
            fd.sync(SyncFlags::NORMAL)?;
        }

        Ok(())
    }

    fn checksum_data(data: &[u8]) -> u32 {
        let mut sum: u32 = 0;
        for (i, &byte) in data.iter().enumerate() {
            sum = sum.wrapping_add((byte as u32) << ((i & 3) * 8));
        }
        sum
    }

    // ========================================================================
    // Query Functions
    // ========================================================================

    pub fn is_readonly(&self) -> bool {
        self.read_only
    }

    pub fn is_memdb(&self) -> bool {
        self.mem_db
    }

    pub fn filename(&self) -> &str {
        &self.db_path
    }

    pub fn journal_name(&self) -> &str {
        &self.journal_path
    }

    pub fn page_count(&self) -> Pgno {
        self.db_size
    }

    pub fn temp_space(&mut self) -> &mut [u8] {
        &mut self.tmp_space
    }

    /// Number of pages currently resident in the cache.
    pub fn refcount(&self) -> i32 {
        self.pages.len() as i32
    }

    pub fn mem_used(&self) -> i32 {
        (self.page_size as i32) * self.pages.len() as i32
    }

    /// Truncate the database image, dropping cached pages beyond `pgno`.
    pub fn truncate_image(&mut self, pgno: Pgno) {
        if pgno < self.db_size {
            self.db_size = pgno;
        }
        self.pages.retain(|&p, _| p <= pgno);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_mode() {
        assert!(JournalMode::Wal.is_wal());
        assert!(!JournalMode::Delete.is_wal());
        assert!(!JournalMode::Persist.is_wal());
    }

    #[test]
    fn test_pager_state_ordering() {
        assert!((PagerState::Open as i32) < (PagerState::Reader as i32));
        assert!((PagerState::Reader as i32) < (PagerState::Writer as i32));
        assert!((PagerState::Writer as i32) < (PagerState::WriterLocked as i32));
    }

    #[test]
    fn test_journal_header_roundtrip() {
        let header = JournalHeader::new(100, 50, 512, 4096);
        let bytes = header.to_bytes();
        let parsed = JournalHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.page_count, parsed.page_count);
        assert_eq!(header.initial_pages, parsed.initial_pages);
        assert_eq!(header.sector_size, parsed.sector_size);
        assert_eq!(header.page_size, parsed.page_size);
    }

    #[test]
    fn test_pg_flags() {
        let mut flags = PgFlags::CLEAN;
        assert!(!flags.contains(PgFlags::DIRTY));
        flags.insert(PgFlags::DIRTY);
        assert!(flags.contains(PgFlags::DIRTY));
    }

    #[test]
    fn checksum_is_stable_for_same_bytes() {
        let a = Pager::checksum_data(b"hello world");
        let b = Pager::checksum_data(b"hello world");
        assert_eq!(a, b);
    }
}
