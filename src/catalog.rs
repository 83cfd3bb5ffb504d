//! Store header and column-family catalog.
//!
//! Page 1 holds a fixed-size header (magic, page size, schema version, the
//! default column family's tree roots, the catalog tree's root, the
//! freelist head, and a CF counter) and nothing else — unlike the trees it
//! points at, page 1 is never treated as a b-tree page itself, which keeps
//! `storage::btree`'s page codec free of any "page 1 is special" branches.
//! The catalog tree itself (keyed by CF name, `Comparator::Blob`) lives on
//! its own page and maps each name to a `(data_root, ttl_root, flags)`
//! record.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::{self, types::Comparator, Cursor};
use crate::storage::pager::Pager;
use crate::types::Pgno;
use crate::util::hash::Hash;

pub const HEADER_MAGIC: &[u8; 16] = b"kvengine-store\0\0";
pub const HEADER_SIZE: usize = 100;
pub const MAX_COLUMN_FAMILIES: u32 = 1024;
pub const DEFAULT_CF_NAME: &str = "default";

const OFF_MAGIC: usize = 0;
const OFF_PAGE_SIZE: usize = 16;
const OFF_SCHEMA_VERSION: usize = 20;
const OFF_DEFAULT_DATA_ROOT: usize = 24;
const OFF_DEFAULT_TTL_ROOT: usize = 28;
const OFF_CATALOG_ROOT: usize = 32;
const OFF_CF_COUNT: usize = 36;
const OFF_FREELIST_HEAD: usize = 40;

const CF_RECORD_SIZE: usize = 12;

/// A live handle to an open column family. Stamped with the catalog's
/// generation counter for this name at open time, so a handle taken before
/// a concurrent `cf_drop` can be told apart from a fresh one reusing the
/// same name.
#[derive(Debug, Clone)]
pub struct CfHandle {
    pub name: String,
    pub data_root: Pgno,
    pub ttl_root: Pgno,
    generation: u32,
}

struct CfEntry {
    data_root: Pgno,
    ttl_root: Pgno,
    flags: u32,
}

fn encode_cf_record(e: &CfEntry) -> [u8; CF_RECORD_SIZE] {
    let mut buf = [0u8; CF_RECORD_SIZE];
    buf[0..4].copy_from_slice(&e.data_root.to_be_bytes());
    buf[4..8].copy_from_slice(&e.ttl_root.to_be_bytes());
    buf[8..12].copy_from_slice(&e.flags.to_be_bytes());
    buf
}

fn decode_cf_record(buf: &[u8]) -> Result<CfEntry> {
    if buf.len() < CF_RECORD_SIZE {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let mut d = [0u8; 4];
    d.copy_from_slice(&buf[0..4]);
    let data_root = Pgno::from_be_bytes(d);
    d.copy_from_slice(&buf[4..8]);
    let ttl_root = Pgno::from_be_bytes(d);
    d.copy_from_slice(&buf[8..12]);
    let flags = Pgno::from_be_bytes(d);
    Ok(CfEntry {
        data_root,
        ttl_root,
        flags,
    })
}

/// The store header plus a small in-memory cache of open column-family
/// generations, used to invalidate handles after `cf_drop`.
pub struct Catalog {
    pub page_size: u32,
    pub schema_version: u32,
    pub catalog_root: Pgno,
    pub default_data_root: Pgno,
    pub default_ttl_root: Pgno,
    pub cf_count: u32,
    pub freelist_head: Pgno,
    generations: Hash<u32>,
}

impl Catalog {
    /// Initialize a brand new store: write page 1's header and create the
    /// catalog tree plus the default column family's data and TTL trees.
    pub fn create(pager: &mut Pager) -> Result<Self> {
        let page_size = pager.get_page_size();
        // Page 1 is consumed directly by the header, never by the b-tree
        // page allocator.
        let page1 = pager.allocate_page()?;
        debug_assert_eq!(page1, 1);

        let mut freelist_head: Pgno = 0;
        let catalog_root = btree::create_tree(pager, &mut freelist_head)?;
        let default_data_root = btree::create_tree(pager, &mut freelist_head)?;
        let default_ttl_root = btree::create_tree(pager, &mut freelist_head)?;

        let mut catalog = Catalog {
            page_size,
            schema_version: 1,
            catalog_root,
            default_data_root,
            default_ttl_root,
            cf_count: 1,
            freelist_head,
            generations: Hash::new(),
        };

        let entry = CfEntry {
            data_root: default_data_root,
            ttl_root: default_ttl_root,
            flags: 0,
        };
        let mut cur = Cursor::new(catalog.catalog_root, Comparator::Blob);
        cur.insert(
            pager,
            &mut catalog.freelist_head,
            DEFAULT_CF_NAME.as_bytes(),
            &encode_cf_record(&entry),
        )?;

        catalog.write_header(pager)?;
        Ok(catalog)
    }

    /// Load an existing store's header from page 1.
    pub fn open(pager: &mut Pager) -> Result<Self> {
        let buf = pager.read_page(1)?;
        if &buf[OFF_MAGIC..OFF_MAGIC + 16] != HEADER_MAGIC {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        let page_size = read_u32(buf, OFF_PAGE_SIZE)?;
        let schema_version = read_u32(buf, OFF_SCHEMA_VERSION)?;
        let default_data_root = read_u32(buf, OFF_DEFAULT_DATA_ROOT)?;
        let default_ttl_root = read_u32(buf, OFF_DEFAULT_TTL_ROOT)?;
        let catalog_root = read_u32(buf, OFF_CATALOG_ROOT)?;
        let cf_count = read_u32(buf, OFF_CF_COUNT)?;
        let freelist_head = read_u32(buf, OFF_FREELIST_HEAD)?;
        Ok(Catalog {
            page_size,
            schema_version,
            catalog_root,
            default_data_root,
            default_ttl_root,
            cf_count,
            freelist_head,
            generations: Hash::new(),
        })
    }

    pub fn write_header(&self, pager: &mut Pager) -> Result<()> {
        let buf = pager.write_page(1)?;
        buf[OFF_MAGIC..OFF_MAGIC + 16].copy_from_slice(HEADER_MAGIC);
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_be_bytes());
        buf[OFF_SCHEMA_VERSION..OFF_SCHEMA_VERSION + 4].copy_from_slice(&self.schema_version.to_be_bytes());
        buf[OFF_DEFAULT_DATA_ROOT..OFF_DEFAULT_DATA_ROOT + 4].copy_from_slice(&self.default_data_root.to_be_bytes());
        buf[OFF_DEFAULT_TTL_ROOT..OFF_DEFAULT_TTL_ROOT + 4].copy_from_slice(&self.default_ttl_root.to_be_bytes());
        buf[OFF_CATALOG_ROOT..OFF_CATALOG_ROOT + 4].copy_from_slice(&self.catalog_root.to_be_bytes());
        buf[OFF_CF_COUNT..OFF_CF_COUNT + 4].copy_from_slice(&self.cf_count.to_be_bytes());
        buf[OFF_FREELIST_HEAD..OFF_FREELIST_HEAD + 4].copy_from_slice(&self.freelist_head.to_be_bytes());
        for b in &mut buf[HEADER_SIZE..] {
            *b = 0;
        }
        Ok(())
    }

    fn generation_of(&mut self, name: &str) -> u32 {
        self.generations.find(name).copied().unwrap_or(0)
    }

    fn lookup_entry(&mut self, pager: &mut Pager, name: &str) -> Result<Option<CfEntry>> {
        let mut cur = Cursor::new(self.catalog_root, Comparator::Blob);
        if cur.move_to(pager, name.as_bytes())? != 0 {
            return Ok(None);
        }
        let value = cur.payload(pager)?;
        Ok(Some(decode_cf_record(&value)?))
    }

    pub fn cf_get_default(&mut self) -> CfHandle {
        let generation = self.generation_of(DEFAULT_CF_NAME);
        CfHandle {
            name: DEFAULT_CF_NAME.to_string(),
            data_root: self.default_data_root,
            ttl_root: self.default_ttl_root,
            generation,
        }
    }

    pub fn cf_open(&mut self, pager: &mut Pager, name: &str) -> Result<CfHandle> {
        match self.lookup_entry(pager, name)? {
            Some(entry) => Ok(CfHandle {
                name: name.to_string(),
                data_root: entry.data_root,
                ttl_root: entry.ttl_root,
                generation: self.generation_of(name),
            }),
            None => Err(Error::with_message(ErrorCode::NotFound, format!("no such column family: {name}"))),
        }
    }

    pub fn cf_create(&mut self, pager: &mut Pager, name: &str) -> Result<CfHandle> {
        if name == DEFAULT_CF_NAME {
            return Err(Error::with_message(ErrorCode::Protocol, "default column family always exists"));
        }
        if self.cf_count >= MAX_COLUMN_FAMILIES {
            return Err(Error::with_message(ErrorCode::Error, "column family limit reached"));
        }
        if self.lookup_entry(pager, name)?.is_some() {
            return Err(Error::with_message(ErrorCode::Error, format!("column family already exists: {name}")));
        }

        let data_root = btree::create_tree(pager, &mut self.freelist_head)?;
        let ttl_root = btree::create_tree(pager, &mut self.freelist_head)?;
        let entry = CfEntry {
            data_root,
            ttl_root,
            flags: 0,
        };
        let mut cur = Cursor::new(self.catalog_root, Comparator::Blob);
        cur.insert(pager, &mut self.freelist_head, name.as_bytes(), &encode_cf_record(&entry))?;
        self.cf_count += 1;
        self.write_header(pager)?;

        Ok(CfHandle {
            name: name.to_string(),
            data_root,
            ttl_root,
            generation: self.generation_of(name),
        })
    }

    pub fn cf_drop(&mut self, pager: &mut Pager, name: &str) -> Result<()> {
        if name == DEFAULT_CF_NAME {
            return Err(Error::with_message(ErrorCode::Protocol, "cannot drop the default column family"));
        }
        let entry = self
            .lookup_entry(pager, name)?
            .ok_or_else(|| Error::with_message(ErrorCode::NotFound, format!("no such column family: {name}")))?;

        btree::drop_tree(pager, &mut self.freelist_head, entry.data_root)?;
        btree::drop_tree(pager, &mut self.freelist_head, entry.ttl_root)?;

        let mut cur = Cursor::new(self.catalog_root, Comparator::Blob);
        if cur.move_to(pager, name.as_bytes())? == 0 {
            cur.delete(pager, &mut self.freelist_head)?;
        }
        self.cf_count = self.cf_count.saturating_sub(1);
        let gen = self.generations.find(name).copied().unwrap_or(0);
        self.generations.insert(name, Some(gen.wrapping_add(1)));
        self.write_header(pager)?;
        Ok(())
    }

    /// Every column family name currently in the catalog, in key order.
    pub fn cf_list(&self, pager: &mut Pager) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut cur = Cursor::new(self.catalog_root, Comparator::Blob);
        cur.first(pager)?;
        while cur.is_valid() {
            let key = cur.key(pager)?;
            names.push(String::from_utf8_lossy(&key).into_owned());
            cur.next(pager)?;
        }
        Ok(names)
    }

    /// `false` once the handle's column family has been dropped (and
    /// possibly re-created under the same name) since it was opened.
    pub fn is_handle_current(&mut self, name: &str, handle: &CfHandle) -> bool {
        self.generation_of(name) == handle.generation
    }

    /// Patch every reference to a relocated tree root: the catalog's own
    /// root, the default CF's roots in the header, or a CF record's roots
    /// in the catalog tree. Called from incremental vacuum's `PTRMAP_ROOT`
    /// case, which the b-tree layer deliberately leaves to the catalog
    /// since a tree's root lives in a catalog record, not a parent page.
    pub fn relocate_root(&mut self, pager: &mut Pager, old: Pgno, new: Pgno) -> Result<()> {
        let mut header_dirty = false;
        if self.catalog_root == old {
            self.catalog_root = new;
            header_dirty = true;
        }
        if self.default_data_root == old {
            self.default_data_root = new;
            header_dirty = true;
        }
        if self.default_ttl_root == old {
            self.default_ttl_root = new;
            header_dirty = true;
        }
        if header_dirty {
            self.write_header(pager)?;
        }

        let names = self.cf_list(pager)?;
        for name in names {
            if let Some(mut entry) = self.lookup_entry(pager, &name)? {
                let mut changed = false;
                if entry.data_root == old {
                    entry.data_root = new;
                    changed = true;
                }
                if entry.ttl_root == old {
                    entry.ttl_root = new;
                    changed = true;
                }
                if changed {
                    let mut cur = Cursor::new(self.catalog_root, Comparator::Blob);
                    cur.insert(pager, &mut self.freelist_head, name.as_bytes(), &encode_cf_record(&entry))?;
                }
            }
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    Ok(u32::from_be_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vfs::{OpenFlags, Vfs};
    use crate::storage::pager::PagerOpenFlags;
    use std::sync::Arc;

    fn temp_pager() -> (Pager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let vfs: Arc<dyn Vfs> = Arc::new(crate::os::unix::UnixVfs::new());
        let mut pager = Pager::open(vfs, path.to_str().unwrap(), PagerOpenFlags::empty(), OpenFlags::READWRITE | OpenFlags::CREATE).unwrap();
        pager.shared_lock().unwrap();
        pager.begin(true).unwrap();
        (pager, dir)
    }

    #[test]
    fn create_registers_default_cf() {
        let (mut pager, _dir) = temp_pager();
        let mut catalog = Catalog::create(&mut pager).unwrap();
        assert_eq!(catalog.cf_count, 1);
        assert_eq!(catalog.cf_list(&mut pager).unwrap(), vec!["default".to_string()]);
    }

    #[test]
    fn create_open_list_drop_cycle() {
        let (mut pager, _dir) = temp_pager();
        let mut catalog = Catalog::create(&mut pager).unwrap();
        catalog.cf_create(&mut pager, "users").unwrap();
        catalog.cf_create(&mut pager, "orders").unwrap();
        let mut names = catalog.cf_list(&mut pager).unwrap();
        names.sort();
        assert_eq!(names, vec!["default".to_string(), "orders".to_string(), "users".to_string()]);

        let handle = catalog.cf_open(&mut pager, "users").unwrap();
        catalog.cf_drop(&mut pager, "users").unwrap();
        assert!(!catalog.is_handle_current("users", &handle));
        assert!(catalog.cf_open(&mut pager, "users").is_err());
    }

    #[test]
    fn cannot_drop_default() {
        let (mut pager, _dir) = temp_pager();
        let mut catalog = Catalog::create(&mut pager).unwrap();
        assert!(catalog.cf_drop(&mut pager, "default").is_err());
    }
}
