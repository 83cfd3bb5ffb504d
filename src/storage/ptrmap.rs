//! Pointer-map pages and incremental auto-vacuum.
//!
//! Every non-pointer-map page's parent is recorded in a 5-byte entry
//! (`[type:1][parent_pgno:4]`) on the ptrmap page that covers it, so a page
//! can be relocated without a full-tree scan to find who references it.
//! Page 2 is the first ptrmap page; one ptrmap page covers
//! `(page_size - 2) / 5` pages, after which another ptrmap page appears.
//! Freed pages form a singly-linked list (`[next:4]` at the front of the
//! page) rooted at the store header's `freelist_head` slot.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::Pager;
use crate::types::Pgno;

pub const PTRMAP_ROOT: u8 = 1;
pub const PTRMAP_LEAF: u8 = 2;
pub const PTRMAP_INTERIOR: u8 = 3;
pub const PTRMAP_OVERFLOW: u8 = 4;

const ENTRY_SIZE: usize = 5;

fn entries_per_ptrmap_page(page_size: u32) -> Pgno {
    ((page_size as usize - 2) / ENTRY_SIZE) as Pgno
}

/// True if `pgno` is itself a pointer-map page (and therefore carries no
/// entry of its own).
pub fn is_ptrmap_page(pgno: Pgno, page_size: u32) -> bool {
    if pgno < 2 {
        return false;
    }
    let per_page = entries_per_ptrmap_page(page_size);
    (pgno - 2) % (per_page + 1) == 0
}

/// The ptrmap page that holds `pgno`'s entry.
pub fn ptrmap_page_for(pgno: Pgno, page_size: u32) -> Pgno {
    let per_page = entries_per_ptrmap_page(page_size);
    let group = (pgno - 2) / (per_page + 1);
    group * (per_page + 1) + 2
}

fn ptrmap_offset_for(pgno: Pgno, page_size: u32) -> usize {
    let ptrmap_pg = ptrmap_page_for(pgno, page_size);
    ((pgno - ptrmap_pg - 1) as usize) * ENTRY_SIZE
}

pub fn write_ptrmap_entry(pager: &mut Pager, pgno: Pgno, entry_type: u8, parent: Pgno) -> Result<()> {
    let page_size = pager.get_page_size();
    let ptrmap_pg = ptrmap_page_for(pgno, page_size);
    let offset = ptrmap_offset_for(pgno, page_size);
    let buf = pager.write_page(ptrmap_pg)?;
    if offset + ENTRY_SIZE > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    buf[offset] = entry_type;
    buf[offset + 1..offset + 5].copy_from_slice(&parent.to_be_bytes());
    Ok(())
}

pub fn read_ptrmap_entry(pager: &mut Pager, pgno: Pgno) -> Result<(u8, Pgno)> {
    let page_size = pager.get_page_size();
    let ptrmap_pg = ptrmap_page_for(pgno, page_size);
    let offset = ptrmap_offset_for(pgno, page_size);
    let buf = pager.read_page(ptrmap_pg)?;
    if offset + ENTRY_SIZE > buf.len() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let entry_type = buf[offset];
    let mut parent_bytes = [0u8; 4];
    parent_bytes.copy_from_slice(&buf[offset + 1..offset + 5]);
    Ok((entry_type, Pgno::from_be_bytes(parent_bytes)))
}

/// Push `pgno` onto the head of the freelist rooted at `*freelist_head`.
pub fn free_page(pager: &mut Pager, freelist_head: &mut Pgno, pgno: Pgno) -> Result<()> {
    let prev_head = *freelist_head;
    let buf = pager.write_page(pgno)?;
    buf[..4].copy_from_slice(&prev_head.to_be_bytes());
    for b in &mut buf[4..] {
        *b = 0;
    }
    *freelist_head = pgno;
    Ok(())
}

/// Pop a page off the freelist if one is available, else allocate a fresh
/// page at the end of the file.
pub fn allocate_page(pager: &mut Pager, freelist_head: &mut Pgno) -> Result<Pgno> {
    if *freelist_head != 0 {
        let pgno = *freelist_head;
        let buf = pager.read_page(pgno)?;
        let mut next = [0u8; 4];
        next.copy_from_slice(&buf[..4]);
        *freelist_head = Pgno::from_be_bytes(next);
        Ok(pgno)
    } else {
        pager.allocate_page()
    }
}

/// Reclaim trailing free pages by truncating the file, then, if the last
/// page is still in use but a free slot exists earlier in the file, move it
/// into that slot and fix up the one reference to it (found via its ptrmap
/// entry). Returns `true` if progress was made so the caller can keep
/// stepping until the database stops shrinking.
pub fn incremental_vacuum_step(
    pager: &mut Pager,
    freelist_head: &mut Pgno,
    fixup: &mut dyn FnMut(&mut Pager, u8, Pgno, Pgno, Pgno) -> Result<()>,
) -> Result<bool> {
    let last = pager.page_count();
    if last < 2 {
        return Ok(false);
    }
    if is_ptrmap_page(last, pager.get_page_size()) {
        return Ok(false);
    }

    if page_is_on_freelist(pager, *freelist_head, last)? {
        remove_from_freelist(pager, freelist_head, last)?;
        pager.truncate_image(last - 1);
        return Ok(true);
    }

    if *freelist_head == 0 || *freelist_head >= last {
        return Ok(false);
    }
    let target = allocate_page(pager, freelist_head)?;
    if target >= last {
        free_page(pager, freelist_head, target)?;
        return Ok(false);
    }

    let data = pager.read_page(last)?.to_vec();
    pager.write_page(target)?.copy_from_slice(&data);

    let (entry_type, parent) = read_ptrmap_entry(pager, last)?;
    fixup(pager, entry_type, parent, last, target)?;
    write_ptrmap_entry(pager, target, entry_type, parent)?;
    pager.truncate_image(last - 1);
    Ok(true)
}

fn page_is_on_freelist(pager: &mut Pager, head: Pgno, pgno: Pgno) -> Result<bool> {
    let mut cur = head;
    while cur != 0 {
        if cur == pgno {
            return Ok(true);
        }
        let buf = pager.read_page(cur)?;
        let mut next = [0u8; 4];
        next.copy_from_slice(&buf[..4]);
        cur = Pgno::from_be_bytes(next);
    }
    Ok(false)
}

fn remove_from_freelist(pager: &mut Pager, head: &mut Pgno, pgno: Pgno) -> Result<()> {
    if *head == pgno {
        let buf = pager.read_page(pgno)?;
        let mut next = [0u8; 4];
        next.copy_from_slice(&buf[..4]);
        *head = Pgno::from_be_bytes(next);
        return Ok(());
    }
    let mut cur = *head;
    loop {
        let buf = pager.read_page(cur)?;
        let mut next_bytes = [0u8; 4];
        next_bytes.copy_from_slice(&buf[..4]);
        let next = Pgno::from_be_bytes(next_bytes);
        if next == pgno {
            let next_buf = pager.read_page(pgno)?;
            let mut after = [0u8; 4];
            after.copy_from_slice(&next_buf[..4]);
            pager.write_page(cur)?[..4].copy_from_slice(&after);
            return Ok(());
        }
        if next == 0 {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        cur = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptrmap_page_placement_matches_formula() {
        let page_size = 4096u32;
        let per_page = entries_per_ptrmap_page(page_size);
        assert_eq!(ptrmap_page_for(2, page_size), 2);
        assert!(!is_ptrmap_page(3, page_size));
        assert!(is_ptrmap_page(2, page_size));
        let next_ptrmap = 2 + per_page + 1;
        assert!(is_ptrmap_page(next_ptrmap, page_size));
        assert_eq!(ptrmap_page_for(next_ptrmap + 1, page_size), next_ptrmap);
    }
}
