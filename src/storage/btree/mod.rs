//! B+-tree over pager-managed pages: two key comparators (signed-64 `Int`
//! for the catalog tree, lexicographic `Blob` for everything else), a
//! leaf/interior cell codec with overflow chains for oversized payloads,
//! and cursor-based navigation, insert, and delete.
//!
//! Pages are always rebuilt in full from a parsed [`PageContent`] rather
//! than patched cell-by-cell; this trades a little I/O for a much simpler,
//! always-consistent content area (no free-block list or fragmentation
//! counter to keep in sync by hand).

pub mod encoding;
pub mod types;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::Pager;
use crate::storage::ptrmap::{self, PTRMAP_INTERIOR, PTRMAP_LEAF, PTRMAP_OVERFLOW, PTRMAP_ROOT};
use crate::types::Pgno;
use encoding::{
    build_interior_cell, build_leaf_cell, overflow_chain_pages, parse_interior_cell, parse_leaf_cell,
    patch_overflow_pointer, read_overflow_chain, read_u32, write_overflow_chain, ParsedLeafCell,
};
use types::{Comparator, PageContent, INTERIOR_HEADER_SIZE, PAGE_HEADER_SIZE, PAGE_TYPE_INTERIOR, PAGE_TYPE_LEAF};

fn usable_size(pager: &Pager) -> usize {
    pager.get_page_size() as usize
}

/// Parse a raw page buffer into its cell list.
pub fn parse_page(buf: &[u8]) -> Result<PageContent> {
    if buf.is_empty() {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    let page_type = buf[0];
    let header_size = if page_type == PAGE_TYPE_LEAF {
        PAGE_HEADER_SIZE
    } else if page_type == PAGE_TYPE_INTERIOR {
        INTERIOR_HEADER_SIZE
    } else {
        return Err(Error::new(ErrorCode::Corrupt));
    };
    let right_child = if page_type == PAGE_TYPE_INTERIOR {
        read_u32(buf, PAGE_HEADER_SIZE).ok_or_else(|| Error::new(ErrorCode::Corrupt))?
    } else {
        0
    };
    let cell_count = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let mut starts = Vec::with_capacity(cell_count);
    for i in 0..cell_count {
        let slot = header_size + i * 2;
        let off = u16::from_be_bytes([buf[slot], buf[slot + 1]]) as usize;
        starts.push(off);
    }
    // Cells grow back-to-front from the end of the page in ascending slot
    // order, so cell i's end is cell (i-1)'s start (or the page end for
    // cell 0, the one closest to the tail of the buffer).
    let mut cells = Vec::with_capacity(cell_count);
    for i in 0..cell_count {
        let start = starts[i];
        let stop = if i == 0 { buf.len() } else { starts[i - 1] };
        if start > stop || stop > buf.len() {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        cells.push(buf[start..stop].to_vec());
    }
    Ok(PageContent {
        page_type,
        right_child,
        cells,
    })
}

/// Serialize a [`PageContent`] back into a page-sized buffer. Cells are
/// written back-to-front from the end of the page; the slot array holds
/// each cell's start offset, in ascending key order.
pub fn serialize_page(content: &PageContent, buf: &mut [u8]) -> Result<()> {
    for b in buf.iter_mut() {
        *b = 0;
    }
    let header_size = content.header_size();
    if content.encoded_len() > buf.len() {
        return Err(Error::new(ErrorCode::Error));
    }
    buf[0] = content.page_type;
    buf[1] = 0;
    buf[2] = 0;
    let cell_count = content.cells.len() as u16;
    buf[3..5].copy_from_slice(&cell_count.to_be_bytes());
    if content.page_type == PAGE_TYPE_INTERIOR {
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4].copy_from_slice(&content.right_child.to_be_bytes());
    }

    let mut write_at = buf.len();
    for (i, cell) in content.cells.iter().enumerate() {
        write_at -= cell.len();
        buf[write_at..write_at + cell.len()].copy_from_slice(cell);
        let slot = header_size + i * 2;
        buf[slot..slot + 2].copy_from_slice(&(write_at as u16).to_be_bytes());
    }
    let content_offset = write_at as u16;
    buf[5..7].copy_from_slice(&content_offset.to_be_bytes());
    buf[7] = 0;
    Ok(())
}

fn write_page_content(pager: &mut Pager, pgno: Pgno, content: &PageContent) -> Result<()> {
    let buf = pager.write_page(pgno)?;
    serialize_page(content, buf)
}

/// The logical key bytes for a cell, following its overflow chain if the
/// key itself spilled past the local storage limit.
fn cell_key(pager: &mut Pager, is_leaf: bool, cell: &[u8]) -> Result<Vec<u8>> {
    let size = usable_size(pager);
    if is_leaf {
        let parsed = parse_leaf_cell(cell)?;
        if let Some(first) = parsed.overflow_pgno {
            if parsed.key_size <= parsed.local.len() {
                Ok(parsed.local[..parsed.key_size].to_vec())
            } else {
                let tail_len = parsed.payload_size - parsed.local.len();
                let mut full = parsed.local.to_vec();
                full.extend(read_overflow_chain(pager, size, first, tail_len)?);
                Ok(full[..parsed.key_size].to_vec())
            }
        } else {
            Ok(parsed.local[..parsed.key_size.min(parsed.local.len())].to_vec())
        }
    } else {
        let parsed = parse_interior_cell(cell)?;
        if let Some(first) = parsed.overflow_pgno {
            let tail_len = parsed.key_size - parsed.local.len();
            let mut full = parsed.local.to_vec();
            full.extend(read_overflow_chain(pager, size, first, tail_len)?);
            Ok(full)
        } else {
            Ok(parsed.local.to_vec())
        }
    }
}

/// Return the logical `key ++ value` bytes for a parsed leaf cell,
/// following its overflow chain if it has one.
fn full_payload(pager: &mut Pager, size: usize, parsed: &ParsedLeafCell<'_>) -> Result<Vec<u8>> {
    if let Some(first) = parsed.overflow_pgno {
        let tail_len = parsed.payload_size - parsed.local.len();
        let mut out = parsed.local.to_vec();
        out.extend(read_overflow_chain(pager, size, first, tail_len)?);
        Ok(out)
    } else {
        Ok(parsed.local.to_vec())
    }
}

/// Write a possibly-overflowing interior/leaf cell's spilled tail to a
/// fresh overflow chain and register ptrmap entries for every page in it.
/// `owner` is the page whose cell holds the (now patched) pointer to the
/// first overflow page.
fn spill_cell(
    pager: &mut Pager,
    freelist_head: &mut Pgno,
    owner: Pgno,
    encoded: &mut encoding::EncodedLeafCell,
) -> Result<()> {
    if let Some(tail) = encoded.overflow_tail.take() {
        let size = usable_size(pager);
        let first = write_overflow_chain(pager, size, &tail, &mut |p| ptrmap::allocate_page(p, freelist_head))?;
        patch_overflow_pointer(&mut encoded.cell, first);
        for (i, opg) in overflow_chain_pages(pager, first)?.into_iter().enumerate() {
            let parent = if i == 0 { owner } else { first };
            ptrmap::write_ptrmap_entry(pager, opg, PTRMAP_OVERFLOW, parent)?;
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Invalid,
    Valid,
    Eof,
}

/// A position within a tree, expressed as a path of (page, child/cell
/// index) frames from the root down to the current leaf cell. For an
/// interior frame, index `i` means "descended via `cells[i].left_child`",
/// and `i == cells.len()` means "descended via `right_child`".
pub struct Cursor {
    root: Pgno,
    comparator: Comparator,
    stack: Vec<(Pgno, usize)>,
    state: CursorState,
}

impl Cursor {
    pub fn new(root: Pgno, comparator: Comparator) -> Self {
        Cursor {
            root,
            comparator,
            stack: Vec::new(),
            state: CursorState::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    fn leaf_frame(&self) -> Option<(Pgno, usize)> {
        self.stack.last().copied()
    }

    fn descend_leftmost(&mut self, pager: &mut Pager, mut pgno: Pgno) -> Result<()> {
        loop {
            let content = parse_page(pager.read_page(pgno)?)?;
            if content.is_leaf() {
                self.stack.push((pgno, 0));
                return Ok(());
            }
            let child = if content.cells.is_empty() {
                content.right_child
            } else {
                parse_interior_cell(&content.cells[0])?.left_child
            };
            self.stack.push((pgno, 0));
            pgno = child;
        }
    }

    fn descend_rightmost(&mut self, pager: &mut Pager, mut pgno: Pgno) -> Result<()> {
        loop {
            let content = parse_page(pager.read_page(pgno)?)?;
            if content.is_leaf() {
                let idx = content.cells.len().saturating_sub(1);
                self.stack.push((pgno, idx));
                return Ok(());
            }
            self.stack.push((pgno, content.cells.len()));
            pgno = content.right_child;
        }
    }

    pub fn first(&mut self, pager: &mut Pager) -> Result<()> {
        self.stack.clear();
        self.descend_leftmost(pager, self.root)?;
        let (pgno, _) = self.leaf_frame().unwrap();
        let content = parse_page(pager.read_page(pgno)?)?;
        self.state = if content.cells.is_empty() {
            CursorState::Eof
        } else {
            CursorState::Valid
        };
        Ok(())
    }

    pub fn last(&mut self, pager: &mut Pager) -> Result<()> {
        self.stack.clear();
        self.descend_rightmost(pager, self.root)?;
        let (pgno, _) = self.leaf_frame().unwrap();
        let content = parse_page(pager.read_page(pgno)?)?;
        self.state = if content.cells.is_empty() {
            CursorState::Eof
        } else {
            CursorState::Valid
        };
        Ok(())
    }

    /// Descend to the leaf that should contain `key`. Returns `0` on exact
    /// match, `1` if positioned at the smallest key greater than `key`, or
    /// `-1` if there is no such key (cursor lands at end of tree).
    pub fn move_to(&mut self, pager: &mut Pager, key: &[u8]) -> Result<i32> {
        self.stack.clear();
        let mut pgno = self.root;
        loop {
            let content = parse_page(pager.read_page(pgno)?)?;
            if content.is_leaf() {
                let mut lo = 0usize;
                let mut hi = content.cells.len();
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let k = cell_key(pager, true, &content.cells[mid])?;
                    if k.as_slice() < key {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                self.stack.push((pgno, lo));
                if lo < content.cells.len() {
                    let k = cell_key(pager, true, &content.cells[lo])?;
                    let rel = match self.comparator.compare(&k, key) {
                        std::cmp::Ordering::Equal => 0,
                        std::cmp::Ordering::Greater => 1,
                        std::cmp::Ordering::Less => -1,
                    };
                    self.state = CursorState::Valid;
                    return Ok(rel);
                } else {
                    self.state = CursorState::Eof;
                    return Ok(-1);
                }
            } else {
                let mut lo = 0usize;
                let mut hi = content.cells.len();
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let k = cell_key(pager, false, &content.cells[mid])?;
                    if self.comparator.compare(&k, key) != std::cmp::Ordering::Greater {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                self.stack.push((pgno, lo));
                pgno = if lo < content.cells.len() {
                    parse_interior_cell(&content.cells[lo])?.left_child
                } else {
                    content.right_child
                };
            }
        }
    }

    pub fn next(&mut self, pager: &mut Pager) -> Result<()> {
        let (leaf_pgno, leaf_idx) = match self.leaf_frame() {
            Some(f) => f,
            None => {
                self.state = CursorState::Eof;
                return Ok(());
            }
        };
        let content = parse_page(pager.read_page(leaf_pgno)?)?;
        if leaf_idx + 1 < content.cells.len() {
            let last = self.stack.len() - 1;
            self.stack[last].1 = leaf_idx + 1;
            self.state = CursorState::Valid;
            return Ok(());
        }
        self.stack.pop();
        while let Some(&(pgno, idx)) = self.stack.last() {
            let content = parse_page(pager.read_page(pgno)?)?;
            if idx + 1 <= content.cells.len() {
                let last = self.stack.len() - 1;
                self.stack[last].1 = idx + 1;
                let child = if idx + 1 < content.cells.len() {
                    parse_interior_cell(&content.cells[idx + 1])?.left_child
                } else {
                    content.right_child
                };
                self.descend_leftmost(pager, child)?;
                self.state = CursorState::Valid;
                return Ok(());
            }
            self.stack.pop();
        }
        self.state = CursorState::Eof;
        Ok(())
    }

    pub fn prev(&mut self, pager: &mut Pager) -> Result<()> {
        let (leaf_pgno, leaf_idx) = match self.leaf_frame() {
            Some(f) => f,
            None => {
                self.state = CursorState::Eof;
                return Ok(());
            }
        };
        let _ = parse_page(pager.read_page(leaf_pgno)?)?;
        if leaf_idx > 0 {
            let last = self.stack.len() - 1;
            self.stack[last].1 = leaf_idx - 1;
            self.state = CursorState::Valid;
            return Ok(());
        }
        self.stack.pop();
        while let Some(&(pgno, idx)) = self.stack.last() {
            if idx > 0 {
                let last = self.stack.len() - 1;
                self.stack[last].1 = idx - 1;
                let content = parse_page(pager.read_page(pgno)?)?;
                let child = parse_interior_cell(&content.cells[idx - 1])?.left_child;
                self.descend_rightmost(pager, child)?;
                self.state = CursorState::Valid;
                return Ok(());
            }
            self.stack.pop();
        }
        self.state = CursorState::Eof;
        Ok(())
    }

    /// The key at the cursor's current position, owned.
    pub fn key(&self, pager: &mut Pager) -> Result<Vec<u8>> {
        let (pgno, idx) = self.leaf_frame().ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        let content = parse_page(pager.read_page(pgno)?)?;
        let cell = content.cells.get(idx).ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        let parsed = parse_leaf_cell(cell)?;
        let size = usable_size(pager);
        let full = full_payload(pager, size, &parsed)?;
        Ok(full[..parsed.key_size].to_vec())
    }

    pub fn payload_size(&self, pager: &mut Pager) -> Result<usize> {
        let (pgno, idx) = self.leaf_frame().ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        let content = parse_page(pager.read_page(pgno)?)?;
        let cell = content.cells.get(idx).ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        let parsed = parse_leaf_cell(cell)?;
        Ok(parsed.payload_size - parsed.key_size)
    }

    /// The value at the cursor's current position, owned.
    pub fn payload(&self, pager: &mut Pager) -> Result<Vec<u8>> {
        let (pgno, idx) = self.leaf_frame().ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        let content = parse_page(pager.read_page(pgno)?)?;
        let cell = content.cells.get(idx).ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        let parsed = parse_leaf_cell(cell)?;
        let size = usable_size(pager);
        let full = full_payload(pager, size, &parsed)?;
        Ok(full[parsed.key_size..].to_vec())
    }

    /// Insert or overwrite the cell at `key` with `value`.
    pub fn insert(&mut self, pager: &mut Pager, freelist_head: &mut Pgno, key: &[u8], value: &[u8]) -> Result<()> {
        let rel = self.move_to(pager, key)?;
        let (pgno, mut idx) = self.leaf_frame().unwrap();
        let mut content = parse_page(pager.read_page(pgno)?)?;
        let size = usable_size(pager);

        let mut encoded = build_leaf_cell(key, value, size);
        spill_cell(pager, freelist_head, pgno, &mut encoded)?;

        if rel == 0 {
            if let Some(old) = content.cells.get(idx) {
                if let Ok(parsed) = parse_leaf_cell(old) {
                    if let Some(first) = parsed.overflow_pgno {
                        for opg in overflow_chain_pages(pager, first)? {
                            ptrmap::free_page(pager, freelist_head, opg)?;
                        }
                    }
                }
            }
            content.cells[idx] = encoded.cell;
        } else {
            content.cells.insert(idx, encoded.cell);
        }
        idx = idx.min(content.cells.len().saturating_sub(1));
        let last = self.stack.len() - 1;
        self.stack[last].1 = idx;

        if content.encoded_len() <= size {
            write_page_content(pager, pgno, &content)?;
        } else {
            self.split(pager, freelist_head, pgno, content)?;
        }
        self.state = CursorState::Valid;
        Ok(())
    }

    /// Delete the cell the cursor currently sits on.
    pub fn delete(&mut self, pager: &mut Pager, freelist_head: &mut Pgno) -> Result<()> {
        let (pgno, idx) = self.leaf_frame().ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        let mut content = parse_page(pager.read_page(pgno)?)?;
        if idx >= content.cells.len() {
            return Err(Error::new(ErrorCode::NotFound));
        }
        let removed = content.cells.remove(idx);
        if let Ok(parsed) = parse_leaf_cell(&removed) {
            if let Some(first) = parsed.overflow_pgno {
                for opg in overflow_chain_pages(pager, first)? {
                    ptrmap::free_page(pager, freelist_head, opg)?;
                }
            }
        }
        write_page_content(pager, pgno, &content)?;
        self.merge_if_underfull(pager, freelist_head, pgno)?;
        self.state = CursorState::Invalid;
        Ok(())
    }

    /// Split an overfull page, promoting a separator into the parent
    /// (recursively; grows the tree by one level if the root overflows).
    fn split(&mut self, pager: &mut Pager, freelist_head: &mut Pgno, pgno: Pgno, content: PageContent) -> Result<()> {
        let size = usable_size(pager);
        let mid = content.cells.len() / 2;
        let new_right = ptrmap::allocate_page(pager, freelist_head)?;

        let separator = if content.is_leaf() {
            let left_cells = content.cells[..mid].to_vec();
            let right_cells = content.cells[mid..].to_vec();
            let separator = cell_key(pager, true, &right_cells[0])?;
            let left_content = PageContent {
                page_type: PAGE_TYPE_LEAF,
                right_child: 0,
                cells: left_cells,
            };
            let right_content = PageContent {
                page_type: PAGE_TYPE_LEAF,
                right_child: 0,
                cells: right_cells,
            };
            write_page_content(pager, pgno, &left_content)?;
            write_page_content(pager, new_right, &right_content)?;
            separator
        } else {
            let promoted = parse_interior_cell(&content.cells[mid])?;
            let separator = cell_key(pager, false, &content.cells[mid])?;
            let left_right_child = promoted.left_child;
            let left_cells = content.cells[..mid].to_vec();
            let right_cells = content.cells[mid + 1..].to_vec();
            let right_right_child = content.right_child;

            let left_content = PageContent {
                page_type: PAGE_TYPE_INTERIOR,
                right_child: left_right_child,
                cells: left_cells,
            };
            let right_content = PageContent {
                page_type: PAGE_TYPE_INTERIOR,
                right_child: right_right_child,
                cells: right_cells,
            };
            write_page_content(pager, pgno, &left_content)?;
            write_page_content(pager, new_right, &right_content)?;

            ptrmap::write_ptrmap_entry(pager, left_right_child, PTRMAP_INTERIOR, pgno)?;
            for c in &right_content.cells {
                let p = parse_interior_cell(c)?;
                ptrmap::write_ptrmap_entry(pager, p.left_child, PTRMAP_INTERIOR, new_right)?;
            }
            if right_right_child != 0 {
                ptrmap::write_ptrmap_entry(pager, right_right_child, PTRMAP_INTERIOR, new_right)?;
            }
            separator
        };

        self.promote_separator(pager, freelist_head, pgno, &separator, new_right, size)
    }

    /// Insert the separator for a freshly split `child`/`new_sibling` pair
    /// into `child`'s parent, splitting the parent in turn if needed, or
    /// growing a new root if `child` had no parent.
    fn promote_separator(
        &mut self,
        pager: &mut Pager,
        freelist_head: &mut Pgno,
        child: Pgno,
        separator: &[u8],
        new_sibling: Pgno,
        size: usize,
    ) -> Result<()> {
        let depth = self
            .stack
            .iter()
            .position(|&(pg, _)| pg == child)
            .ok_or_else(|| Error::new(ErrorCode::Corrupt))?;
        if depth == 0 {
            return self.grow_root(pager, freelist_head, child, new_sibling, separator);
        }
        let (parent_pgno, child_idx) = self.stack[depth - 1];
        let mut parent = parse_page(pager.read_page(parent_pgno)?)?;
        let mut new_cell = build_interior_cell(child, separator, size);
        spill_cell(pager, freelist_head, parent_pgno, &mut new_cell)?;

        if child_idx < parent.cells.len() {
            parent.cells[child_idx][0..4].copy_from_slice(&new_sibling.to_be_bytes());
            parent.cells.insert(child_idx, new_cell.cell);
        } else {
            parent.right_child = new_sibling;
            parent.cells.push(new_cell.cell);
        }
        ptrmap::write_ptrmap_entry(pager, new_sibling, PTRMAP_INTERIOR, parent_pgno)?;
        ptrmap::write_ptrmap_entry(pager, child, PTRMAP_INTERIOR, parent_pgno)?;

        if parent.encoded_len() <= size {
            write_page_content(pager, parent_pgno, &parent)
        } else {
            self.split(pager, freelist_head, parent_pgno, parent)
        }
    }

    fn grow_root(
        &mut self,
        pager: &mut Pager,
        freelist_head: &mut Pgno,
        left: Pgno,
        right: Pgno,
        separator: &[u8],
    ) -> Result<()> {
        let new_left = ptrmap::allocate_page(pager, freelist_head)?;
        let old_root_content = parse_page(pager.read_page(left)?)?;
        write_page_content(pager, new_left, &old_root_content)?;
        if !old_root_content.is_leaf() {
            for c in &old_root_content.cells {
                let p = parse_interior_cell(c)?;
                ptrmap::write_ptrmap_entry(pager, p.left_child, PTRMAP_INTERIOR, new_left)?;
            }
            if old_root_content.right_child != 0 {
                ptrmap::write_ptrmap_entry(pager, old_root_content.right_child, PTRMAP_INTERIOR, new_left)?;
            }
        }

        let mut cell = build_interior_cell(new_left, separator, usable_size(pager));
        spill_cell(pager, freelist_head, left, &mut cell)?;
        let new_root = PageContent {
            page_type: PAGE_TYPE_INTERIOR,
            right_child: right,
            cells: vec![cell.cell],
        };
        write_page_content(pager, left, &new_root)?;
        ptrmap::write_ptrmap_entry(pager, new_left, PTRMAP_INTERIOR, left)?;
        ptrmap::write_ptrmap_entry(pager, right, PTRMAP_INTERIOR, left)?;
        ptrmap::write_ptrmap_entry(pager, left, PTRMAP_ROOT, 0)?;
        Ok(())
    }

    /// After a delete, if a leaf is left empty and isn't the root, drop it
    /// and its separator from the parent, recursing up; collapse the root
    /// if it ends up with a single remaining child. This reclaims empty
    /// pages without the full cost of redistributing keys across
    /// under-full-but-nonempty siblings.
    fn merge_if_underfull(&mut self, pager: &mut Pager, freelist_head: &mut Pgno, pgno: Pgno) -> Result<()> {
        if pgno == self.root {
            return self.collapse_root_if_needed(pager, freelist_head);
        }
        let content = parse_page(pager.read_page(pgno)?)?;
        if !content.cells.is_empty() || !content.is_leaf() {
            return Ok(());
        }
        let depth = match self.stack.iter().position(|&(pg, _)| pg == pgno) {
            Some(d) => d,
            None => return Ok(()),
        };
        if depth == 0 {
            return Ok(());
        }
        let (parent_pgno, child_idx) = self.stack[depth - 1];
        let mut parent = parse_page(pager.read_page(parent_pgno)?)?;
        if parent.cells.is_empty() {
            return Ok(());
        }
        let remove_idx = child_idx.min(parent.cells.len() - 1);
        parent.cells.remove(remove_idx);
        ptrmap::free_page(pager, freelist_head, pgno)?;
        write_page_content(pager, parent_pgno, &parent)?;
        self.stack.truncate(depth);
        self.merge_if_underfull(pager, freelist_head, parent_pgno)
    }

    fn collapse_root_if_needed(&mut self, pager: &mut Pager, freelist_head: &mut Pgno) -> Result<()> {
        let content = parse_page(pager.read_page(self.root)?)?;
        if content.is_leaf() || !content.cells.is_empty() {
            return Ok(());
        }
        let only_child = content.right_child;
        let child_content = parse_page(pager.read_page(only_child)?)?;
        write_page_content(pager, self.root, &child_content)?;
        ptrmap::free_page(pager, freelist_head, only_child)?;
        ptrmap::write_ptrmap_entry(pager, self.root, PTRMAP_ROOT, 0)?;
        Ok(())
    }
}

/// Allocate a fresh, empty leaf page and return its page number: the root
/// of a brand new tree.
pub fn create_tree(pager: &mut Pager, freelist_head: &mut Pgno) -> Result<Pgno> {
    let root = ptrmap::allocate_page(pager, freelist_head)?;
    write_page_content(pager, root, &PageContent::new_leaf())?;
    ptrmap::write_ptrmap_entry(pager, root, PTRMAP_ROOT, 0)?;
    Ok(root)
}

/// Free every page reachable from `root`: leaves, interior pages, and any
/// overflow chains they reference.
pub fn drop_tree(pager: &mut Pager, freelist_head: &mut Pgno, root: Pgno) -> Result<()> {
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        let content = parse_page(pager.read_page(pgno)?)?;
        for cell in &content.cells {
            if content.is_leaf() {
                if let Ok(parsed) = parse_leaf_cell(cell) {
                    if let Some(first) = parsed.overflow_pgno {
                        for opg in overflow_chain_pages(pager, first)? {
                            ptrmap::free_page(pager, freelist_head, opg)?;
                        }
                    }
                }
            } else if let Ok(parsed) = parse_interior_cell(cell) {
                stack.push(parsed.left_child);
                if let Some(first) = parsed.overflow_pgno {
                    for opg in overflow_chain_pages(pager, first)? {
                        ptrmap::free_page(pager, freelist_head, opg)?;
                    }
                }
            }
        }
        if !content.is_leaf() && content.right_child != 0 {
            stack.push(content.right_child);
        }
        ptrmap::free_page(pager, freelist_head, pgno)?;
    }
    Ok(())
}

/// Fix the one reference to `old` after [`ptrmap::incremental_vacuum_step`]
/// relocates it to `new`. `PTRMAP_ROOT` pages are the catalog's concern (a
/// tree's root pgno lives in a catalog record, not in a parent page) and
/// are left for the caller to patch instead.
pub fn fixup_reference(pager: &mut Pager, entry_type: u8, parent: Pgno, old: Pgno, new: Pgno) -> Result<()> {
    match entry_type {
        PTRMAP_LEAF | PTRMAP_INTERIOR => {
            let mut content = parse_page(pager.read_page(parent)?)?;
            if content.right_child == old {
                content.right_child = new;
            } else {
                for cell in content.cells.iter_mut() {
                    if let Ok(p) = parse_interior_cell(cell) {
                        if p.left_child == old {
                            cell[0..4].copy_from_slice(&new.to_be_bytes());
                            break;
                        }
                    }
                }
            }
            write_page_content(pager, parent, &content)
        }
        PTRMAP_OVERFLOW => {
            let mut content = parse_page(pager.read_page(parent)?)?;
            for cell in content.cells.iter_mut() {
                let len = cell.len();
                if len >= 4 {
                    if let Some(ptr) = read_u32(cell, len - 4) {
                        if ptr == old {
                            cell[len - 4..].copy_from_slice(&new.to_be_bytes());
                            break;
                        }
                    }
                }
            }
            write_page_content(pager, parent, &content)
        }
        _ => Ok(()),
    }
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
        let mut pager = Pager::open(
            vfs,
            path.to_str().unwrap(),
            PagerOpenFlags::empty(),
            OpenFlags::READWRITE | OpenFlags::CREATE,
        )
        .unwrap();
        pager.shared_lock().unwrap();
        pager.begin(true).unwrap();
        (pager, dir)
    }

    #[test]
    fn insert_and_find_roundtrip() {
        let (mut pager, _dir) = temp_pager();
        let mut freelist = 0u32;
        let root = create_tree(&mut pager, &mut freelist).unwrap();
        let mut cur = Cursor::new(root, Comparator::Blob);
        cur.insert(&mut pager, &mut freelist, b"apple", b"1").unwrap();
        cur.insert(&mut pager, &mut freelist, b"banana", b"2").unwrap();
        cur.insert(&mut pager, &mut freelist, b"cherry", b"3").unwrap();

        let rel = cur.move_to(&mut pager, b"banana").unwrap();
        assert_eq!(rel, 0);
        assert_eq!(cur.payload(&mut pager).unwrap(), b"2");
    }

    #[test]
    fn delete_removes_key() {
        let (mut pager, _dir) = temp_pager();
        let mut freelist = 0u32;
        let root = create_tree(&mut pager, &mut freelist).unwrap();
        let mut cur = Cursor::new(root, Comparator::Blob);
        cur.insert(&mut pager, &mut freelist, b"k1", b"v1").unwrap();
        cur.insert(&mut pager, &mut freelist, b"k2", b"v2").unwrap();
        assert_eq!(cur.move_to(&mut pager, b"k1").unwrap(), 0);
        cur.delete(&mut pager, &mut freelist).unwrap();
        assert_eq!(cur.move_to(&mut pager, b"k1").unwrap(), 1);
    }

    #[test]
    fn split_grows_tree_across_many_inserts() {
        let (mut pager, _dir) = temp_pager();
        let mut freelist = 0u32;
        let root = create_tree(&mut pager, &mut freelist).unwrap();
        let mut cur = Cursor::new(root, Comparator::Blob);
        for i in 0..500u32 {
            let key = format!("key-{:06}", i);
            cur.insert(&mut pager, &mut freelist, key.as_bytes(), b"value").unwrap();
        }
        for i in 0..500u32 {
            let key = format!("key-{:06}", i);
            assert_eq!(cur.move_to(&mut pager, key.as_bytes()).unwrap(), 0);
        }
    }

    #[test]
    fn int_comparator_orders_by_signed_value() {
        let (mut pager, _dir) = temp_pager();
        let mut freelist = 0u32;
        let root = create_tree(&mut pager, &mut freelist).unwrap();
        let mut cur = Cursor::new(root, Comparator::Int);
        for v in [-5i64, 3, 0, -100, 42] {
            cur.insert(&mut pager, &mut freelist, &types::encode_rowid(v), b"x").unwrap();
        }
        cur.first(&mut pager).unwrap();
        let mut seen = Vec::new();
        while cur.is_valid() {
            seen.push(types::decode_rowid(&cur.key(&mut pager).unwrap()));
            cur.next(&mut pager).unwrap();
        }
        assert_eq!(seen, vec![-100, -5, 0, 3, 42]);
    }

    #[test]
    fn large_value_spills_to_overflow_chain() {
        let (mut pager, _dir) = temp_pager();
        let mut freelist = 0u32;
        let root = create_tree(&mut pager, &mut freelist).unwrap();
        let mut cur = Cursor::new(root, Comparator::Blob);
        let big = vec![0xABu8; 50_000];
        cur.insert(&mut pager, &mut freelist, b"huge", &big).unwrap();
        assert_eq!(cur.move_to(&mut pager, b"huge").unwrap(), 0);
        assert_eq!(cur.payload(&mut pager).unwrap(), big);
    }
}
