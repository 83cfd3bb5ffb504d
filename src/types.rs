//! Core numeric type aliases shared across the storage layer.

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number. Page 1 is always the database header page.
pub type Pgno = u32;

/// Signed 64-bit key used by `INT`-comparator trees (the catalog tree).
pub type RowId = i64;

/// Database file offset.
pub type DbOffset = i64;

/// Byte count.
pub type ByteCount = usize;

/// Transaction/savepoint generation counter.
pub type TxnId = u32;
