//! Storage layer: B-tree, pager, WAL, and pointer-map/auto-vacuum.

pub mod btree;
pub mod pager;
pub mod ptrmap;
pub mod wal;
