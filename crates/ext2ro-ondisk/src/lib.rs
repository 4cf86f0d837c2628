#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate: no I/O, no side effects. Parses byte slices into
//! typed Rust structures representing the ext2 superblock, group
//! descriptors, inodes and directory entries, and maps logical file blocks
//! onto the direct/indirect pointer tree.

pub mod block_map;
pub mod ext2;

pub use block_map::{BlockMapPath, IndirectPath, addressable_blocks, locate_block};
pub use ext2::{
    Ext2CompatFeatures, Ext2DirEntry, Ext2DirEntryRef, Ext2FileType, Ext2GroupDesc,
    Ext2IncompatFeatures, Ext2Inode, Ext2RoCompatFeatures, Ext2Superblock, parse_dir_entry,
};
