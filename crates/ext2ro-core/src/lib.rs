#![forbid(unsafe_code)]
//! Read path for ext2 volumes.
//!
//! [`Volume`] owns the backing device together with the superblock and group
//! descriptor table loaded at open time. Every other operation is a method
//! on `&Volume` that computes absolute offsets and issues positional reads,
//! so one volume can serve any number of threads without locking.
//!
//! | Module | Operations |
//! |--------|------------|
//! | `volume` | open, close, block accessor, inode reader |
//! | `resolve` | logical → physical block through the indirect tree |
//! | `file` | byte-range reads, symlink targets |
//! | `dir` | directory iteration and name lookup |
//! | `path` | absolute path resolution |
//! | `ops` | [`FsOps`], the interface the FUSE adapter and CLI consume |

mod dir;
mod file;
mod ops;
mod path;
mod resolve;
mod volume;

pub use dir::DirEntries;
pub use ops::{DirEntry, FileType, FsOps, InodeAttr, READDIR_BATCH, VolumeStats};
pub use volume::{Ext2Geometry, OpenOptions, Volume};

pub use ext2ro_error::{Ext2Error, Result};
pub use ext2ro_ondisk::{Ext2DirEntry, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock};
pub use ext2ro_types::{BlockNumber, GroupNumber, InodeNumber, LogicalBlock};

use ext2ro_types::ParseError;

/// Convert `ParseError` to `Ext2Error` for runtime operations (not mount-time).
fn parse_to_ext2_error(e: &ParseError) -> Ext2Error {
    match e {
        ParseError::InsufficientData {
            needed,
            offset,
            actual,
        } => Ext2Error::Truncated {
            offset: *offset as u64,
            needed: *needed,
            actual: *actual,
        },
        ParseError::InvalidMagic { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => Ext2Error::Format(e.to_string()),
    }
}

/// Convert `ParseError` raised while opening a volume.
///
/// Geometry fields become `InvalidGeometry` so callers can tell an
/// impossible superblock apart from one that is not ext2 at all.
fn mount_parse_error(e: &ParseError) -> Ext2Error {
    match e {
        ParseError::InvalidField { field, reason } => {
            if field.contains("feature") {
                Ext2Error::UnsupportedFeature(format!("{field}: {reason}"))
            } else if field.contains("block_size")
                || field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_data_block")
                || field.contains("inodes_count")
            {
                Ext2Error::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                Ext2Error::Format(e.to_string())
            }
        }
        _ => parse_to_ext2_error(e),
    }
}
