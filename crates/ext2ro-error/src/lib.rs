#![forbid(unsafe_code)]
//! Error types for ext2ro.
//!
//! # Error Taxonomy
//!
//! ext2ro uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ext2ro-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `Ext2Error` | `ext2ro-error` (this crate) | Errors seen by the FUSE adapter, the CLI and library callers |
//!
//! ## Mapping Policy: ParseError → Ext2Error
//!
//! `ext2ro-error` does not depend on `ext2ro-types` or `ext2ro-ondisk`.
//! The conversion from `ParseError` to `Ext2Error` lives in `ext2ro-core`,
//! which depends on both crates.
//!
//! | ParseError Variant | Ext2Error Variant |
//! |--------------------|-------------------|
//! | `InsufficientData` | `Truncated { offset, needed, actual }` |
//! | `InvalidMagic` | `Format(detail)` |
//! | `InvalidField` | `Format(detail)`, or `UnsupportedFeature` / `InvalidGeometry` during mount validation |
//! | `IntegerConversion` | `Format(detail)` |
//!
//! ## FUSE errno Mapping
//!
//! Every `Ext2Error` variant maps to exactly one POSIX errno via [`Ext2Error::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `Io` | raw OS error, else `EIO` | 5 |
//! | `Truncated` | `EIO` | 5 |
//! | `Corruption` | `EIO` | 5 |
//! | `Format` | `EINVAL` | 22 |
//! | `UnsupportedFeature` | `EOPNOTSUPP` | 95 |
//! | `InvalidGeometry` | `EINVAL` | 22 |
//! | `InvalidInode` | `ENOENT` | 2 |
//! | `OutOfRange` | `EFBIG` | 27 |
//! | `NotFound` | `ENOENT` | 2 |
//! | `NotDirectory` | `ENOTDIR` | 20 |
//! | `IsDirectory` | `EISDIR` | 21 |
//! | `NotSymlink` | `EINVAL` | 22 |
//! | `NameTooLong` | `ENAMETOOLONG` | 36 |
//! | `PermissionDenied` | `EACCES` | 13 |
//! | `ReadOnly` | `EROFS` | 30 |
//!
//! ## Design Constraints
//!
//! - Sparse holes are never errors. A zero block pointer is a valid
//!   outcome of block resolution and reads back as zeros.
//! - Mount-time failures (`Format`, `Truncated`, `UnsupportedFeature`,
//!   `InvalidGeometry`) produce no volume handle. Every other error is local
//!   to one operation and leaves the volume usable.
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for all ext2ro operations.
#[derive(Debug, Error)]
pub enum Ext2Error {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A positional read returned fewer bytes than requested.
    #[error("short read at byte {offset}: wanted {needed} bytes, got {actual}")]
    Truncated {
        offset: u64,
        needed: usize,
        actual: usize,
    },

    /// Metadata references something that cannot exist on this volume.
    ///
    /// Used for block pointers beyond `blocks_count` and similar
    /// inconsistencies found while reading live metadata.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format: bad magic, malformed superblock, or an
    /// undecodable directory entry.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// The image sets an incompatible feature this driver cannot read.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Superblock geometry is numerically impossible.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The inode number maps outside every block group.
    #[error("invalid inode number {0}")]
    InvalidInode(u32),

    /// Logical block index beyond what triple indirection can address.
    #[error("logical block {logical_block} is beyond the addressable range")]
    OutOfRange { logical_block: u64 },

    /// Path component or directory entry absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A directory operation was applied to something else.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// readlink on an inode that is not a symbolic link.
    #[error("not a symbolic link")]
    NotSymlink,

    /// Filename exceeds the 255-byte directory entry limit.
    #[error("name too long")]
    NameTooLong,

    /// Open with write access was requested.
    #[error("permission denied")]
    PermissionDenied,

    /// A mutation was attempted on the read-only mount.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl Ext2Error {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    ///
    /// - `InvalidInode` → `ENOENT`: the kernel may hand back stale numbers;
    ///   an inode that cannot exist is reported as absent.
    /// - `OutOfRange` → `EFBIG`: the offset cannot be mapped by this format.
    /// - `NotSymlink` → `EINVAL`: what readlink(2) returns for non-links.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Truncated { .. } | Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) | Self::NotSymlink => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::InvalidInode(_) | Self::NotFound(_) => libc::ENOENT,
            Self::OutOfRange { .. } => libc::EFBIG,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::PermissionDenied => libc::EACCES,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// True for errors raised because a name or inode does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidInode(_))
    }
}

/// Convenience alias used throughout ext2ro.
pub type Result<T> = std::result::Result<T, Ext2Error>;
