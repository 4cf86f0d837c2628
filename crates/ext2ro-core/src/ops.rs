//! The interface mount adapters and tools consume.

use crate::Volume;
use ext2ro_error::{Ext2Error, Result};
use ext2ro_ondisk::{Ext2FileType, Ext2Inode};
use ext2ro_types::{EXT2_NAME_LEN, InodeNumber};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::time::SystemTime;

/// Upper bound on the entries one [`FsOps::readdir`] call returns.
pub const READDIR_BATCH: usize = 128;

/// File type as seen by the VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// Inode attributes returned by [`FsOps::getattr`] and [`FsOps::lookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub size: u64,
    /// 512-byte sectors allocated.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    /// Lower 12 bits of the mode.
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device number for character and block devices, 0 otherwise.
    pub rdev: u32,
    /// Preferred I/O size (the volume block size).
    pub blksize: u32,
}

/// One name returned by [`FsOps::readdir`].
///
/// `offset` is the 1-based position of the entry; passing it back to
/// `readdir` resumes after this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub offset: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Volume-wide counters for `statfs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    /// Free blocks minus the root reserve.
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Read-only VFS operations.
///
/// The FUSE adapter and the CLI talk to a volume only through this trait.
/// Inode numbers are ext2 numbers (root = 2); adapters translate their own
/// numbering at the boundary. Errors map to errnos via
/// [`Ext2Error::to_errno`].
pub trait FsOps: Send + Sync {
    /// Attributes of inode `ino`.
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    /// Attributes of the entry `name` in directory `parent`.
    ///
    /// `NotDirectory` if `parent` is not a directory, `NotFound` if the
    /// name is absent, `NameTooLong` above 255 bytes.
    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    /// Entries of directory `ino` after cookie `offset` (0 starts over).
    ///
    /// Returns at most [`READDIR_BATCH`] entries; an empty result marks the
    /// end of the directory. Resume from the last entry's `offset`.
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    /// Up to `size` bytes at `offset`; fewer at end of file.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Symbolic link target.
    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>>;

    /// Check that `ino` can be opened as a file.
    ///
    /// Directories are `IsDirectory`; write access is `PermissionDenied`.
    fn open(&self, ino: InodeNumber, write: bool) -> Result<()>;

    /// Check that `ino` can be opened as a directory.
    fn opendir(&self, ino: InodeNumber) -> Result<()>;

    /// Block and inode totals.
    fn statfs(&self) -> Result<VolumeStats>;
}

impl Volume {
    /// VFS attributes for an inode already read.
    #[must_use]
    pub fn inode_attr(&self, ino: InodeNumber, inode: &Ext2Inode) -> InodeAttr {
        InodeAttr {
            ino,
            size: inode.size,
            blocks: u64::from(inode.blocks),
            atime: inode.atime_system_time(),
            mtime: inode.mtime_system_time(),
            ctime: inode.ctime_system_time(),
            kind: inode_file_type(inode),
            perm: inode.permission_bits(),
            nlink: u32::from(inode.links_count),
            uid: inode.uid,
            gid: inode.gid,
            rdev: inode.rdev(),
            blksize: self.block_size(),
        }
    }

    /// Superblock counters.
    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        let sb = self.superblock();
        VolumeStats {
            block_size: sb.block_size,
            blocks: u64::from(sb.blocks_count),
            blocks_free: u64::from(sb.free_blocks_count),
            blocks_available: u64::from(
                sb.free_blocks_count
                    .saturating_sub(sb.reserved_blocks_count),
            ),
            files: u64::from(sb.inodes_count),
            files_free: u64::from(sb.free_inodes_count),
            name_max: EXT2_NAME_LEN as u32,
        }
    }

    fn entry_kind(&self, ino: InodeNumber, file_type: Ext2FileType) -> Result<FileType> {
        match file_type {
            Ext2FileType::RegFile => Ok(FileType::RegularFile),
            Ext2FileType::Dir => Ok(FileType::Directory),
            Ext2FileType::Symlink => Ok(FileType::Symlink),
            Ext2FileType::Blkdev => Ok(FileType::BlockDevice),
            Ext2FileType::Chrdev => Ok(FileType::CharDevice),
            Ext2FileType::Fifo => Ok(FileType::Fifo),
            Ext2FileType::Sock => Ok(FileType::Socket),
            // No FILETYPE feature: the inode is the only source.
            Ext2FileType::Unknown => Ok(inode_file_type(&self.read_inode(ino)?)),
        }
    }
}

/// Map the inode mode to a VFS `FileType`.
fn inode_file_type(inode: &Ext2Inode) -> FileType {
    if inode.is_dir() {
        FileType::Directory
    } else if inode.is_symlink() {
        FileType::Symlink
    } else if inode.is_chrdev() {
        FileType::CharDevice
    } else if inode.is_blkdev() {
        FileType::BlockDevice
    } else if inode.is_fifo() {
        FileType::Fifo
    } else if inode.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

impl FsOps for Volume {
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let inode = self.read_inode(ino)?;
        Ok(self.inode_attr(ino, &inode))
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let name = name.as_encoded_bytes();
        if name.len() > EXT2_NAME_LEN {
            return Err(Ext2Error::NameTooLong);
        }
        let parent_inode = self.read_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err(Ext2Error::NotDirectory);
        }
        let entry = self.find_named_entry(&parent_inode, name)?;
        self.getattr(entry.inode)
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let inode = self.read_inode(ino)?;
        let mut out = Vec::new();
        for (idx, entry) in self.entries(&inode)?.enumerate() {
            let entry = entry?;
            let position = idx as u64 + 1;
            if position <= offset {
                continue;
            }
            out.push(DirEntry {
                ino: entry.inode,
                offset: position,
                kind: self.entry_kind(entry.inode, entry.file_type)?,
                name: entry.name,
            });
            if out.len() == READDIR_BATCH {
                break;
            }
        }
        Ok(out)
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let inode = self.read_inode(ino)?;
        if inode.is_dir() {
            return Err(Ext2Error::IsDirectory);
        }
        if inode.is_fast_symlink(self.block_size()) {
            let target = self.read_symlink(&inode)?;
            let start = usize::try_from(offset).map_or(target.len(), |o| o.min(target.len()));
            let end = start.saturating_add(size as usize).min(target.len());
            return Ok(target[start..end].to_vec());
        }
        if !inode.is_regular() && !inode.is_symlink() {
            return Ok(Vec::new());
        }
        self.read_file(&inode, offset, size as usize)
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let inode = self.read_inode(ino)?;
        self.read_symlink(&inode)
    }

    fn open(&self, ino: InodeNumber, write: bool) -> Result<()> {
        let inode = self.read_inode(ino)?;
        if inode.is_dir() {
            return Err(Ext2Error::IsDirectory);
        }
        if write {
            return Err(Ext2Error::PermissionDenied);
        }
        Ok(())
    }

    fn opendir(&self, ino: InodeNumber) -> Result<()> {
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(Ext2Error::NotDirectory);
        }
        Ok(())
    }

    fn statfs(&self) -> Result<VolumeStats> {
        Ok(self.stats())
    }
}
