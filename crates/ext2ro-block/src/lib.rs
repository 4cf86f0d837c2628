#![forbid(unsafe_code)]
//! Byte devices for the read path.
//!
//! Every read names its absolute offset (pread semantics), so a device is
//! shared across threads without a seek position or a lock.

use ext2ro_error::{Ext2Error, Result};
use ext2ro_types::{ByteOffset, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// Byte-addressed device for fixed-offset reads.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes transferred, which is smaller than
    /// `buf.len()` only when the device ends first.
    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// A short transfer is reported as [`Ext2Error::Truncated`].
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let actual = self.read_at(offset, buf)?;
        if actual < buf.len() {
            return Err(Ext2Error::Truncated {
                offset: offset.0,
                needed: buf.len(),
                actual,
            });
        }
        Ok(())
    }
}

/// File-backed byte device using `pread` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. The file is opened read-only.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        debug!(
            target: "ext2ro::block",
            path = %path.as_ref().display(),
            len,
            "opened backing file"
        );
        Ok(Self { file, len })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0_usize;
        while filled < buf.len() {
            let pos = offset
                .checked_add(filled as u64)
                .ok_or_else(|| Ext2Error::Format("read range overflows u64".to_owned()))?;
            match self.file.read_at(&mut buf[filled..], pos.0) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }
}

/// A device over an image already held in memory.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Vec<u8>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        let Ok(start) = usize::try_from(offset.0) else {
            return Ok(0);
        };
        let Some(available) = self.bytes.get(start..) else {
            return Ok(0);
        };
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}

/// Read the 1024-byte superblock region at byte 1024.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<Vec<u8>> {
    let mut region = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
    dev.read_exact_at(ByteOffset(EXT2_SUPERBLOCK_OFFSET as u64), &mut region)?;
    Ok(region)
}
