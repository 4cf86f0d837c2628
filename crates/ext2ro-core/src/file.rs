use crate::Volume;
use ext2ro_error::{Ext2Error, Result};
use ext2ro_ondisk::Ext2Inode;

impl Volume {
    /// Read from one block of a file without crossing into the next.
    ///
    /// `buf` is clamped to the bytes left in the block that holds
    /// `byte_offset`; a sparse block zero-fills. Returns the byte count.
    /// The inode size is not consulted here; see [`Self::read_file_into`].
    pub fn read_block_span(
        &self,
        inode: &Ext2Inode,
        byte_offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let bs = self.block_size_typed();
        let (logical, within) = bs.split_offset(byte_offset);
        let remaining = (bs.get() - within) as usize;
        let len = buf.len().min(remaining);

        let physical = self.resolve_block(inode, logical)?;
        self.read_block_range(physical, within, &mut buf[..len])
    }

    /// Read file content at `offset` into `buf`, stopping at end of file.
    ///
    /// Returns the number of bytes read: `0` when `offset` is at or past the
    /// end, fewer than `buf.len()` when the request crosses it.
    pub fn read_file_into(&self, inode: &Ext2Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= inode.size {
            return Ok(0);
        }
        let available = inode.size - offset;
        let to_read = usize::try_from(available).map_or(buf.len(), |n| n.min(buf.len()));

        let mut done = 0_usize;
        while done < to_read {
            let n = self.read_block_span(inode, offset + done as u64, &mut buf[done..to_read])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Read up to `count` bytes of file content starting at `offset`.
    pub fn read_file(&self, inode: &Ext2Inode, offset: u64, count: usize) -> Result<Vec<u8>> {
        let clamped = usize::try_from(inode.size.saturating_sub(offset)).map_or(count, |n| n.min(count));
        let mut buf = vec![0_u8; clamped];
        let n = self.read_file_into(inode, offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Target of a symbolic link.
    ///
    /// Short targets are stored inline in `i_block`; longer ones are the
    /// file content.
    pub fn read_symlink(&self, inode: &Ext2Inode) -> Result<Vec<u8>> {
        if !inode.is_symlink() {
            return Err(Ext2Error::NotSymlink);
        }
        if let Some(target) = inode.fast_symlink_target(self.block_size()) {
            return Ok(target);
        }
        let len = usize::try_from(inode.size).map_err(|_| Ext2Error::Corruption {
            block: 0,
            detail: "symlink size overflow".to_owned(),
        })?;
        self.read_file(inode, 0, len)
    }
}
