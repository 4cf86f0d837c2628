use crate::Volume;
use ext2ro_error::{Ext2Error, Result};
use ext2ro_ondisk::{Ext2DirEntry, Ext2Inode, parse_dir_entry};
use ext2ro_types::{BlockNumber, InodeNumber, LogicalBlock};
use std::ops::ControlFlow;
use tracing::debug;

/// Streaming iterator over the live entries of a directory.
///
/// Reads one directory block at a time and yields entries in on-disk
/// order, skipping unused slots. Iteration is bounded by the directory's
/// `i_size`; a malformed record ends the iteration with a `Format` error.
pub struct DirEntries<'a> {
    vol: &'a Volume,
    dir: &'a Ext2Inode,
    next_logical: u64,
    block_count: u64,
    block: Vec<u8>,
    block_no: BlockNumber,
    valid_len: usize,
    offset: usize,
    done: bool,
}

impl<'a> DirEntries<'a> {
    fn new(vol: &'a Volume, dir: &'a Ext2Inode) -> Self {
        Self {
            vol,
            dir,
            next_logical: 0,
            block_count: dir.size.div_ceil(u64::from(vol.block_size())),
            block: Vec::new(),
            block_no: BlockNumber::SPARSE,
            valid_len: 0,
            offset: 0,
            done: false,
        }
    }

    /// Load the next directory block. Holes leave `valid_len` at zero.
    fn load_next_block(&mut self) -> Result<()> {
        let bs = u64::from(self.vol.block_size());
        let logical = self.next_logical;
        self.next_logical += 1;
        self.offset = 0;
        self.valid_len = 0;

        let physical = self.vol.resolve_block(self.dir, LogicalBlock(logical))?;
        self.block_no = physical;
        if physical.is_sparse() {
            return Ok(());
        }
        self.block = self.vol.read_block(physical)?;
        let remaining = self.dir.size - logical * bs;
        self.valid_len = usize::try_from(remaining.min(bs)).unwrap_or(self.block.len());
        Ok(())
    }

    fn decode_error(&self, detail: &dyn std::fmt::Display) -> Ext2Error {
        Ext2Error::Format(format!(
            "directory block {} offset {}: {detail}",
            self.block_no, self.offset
        ))
    }
}

impl Iterator for DirEntries<'_> {
    type Item = Result<Ext2DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.offset >= self.valid_len {
                if self.next_logical >= self.block_count {
                    self.done = true;
                    return None;
                }
                if let Err(e) = self.load_next_block() {
                    self.done = true;
                    return Some(Err(e));
                }
                continue;
            }

            let parsed = parse_dir_entry(
                &self.block[..self.valid_len],
                self.offset,
                self.vol.block_size(),
                self.vol.geometry().has_filetype,
            );
            match parsed {
                Ok(entry) => {
                    self.offset += entry.rec_len as usize;
                    if entry.is_unused() {
                        continue;
                    }
                    return Some(Ok(entry.to_owned()));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(self.decode_error(&e)));
                }
            }
        }
    }
}

impl Volume {
    /// Iterate the live entries of directory `dir`.
    pub fn entries<'a>(&'a self, dir: &'a Ext2Inode) -> Result<DirEntries<'a>> {
        if !dir.is_dir() {
            return Err(Ext2Error::NotDirectory);
        }
        Ok(DirEntries::new(self, dir))
    }

    /// Call `visit(name, inode)` for each entry until it returns `Break`.
    ///
    /// Returns the entry that stopped the walk, or `None` when the
    /// directory was exhausted or `dir` is not a directory at all.
    pub fn for_each_entry<F>(&self, dir: &Ext2Inode, mut visit: F) -> Result<Option<Ext2DirEntry>>
    where
        F: FnMut(&[u8], InodeNumber) -> ControlFlow<()>,
    {
        if !dir.is_dir() {
            debug!(target: "ext2ro::core", mode = dir.mode, "directory walk on a non-directory");
            return Ok(None);
        }
        for entry in DirEntries::new(self, dir) {
            let entry = entry?;
            if visit(&entry.name, entry.inode).is_break() {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Find the entry named exactly `name` (byte comparison, case-sensitive).
    pub fn find_named_entry(&self, dir: &Ext2Inode, name: &[u8]) -> Result<Ext2DirEntry> {
        self.for_each_entry(dir, |candidate, _| {
            if candidate == name {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?
        .ok_or_else(|| Ext2Error::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// All live entries of `dir`, in on-disk order.
    pub fn read_dir(&self, dir: &Ext2Inode) -> Result<Vec<Ext2DirEntry>> {
        self.entries(dir)?.collect()
    }
}
