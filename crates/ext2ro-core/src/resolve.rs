use crate::Volume;
use ext2ro_error::{Ext2Error, Result};
use ext2ro_ondisk::{BlockMapPath, Ext2Inode, locate_block};
use ext2ro_types::{BlockNumber, LogicalBlock};
use tracing::trace;

impl Volume {
    /// Map a file's logical block to the physical block holding it.
    ///
    /// Walks the inode's direct pointers and up to three levels of indirect
    /// blocks, reading one 4-byte pointer per level. A zero pointer at any
    /// level is a sparse hole and resolves to [`BlockNumber::SPARSE`]; it is
    /// not an error. Indices beyond triple indirection are `OutOfRange`.
    pub fn resolve_block(&self, inode: &Ext2Inode, logical: LogicalBlock) -> Result<BlockNumber> {
        let fanout = self.block_size_typed().pointers_per_block();
        let Some(path) = locate_block(fanout, logical) else {
            return Err(Ext2Error::OutOfRange {
                logical_block: logical.0,
            });
        };

        let path = match path {
            BlockMapPath::Direct(slot) => return Ok(inode.pointer(slot)),
            BlockMapPath::Indirect(path) => path,
        };

        let mut block = inode.pointer(path.root_slot());
        for (level, &slot) in path.slots().iter().enumerate() {
            if block.is_sparse() {
                trace!(
                    target: "ext2ro::core",
                    logical_block = logical.0,
                    depth = path.depth(),
                    level,
                    "sparse hole in indirect tree"
                );
                return Ok(BlockNumber::SPARSE);
            }
            block = self.read_pointer(block, slot)?;
        }
        Ok(block)
    }

    /// Read slot `slot` of indirect block `block`.
    fn read_pointer(&self, block: BlockNumber, slot: u32) -> Result<BlockNumber> {
        let mut raw = [0_u8; 4];
        self.read_block_range(block, slot * 4, &mut raw)?;
        Ok(BlockNumber(u32::from_le_bytes(raw)))
    }
}
