use crate::{mount_parse_error, parse_to_ext2_error};
use ext2ro_block::{ByteDevice, FileByteDevice, read_superblock_region};
use ext2ro_error::{Ext2Error, Result};
use ext2ro_ondisk::{Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use ext2ro_types::{BlockNumber, BlockSize, ByteOffset, EXT2_GROUP_DESC_SIZE, GroupNumber, InodeNumber};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Options controlling how a volume is opened.
///
/// Magic and block size are always checked. Validation of geometry and
/// incompatible features is on by default; turn it off only to inspect a
/// damaged image.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Skip geometry and feature validation.
    pub skip_validation: bool,
}

/// Geometry derived from the superblock once at open time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Geometry {
    pub block_size: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub groups_count: u32,
    /// Volume size in bytes (`blocks_count * block_size`).
    pub volume_size: u64,
    /// Directory entries carry a file type byte.
    pub has_filetype: bool,
}

/// An open ext2 volume.
///
/// Holds the device and the immutable metadata loaded at open. All read
/// operations borrow the volume shared; none of them mutate it.
pub struct Volume {
    sb: Ext2Superblock,
    groups: Vec<Ext2GroupDesc>,
    geometry: Ext2Geometry,
    block_size: BlockSize,
    dev: Box<dyn ByteDevice>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geometry)
            .field("volume_name", &self.sb.volume_name)
            .field("dev_len", &self.dev.len_bytes())
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Open the image at `path` read-only with validation enabled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    /// Open a volume over an already-opened device.
    ///
    /// Reads the superblock at byte 1024 and the group descriptor table in
    /// the block that follows it. Any failure here yields no volume.
    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let region = read_superblock_region(&*dev)?;
        let sb = Ext2Superblock::parse_superblock_region(&region)
            .map_err(|e| mount_parse_error(&e))?;

        if options.skip_validation {
            debug!(target: "ext2ro::core", "superblock validation skipped");
        } else {
            sb.validate_geometry().map_err(|e| mount_parse_error(&e))?;
            sb.validate_features().map_err(|_| {
                Ext2Error::UnsupportedFeature(sb.feature_incompat.unsupported().to_string())
            })?;
        }

        let block_size = BlockSize::new(sb.block_size).map_err(|e| mount_parse_error(&e))?;
        let groups_count = sb.groups_count();
        if groups_count == 0 {
            return Err(Ext2Error::InvalidGeometry(
                "volume has no block groups".to_owned(),
            ));
        }
        // Checked even with validation skipped: inode lookup divides by it.
        if sb.inodes_per_group == 0 {
            return Err(Ext2Error::InvalidGeometry(
                "s_inodes_per_group: cannot be zero".to_owned(),
            ));
        }

        let table_len = usize::try_from(groups_count)
            .ok()
            .and_then(|groups| groups.checked_mul(EXT2_GROUP_DESC_SIZE))
            .ok_or_else(|| {
                Ext2Error::InvalidGeometry(format!("{groups_count} groups overflow the table size"))
            })?;
        let table_offset = sb.group_desc_table_offset();
        let dev_len = dev.len_bytes();
        let available = dev_len.saturating_sub(table_offset);
        if (table_len as u64) > available {
            return Err(Ext2Error::Truncated {
                offset: table_offset,
                needed: table_len,
                actual: usize::try_from(available).unwrap_or(usize::MAX),
            });
        }
        let mut table = vec![0_u8; table_len];
        dev.read_exact_at(ByteOffset(table_offset), &mut table)?;
        let groups =
            Ext2GroupDesc::parse_table(&table, groups_count).map_err(|e| parse_to_ext2_error(&e))?;

        let geometry = Ext2Geometry {
            block_size: sb.block_size,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size,
            groups_count,
            volume_size: sb.volume_size(),
            has_filetype: sb.has_filetype(),
        };

        info!(
            target: "ext2ro::core",
            block_size = geometry.block_size,
            groups = geometry.groups_count,
            volume_size = geometry.volume_size,
            volume_name = %sb.volume_name,
            "opened ext2 volume"
        );

        Ok(Self {
            sb,
            groups,
            geometry,
            block_size,
            dev,
        })
    }

    /// Release the backing device. Nothing is flushed; the volume is read-only.
    pub fn close(self) {
        debug!(
            target: "ext2ro::core",
            volume_name = %self.sb.volume_name,
            "closed ext2 volume"
        );
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    #[must_use]
    pub fn geometry(&self) -> &Ext2Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn group_descriptors(&self) -> &[Ext2GroupDesc] {
        &self.groups
    }

    #[must_use]
    pub fn group_desc(&self, group: GroupNumber) -> Option<&Ext2GroupDesc> {
        self.groups.get(group.0 as usize)
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub(crate) fn block_size_typed(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn device(&self) -> &dyn ByteDevice {
        &*self.dev
    }

    // ── Block accessor ────────────────────────────────────────────────

    /// Read `buf.len()` bytes starting `in_block_offset` bytes into `block`.
    ///
    /// Block 0 is the sparse marker: `buf` is zero-filled and no I/O is
    /// issued. A block past the end of the volume is `Corruption`; a short
    /// device read is `Truncated`. Returns the number of bytes produced.
    pub fn read_block_range(
        &self,
        block: BlockNumber,
        in_block_offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        if block.is_sparse() {
            buf.fill(0);
            return Ok(buf.len());
        }
        if block.0 >= self.geometry.blocks_count {
            return Err(Ext2Error::Corruption {
                block: u64::from(block.0),
                detail: format!(
                    "block pointer beyond blocks_count {}",
                    self.geometry.blocks_count
                ),
            });
        }
        let offset = ByteOffset(self.block_size.block_to_byte(block))
            .checked_add(u64::from(in_block_offset))
            .ok_or_else(|| Ext2Error::Corruption {
                block: u64::from(block.0),
                detail: "block offset overflow".to_owned(),
            })?;
        self.dev.read_exact_at(offset, buf)?;
        Ok(buf.len())
    }

    /// Read one whole block.
    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; self.geometry.block_size as usize];
        self.read_block_range(block, 0, &mut buf)?;
        Ok(buf)
    }

    // ── Inode reader ──────────────────────────────────────────────────

    /// Read and decode inode `ino`.
    ///
    /// Inode 0, numbers above `inodes_count` and numbers whose group has no
    /// descriptor are `InvalidInode`.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        if ino.0 == 0 || ino.0 > self.geometry.inodes_count {
            return Err(Ext2Error::InvalidInode(ino.0));
        }
        let (group, offset_in_table) = self.sb.inode_table_offset(ino);
        let gd = self
            .group_desc(group)
            .ok_or(Ext2Error::InvalidInode(ino.0))?;

        if gd.inode_table.is_sparse() || gd.inode_table.0 >= self.geometry.blocks_count {
            return Err(Ext2Error::Corruption {
                block: u64::from(gd.inode_table.0),
                detail: format!("group {group} inode table outside the volume"),
            });
        }
        let offset = ByteOffset(self.block_size.block_to_byte(gd.inode_table))
            .checked_add(offset_in_table)
            .ok_or_else(|| Ext2Error::Corruption {
                block: u64::from(gd.inode_table.0),
                detail: "inode offset overflow".to_owned(),
            })?;

        let mut buf = vec![0_u8; usize::from(self.geometry.inode_size)];
        self.dev.read_exact_at(offset, &mut buf)?;
        Ext2Inode::parse_from_bytes(&buf).map_err(|e| parse_to_ext2_error(&e))
    }
}
