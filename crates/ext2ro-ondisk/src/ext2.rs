#![forbid(unsafe_code)]

use ext2ro_types::{
    BlockNumber, EXT2_DYNAMIC_REV, EXT2_FAST_SYMLINK_MAX, EXT2_GOOD_OLD_FIRST_INO,
    EXT2_GOOD_OLD_INODE_SIZE, EXT2_GOOD_OLD_REV, EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS,
    EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber,
    ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
    ensure_slice, ext2_block_size_from_log, read_fixed, read_le_u16, read_le_u32,
    trim_nul_padded,
};
use serde::{Deserialize, Serialize};

// ── ext2 feature flags ─────────────────────────────────────────────────────

/// Compatible feature flags (`s_feature_compat`).
///
/// These are advisory; unknown bits are safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2CompatFeatures(pub u32);

impl Ext2CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const IMAGIC_INODES: Self = Self(0x0002);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "DIR_PREALLOC"),
        (0x0002, "IMAGIC_INODES"),
        (0x0004, "HAS_JOURNAL"),
        (0x0008, "EXT_ATTR"),
        (0x0010, "RESIZE_INODE"),
        (0x0020, "DIR_INDEX"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Return names of all set flags.
    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext2CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Incompatible feature flags (`s_feature_incompat`).
///
/// A reader that does not understand a set bit must refuse the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2IncompatFeatures(pub u32);

impl Ext2IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const MMP: Self = Self(0x0100);
    pub const FLEX_BG: Self = Self(0x0200);
    pub const EA_INODE: Self = Self(0x0400);
    pub const DIRDATA: Self = Self(0x1000);
    pub const CSUM_SEED: Self = Self(0x2000);
    pub const LARGEDIR: Self = Self(0x4000);
    pub const INLINE_DATA: Self = Self(0x8000);
    pub const ENCRYPT: Self = Self(0x1_0000);
    pub const CASEFOLD: Self = Self(0x2_0000);

    /// Bits the read path understands.
    pub const SUPPORTED: Self = Self::FILETYPE;

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "COMPRESSION"),
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
        (0x0040, "EXTENTS"),
        (0x0080, "64BIT"),
        (0x0100, "MMP"),
        (0x0200, "FLEX_BG"),
        (0x0400, "EA_INODE"),
        (0x1000, "DIRDATA"),
        (0x2000, "CSUM_SEED"),
        (0x4000, "LARGEDIR"),
        (0x8000, "INLINE_DATA"),
        (0x1_0000, "ENCRYPT"),
        (0x2_0000, "CASEFOLD"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Return names of all set flags.
    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    /// The set bits outside [`Self::SUPPORTED`].
    #[must_use]
    pub fn unsupported(self) -> Self {
        Self(self.0 & !Self::SUPPORTED.0)
    }
}

impl std::fmt::Display for Ext2IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Read-only compatible feature flags (`s_feature_ro_compat`).
///
/// These only constrain writers, so the read path ignores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2RoCompatFeatures(pub u32);

impl Ext2RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);
    pub const HUGE_FILE: Self = Self(0x0008);
    pub const GDT_CSUM: Self = Self(0x0010);
    pub const DIR_NLINK: Self = Self(0x0020);
    pub const EXTRA_ISIZE: Self = Self(0x0040);
    pub const METADATA_CSUM: Self = Self(0x0400);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0002, "LARGE_FILE"),
        (0x0004, "BTREE_DIR"),
        (0x0008, "HUGE_FILE"),
        (0x0010, "GDT_CSUM"),
        (0x0020, "DIR_NLINK"),
        (0x0040, "EXTRA_ISIZE"),
        (0x0400, "METADATA_CSUM"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Return names of all set flags.
    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for Ext2RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

// ── Shared flag helpers ─────────────────────────────────────────────────────

/// Collect names of all set bits from a `(bit, name)` table.
fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Format a bitmask as a pipe-separated list of flag names.
///
/// Example output: `FILETYPE|SPARSE_SUPER` or `(none)` when zero.
/// Unknown bits are appended as hex, e.g. `FILETYPE|0x80000000`.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub log_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,
    pub block_group_nr: u16,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: Ext2CompatFeatures,
    pub feature_incompat: Ext2IncompatFeatures,
    pub feature_ro_compat: Ext2RoCompatFeatures,

    // ── State & timestamps ───────────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub checkinterval: u32,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from a 1024-byte superblock region.
    ///
    /// Checks length, magic and block size. Geometry and feature checks are
    /// left to [`Self::validate`] so inspection tools can still decode
    /// volumes this driver refuses to read.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext2_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };
        if block_size > 65536 {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "block size above 64K",
            });
        }

        let rev_level = read_le_u32(region, 0x4C)?;
        // Revision 0 predates the dynamic fields; they read as zero there.
        let (inode_size, first_ino) = if rev_level == EXT2_GOOD_OLD_REV {
            (EXT2_GOOD_OLD_INODE_SIZE, EXT2_GOOD_OLD_FIRST_INO)
        } else {
            (read_le_u16(region, 0x58)?, read_le_u32(region, 0x54)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            log_frag_size: read_le_u32(region, 0x1C)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,
            block_group_nr: read_le_u16(region, 0x5A)?,
            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            feature_compat: Ext2CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: Ext2IncompatFeatures(read_le_u32(region, 0x60)?),
            feature_ro_compat: Ext2RoCompatFeatures(read_le_u32(region, 0x64)?),

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,
        })
    }

    #[must_use]
    pub fn has_incompat(&self, mask: Ext2IncompatFeatures) -> bool {
        self.feature_incompat.contains(mask)
    }

    /// Whether directory entries carry a file type byte.
    #[must_use]
    pub fn has_filetype(&self) -> bool {
        self.has_incompat(Ext2IncompatFeatures::FILETYPE)
    }

    /// Number of block groups: `ceil(blocks_count / blocks_per_group)`.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count.div_ceil(self.blocks_per_group)
    }

    /// Size of the volume in bytes.
    #[must_use]
    pub fn volume_size(&self) -> u64 {
        u64::from(self.blocks_count) * u64::from(self.block_size)
    }

    /// Validate basic geometry: group sizes, inode size, counts.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        let bitmap_bits = self.block_size.saturating_mul(8);
        if self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }

        if self.rev_level >= EXT2_DYNAMIC_REV {
            if self.inode_size < EXT2_GOOD_OLD_INODE_SIZE {
                return Err(ParseError::InvalidField {
                    field: "s_inode_size",
                    reason: "must be >= 128",
                });
            }
            if !self.inode_size.is_power_of_two() {
                return Err(ParseError::InvalidField {
                    field: "s_inode_size",
                    reason: "must be a power of two",
                });
            }
            if u32::from(self.inode_size) > self.block_size {
                return Err(ParseError::InvalidField {
                    field: "s_inode_size",
                    reason: "inode_size exceeds block_size",
                });
            }
        }

        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }

        let max_inodes = u64::from(self.groups_count()) * u64::from(self.inodes_per_group);
        if u64::from(self.inodes_count) > max_inodes {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inodes_count exceeds groups * inodes_per_group",
            });
        }

        Ok(())
    }

    /// Reject incompatible features the read path does not understand.
    pub fn validate_features(&self) -> Result<(), ParseError> {
        if self.feature_incompat.unsupported().0 != 0 {
            return Err(ParseError::InvalidField {
                field: "feature_incompat",
                reason: "unsupported incompatible feature flags present",
            });
        }
        Ok(())
    }

    /// Block that holds the superblock (1 for 1K blocks, 0 otherwise).
    #[must_use]
    pub fn superblock_block(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)] // 1024 fits in u32
        let offset = EXT2_SUPERBLOCK_OFFSET as u32;
        offset / self.block_size
    }

    /// Byte offset of the group descriptor table: the block after the superblock's.
    #[must_use]
    pub fn group_desc_table_offset(&self) -> u64 {
        (u64::from(self.superblock_block()) + 1) * u64::from(self.block_size)
    }

    /// Locate an inode: `(group, byte offset inside that group's inode table)`.
    #[must_use]
    pub fn inode_table_offset(&self, ino: InodeNumber) -> (GroupNumber, u64) {
        let group = ext2ro_types::inode_to_group(ino, self.inodes_per_group);
        let index = ext2ro_types::inode_index_in_group(ino, self.inodes_per_group);
        (group, u64::from(index) * u64::from(self.inode_size))
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT2_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            block_bitmap: BlockNumber(read_le_u32(bytes, 0x00)?),
            inode_bitmap: BlockNumber(read_le_u32(bytes, 0x04)?),
            inode_table: BlockNumber(read_le_u32(bytes, 0x08)?),
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    /// Parse a whole descriptor table of `count` records.
    pub fn parse_table(bytes: &[u8], count: u32) -> Result<Vec<Self>, ParseError> {
        (0..count as usize)
            .map(|group| {
                let record = ensure_slice(bytes, group * EXT2_GROUP_DESC_SIZE, EXT2_GROUP_DESC_SIZE)?;
                Self::parse_from_bytes(record)
            })
            .collect()
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    /// Allocated space in 512-byte sectors (`i_blocks`).
    pub blocks: u32,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u32,

    // ── Timestamps (seconds) ─────────────────────────────────────────────
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    /// `i_block`: 12 direct pointers, then single, double and triple indirect.
    pub block: [u32; EXT2_N_BLOCKS],
}

impl Ext2Inode {
    /// Parse an ext2 inode from raw bytes (at least 128).
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let base = usize::from(EXT2_GOOD_OLD_INODE_SIZE);
        if bytes.len() < base {
            return Err(ParseError::InsufficientData {
                needed: base,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mode = read_le_u16(bytes, 0x00)?;
        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        // Linux osd2 layout.
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        // 0x6C is i_size_high for regular files and i_dir_acl for everything else.
        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_hi = if mode & S_IFMT == S_IFREG {
            u64::from(read_le_u32(bytes, 0x6C)?)
        } else {
            0
        };

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (slot, ptr) in block.iter_mut().enumerate() {
            *ptr = read_le_u32(bytes, 0x28 + slot * 4)?;
        }

        Ok(Self {
            mode,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size: size_lo | (size_hi << 32),
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,

            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,

            block,
        })
    }

    /// Pointer stored in `i_block[slot]`.
    #[must_use]
    pub fn pointer(&self, slot: usize) -> BlockNumber {
        BlockNumber(self.block[slot])
    }

    /// The `i_block` area as raw bytes, as it sits on disk.
    #[must_use]
    pub fn block_area(&self) -> [u8; EXT2_FAST_SYMLINK_MAX] {
        let mut out = [0_u8; EXT2_FAST_SYMLINK_MAX];
        for (chunk, ptr) in out.chunks_exact_mut(4).zip(self.block.iter()) {
            chunk.copy_from_slice(&ptr.to_le_bytes());
        }
        out
    }

    // ── File type detection ─────────────────────────────────────────────

    /// Extract the file type bits from the mode field.
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    #[must_use]
    pub fn is_chrdev(&self) -> bool {
        self.file_type_mode() == S_IFCHR
    }

    #[must_use]
    pub fn is_blkdev(&self) -> bool {
        self.file_type_mode() == S_IFBLK
    }

    #[must_use]
    pub fn is_fifo(&self) -> bool {
        self.file_type_mode() == S_IFIFO
    }

    #[must_use]
    pub fn is_socket(&self) -> bool {
        self.file_type_mode() == S_IFSOCK
    }

    /// Permission bits (lower 12 bits of mode).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    // ── Symlink helpers ─────────────────────────────────────────────────

    /// Whether this is a "fast" symlink whose target lives in `i_block`.
    ///
    /// The target must fit in the 60-byte area and the inode must own no
    /// data block. An extended attribute block is allowed and accounted for
    /// through `block_size`.
    #[must_use]
    pub fn is_fast_symlink(&self, block_size: u32) -> bool {
        let ea_sectors = if self.file_acl == 0 {
            0
        } else {
            block_size / 512
        };
        self.is_symlink()
            && self.size <= EXT2_FAST_SYMLINK_MAX as u64
            && self.blocks.saturating_sub(ea_sectors) == 0
    }

    /// Target of a fast symlink, or `None` if this is not one.
    #[must_use]
    pub fn fast_symlink_target(&self, block_size: u32) -> Option<Vec<u8>> {
        if !self.is_fast_symlink(block_size) {
            return None;
        }
        let len = usize::try_from(self.size).ok()?;
        Some(self.block_area()[..len].to_vec())
    }

    // ── Device numbers ──────────────────────────────────────────────────

    /// `(major, minor)` for character and block devices.
    ///
    /// Old-style numbers sit in `i_block[0]` as 8+8 bits; when that is zero,
    /// `i_block[1]` holds the Linux "new" 12+20 bit encoding.
    #[must_use]
    pub fn device_number(&self) -> Option<(u32, u32)> {
        if !self.is_chrdev() && !self.is_blkdev() {
            return None;
        }
        let old = self.block[0];
        if old != 0 {
            return Some(((old >> 8) & 0xFF, old & 0xFF));
        }
        let new = self.block[1];
        Some(((new & 0xF_FF00) >> 8, (new & 0xFF) | ((new >> 12) & 0xF_FF00)))
    }

    /// Device number in the kernel's `new_encode_dev` layout, 0 for non-devices.
    #[must_use]
    pub fn rdev(&self) -> u32 {
        self.device_number().map_or(0, |(major, minor)| {
            (minor & 0xFF) | (major << 8) | ((minor & !0xFF) << 12)
        })
    }

    // ── Timestamps ──────────────────────────────────────────────────────

    /// Convert an on-disk timestamp to `SystemTime`.
    ///
    /// The kernel reads the field as a signed 32-bit value, so times before
    /// 1970 are representable.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // intentional: kernel reinterprets u32 as signed
    pub fn to_system_time(raw: u32) -> std::time::SystemTime {
        use std::time::{Duration, UNIX_EPOCH};
        let secs = i64::from(raw as i32);
        let magnitude = Duration::from_secs(secs.unsigned_abs());
        if secs >= 0 {
            UNIX_EPOCH + magnitude
        } else {
            UNIX_EPOCH - magnitude
        }
    }

    #[must_use]
    pub fn atime_system_time(&self) -> std::time::SystemTime {
        Self::to_system_time(self.atime)
    }

    #[must_use]
    pub fn mtime_system_time(&self) -> std::time::SystemTime {
        Self::to_system_time(self.mtime)
    }

    #[must_use]
    pub fn ctime_system_time(&self) -> std::time::SystemTime {
        Self::to_system_time(self.ctime)
    }
}

// ── Directory entry parsing ─────────────────────────────────────────────────

/// File type byte of a directory entry (only meaningful with `FILETYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// Size of the fixed directory entry header.
const DIR_ENTRY_HEADER: usize = 8;

/// An owned ext2 directory entry (`ext2_dir_entry_2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: InodeNumber,
    pub rec_len: u32,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// A borrowed directory entry pointing into the block buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2DirEntryRef<'a> {
    /// Zero for an unused slot.
    pub inode: u32,
    pub rec_len: u32,
    pub file_type: Ext2FileType,
    pub name: &'a [u8],
}

impl Ext2DirEntryRef<'_> {
    /// Convert to an owned [`Ext2DirEntry`] (allocates name bytes).
    #[must_use]
    pub fn to_owned(&self) -> Ext2DirEntry {
        Ext2DirEntry {
            inode: InodeNumber(self.inode),
            rec_len: self.rec_len,
            file_type: self.file_type,
            name: self.name.to_vec(),
        }
    }

    /// Whether the slot is unused (deleted entry or padding).
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.inode == 0
    }
}

/// Decode `rec_len`. 64K blocks store a full-block record as `0xFFFF`.
fn rec_len_from_disk(raw: u16, block_size: u32) -> u32 {
    if raw == u16::MAX && block_size == 65536 {
        65536
    } else {
        u32::from(raw)
    }
}

/// Decode the entry that starts at `offset` in a directory block.
///
/// Unused slots are returned too (`inode == 0`). The record length must be
/// at least the header size, a multiple of four, large enough for the name
/// and must not run past the end of `block`.
pub fn parse_dir_entry(
    block: &[u8],
    offset: usize,
    block_size: u32,
    has_filetype: bool,
) -> Result<Ext2DirEntryRef<'_>, ParseError> {
    let header = ensure_slice(block, offset, DIR_ENTRY_HEADER)?;
    let inode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let rec_len = rec_len_from_disk(u16::from_le_bytes([header[4], header[5]]), block_size);
    let name_len = usize::from(header[6]);
    let file_type = if has_filetype {
        Ext2FileType::from_raw(header[7])
    } else {
        Ext2FileType::Unknown
    };

    if (rec_len as usize) < DIR_ENTRY_HEADER {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "directory entry rec_len < 8",
        });
    }
    if rec_len % 4 != 0 {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "directory entry rec_len not a multiple of 4",
        });
    }
    let entry_end = offset + rec_len as usize;
    if entry_end > block.len() {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "directory entry extends past block boundary",
        });
    }
    if inode != 0 && DIR_ENTRY_HEADER + name_len > rec_len as usize {
        return Err(ParseError::InvalidField {
            field: "name_len",
            reason: "name extends past rec_len",
        });
    }

    let name = if inode == 0 {
        &[][..]
    } else {
        &block[offset + DIR_ENTRY_HEADER..offset + DIR_ENTRY_HEADER + name_len]
    };

    Ok(Ext2DirEntryRef {
        inode,
        rec_len,
        file_type,
        name,
    })
}
