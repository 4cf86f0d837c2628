#![forbid(unsafe_code)]
//! Synthetic ext2 images for tests.
//!
//! [`RawImage`] lays out the superblock, group descriptors and inode tables
//! and then lets a test place inodes, pointers and directory blocks at
//! exact locations. [`ImageBuilder`] sits on top of it and allocates blocks
//! and inode numbers for files, holes, directories and symlinks.
//!
//! The writer maps logical blocks with its own per-level code so the
//! reader's resolver is checked against an independent implementation.
//!
//! Fixture mistakes (running out of blocks, names over 255 bytes) panic.

use ext2ro_block::MemoryByteDevice;
use ext2ro_types::{
    EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS, EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_OFFSET, InodeNumber,
    S_IFBLK, S_IFCHR, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use std::collections::BTreeMap;

/// `s_feature_incompat` FILETYPE bit.
pub const INCOMPAT_FILETYPE: u32 = 0x0002;

/// Directory entry file type bytes.
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_SYMLINK: u8 = 7;

/// Volume geometry for a synthetic image.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub block_size: u32,
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub rev_level: u32,
    pub feature_incompat: u32,
    pub volume_name: String,
}

impl Geometry {
    /// A single-group volume of `block_size` blocks: 2 MiB for 1K blocks.
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        let blocks_count = (2 * 1024 * 1024 / block_size).max(64);
        Self {
            block_size,
            blocks_count,
            blocks_per_group: blocks_count.min(block_size * 8),
            inodes_per_group: 64,
            inode_size: 128,
            rev_level: 1,
            feature_incompat: INCOMPAT_FILETYPE,
            volume_name: "ext2ro-test".to_owned(),
        }
    }

    #[must_use]
    pub fn groups(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group)
    }

    #[must_use]
    pub fn first_data_block(&self) -> u32 {
        u32::from(self.block_size == 1024)
    }

    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        (self.inodes_per_group * u32::from(self.inode_size)).div_ceil(self.block_size)
    }

    #[must_use]
    pub fn pointers_per_block(&self) -> u32 {
        self.block_size / 4
    }

    fn log_block_size(&self) -> u32 {
        self.block_size.trailing_zeros() - 10
    }
}

/// Inode contents to place in an inode table slot.
#[derive(Debug, Clone, Default)]
pub struct InodeSpec {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    /// 512-byte sectors.
    pub blocks: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub file_acl: u32,
    pub block: [u32; EXT2_N_BLOCKS],
}

impl InodeSpec {
    #[must_use]
    pub fn file(size: u64) -> Self {
        Self {
            mode: S_IFREG | 0o644,
            size,
            links_count: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn dir(size: u64) -> Self {
        Self {
            mode: S_IFDIR | 0o755,
            size,
            links_count: 2,
            ..Self::default()
        }
    }

    /// Fast symlink: the target lives in `i_block`.
    ///
    /// # Panics
    /// If `target` does not fit in the 60-byte area.
    #[must_use]
    pub fn inline_symlink(target: &[u8]) -> Self {
        assert!(target.len() <= 60, "inline symlink target too long");
        let mut area = [0_u8; 60];
        area[..target.len()].copy_from_slice(target);
        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (slot, chunk) in block.iter_mut().zip(area.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            mode: S_IFLNK | 0o777,
            size: target.len() as u64,
            links_count: 1,
            block,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_block(mut self, slot: usize, block: u32) -> Self {
        self.block[slot] = block;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    #[must_use]
    pub fn with_times(mut self, atime: u32, mtime: u32, ctime: u32) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self.ctime = ctime;
        self
    }
}

/// One record for [`RawImage::write_dir_block`].
#[derive(Debug, Clone)]
pub struct DirEntrySpec {
    pub inode: u32,
    pub name: Vec<u8>,
    pub file_type: u8,
}

impl DirEntrySpec {
    #[must_use]
    pub fn new(inode: u32, name: &[u8], file_type: u8) -> Self {
        Self {
            inode,
            name: name.to_vec(),
            file_type,
        }
    }

    fn min_rec_len(&self) -> usize {
        (8 + self.name.len() + 3) & !3
    }
}

/// A formatted but otherwise empty ext2 image with explicit-placement writers.
#[derive(Debug, Clone)]
pub struct RawImage {
    geometry: Geometry,
    bytes: Vec<u8>,
    inode_tables: Vec<u32>,
    first_free_block: u32,
}

impl RawImage {
    /// Lay out superblock, descriptor table, bitmaps and inode tables.
    ///
    /// # Panics
    /// If the metadata does not fit in `blocks_count`.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let bs = geometry.block_size;
        let groups = geometry.groups();
        let mut bytes = vec![0_u8; geometry.blocks_count as usize * bs as usize];

        let sb_block = 1024 / bs;
        let gdt_start = sb_block + 1;
        let gdt_blocks = (groups * EXT2_GROUP_DESC_SIZE as u32).div_ceil(bs);
        let mut next = gdt_start + gdt_blocks;
        let mut inode_tables = Vec::with_capacity(groups as usize);
        for group in 0..groups {
            let block_bitmap = next;
            let inode_bitmap = next + 1;
            let inode_table = next + 2;
            next += 2 + geometry.inode_table_blocks();

            let gd = (gdt_start * bs) as usize + group as usize * EXT2_GROUP_DESC_SIZE;
            bytes[gd..gd + 4].copy_from_slice(&block_bitmap.to_le_bytes());
            bytes[gd + 4..gd + 8].copy_from_slice(&inode_bitmap.to_le_bytes());
            bytes[gd + 8..gd + 12].copy_from_slice(&inode_table.to_le_bytes());
            inode_tables.push(inode_table);
        }
        assert!(next < geometry.blocks_count, "metadata does not fit");

        let mut image = Self {
            geometry,
            bytes,
            inode_tables,
            first_free_block: next,
        };
        image.write_superblock();
        image
    }

    fn write_superblock(&mut self) {
        let g = self.geometry.clone();
        let inodes_count = g.inodes_per_group * g.groups();
        let sb = EXT2_SUPERBLOCK_OFFSET;
        let put32 = |bytes: &mut Vec<u8>, off: usize, v: u32| {
            bytes[sb + off..sb + off + 4].copy_from_slice(&v.to_le_bytes());
        };
        let put16 = |bytes: &mut Vec<u8>, off: usize, v: u16| {
            bytes[sb + off..sb + off + 2].copy_from_slice(&v.to_le_bytes());
        };

        put32(&mut self.bytes, 0x00, inodes_count);
        put32(&mut self.bytes, 0x04, g.blocks_count);
        put32(&mut self.bytes, 0x0C, g.blocks_count - self.first_free_block);
        put32(&mut self.bytes, 0x10, inodes_count - 10);
        put32(&mut self.bytes, 0x14, g.first_data_block());
        put32(&mut self.bytes, 0x18, g.log_block_size());
        put32(&mut self.bytes, 0x1C, g.log_block_size());
        put32(&mut self.bytes, 0x20, g.blocks_per_group);
        put32(&mut self.bytes, 0x24, g.blocks_per_group);
        put32(&mut self.bytes, 0x28, g.inodes_per_group);
        put16(&mut self.bytes, 0x38, EXT2_SUPER_MAGIC);
        put16(&mut self.bytes, 0x3A, 1); // clean
        put16(&mut self.bytes, 0x3C, 1); // continue on errors
        put32(&mut self.bytes, 0x4C, g.rev_level);
        if g.rev_level > 0 {
            put32(&mut self.bytes, 0x54, 11);
            put16(&mut self.bytes, 0x58, g.inode_size);
            put32(&mut self.bytes, 0x60, g.feature_incompat);
        }
        let uuid: Vec<u8> = (1..=16).collect();
        self.bytes[sb + 0x68..sb + 0x78].copy_from_slice(&uuid);
        let name = g.volume_name.as_bytes();
        let len = name.len().min(16);
        self.bytes[sb + 0x78..sb + 0x78 + len].copy_from_slice(&name[..len]);
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// First block not used by metadata.
    #[must_use]
    pub fn first_free_block(&self) -> u32 {
        self.first_free_block
    }

    /// Starting block of a group's inode table.
    #[must_use]
    pub fn inode_table(&self, group: u32) -> u32 {
        self.inode_tables[group as usize]
    }

    /// Raw bytes, for targeted corruption.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn write_block(&mut self, block: u32, offset: usize, data: &[u8]) {
        let start = block as usize * self.geometry.block_size as usize + offset;
        self.write_at(start, data);
    }

    /// Store a 32-bit pointer in slot `slot` of indirect block `block`.
    pub fn write_pointer(&mut self, block: u32, slot: u32, value: u32) {
        self.write_block(block, slot as usize * 4, &value.to_le_bytes());
    }

    #[must_use]
    pub fn read_pointer(&self, block: u32, slot: u32) -> u32 {
        let start = block as usize * self.geometry.block_size as usize + slot as usize * 4;
        u32::from_le_bytes([
            self.bytes[start],
            self.bytes[start + 1],
            self.bytes[start + 2],
            self.bytes[start + 3],
        ])
    }

    /// Byte offset of an inode record.
    #[must_use]
    pub fn inode_offset(&self, ino: u32) -> usize {
        let idx = ino - 1;
        let group = idx / self.geometry.inodes_per_group;
        let index = idx % self.geometry.inodes_per_group;
        let table = self.inode_table(group) as usize * self.geometry.block_size as usize;
        table + index as usize * usize::from(self.geometry.inode_size)
    }

    pub fn write_inode(&mut self, ino: u32, spec: &InodeSpec) {
        let base = self.inode_offset(ino);
        let mut raw = vec![0_u8; 128];
        raw[0x00..0x02].copy_from_slice(&spec.mode.to_le_bytes());
        raw[0x02..0x04].copy_from_slice(&((spec.uid & 0xFFFF) as u16).to_le_bytes());
        raw[0x04..0x08].copy_from_slice(&((spec.size & 0xFFFF_FFFF) as u32).to_le_bytes());
        raw[0x08..0x0C].copy_from_slice(&spec.atime.to_le_bytes());
        raw[0x0C..0x10].copy_from_slice(&spec.ctime.to_le_bytes());
        raw[0x10..0x14].copy_from_slice(&spec.mtime.to_le_bytes());
        raw[0x18..0x1A].copy_from_slice(&((spec.gid & 0xFFFF) as u16).to_le_bytes());
        raw[0x1A..0x1C].copy_from_slice(&spec.links_count.to_le_bytes());
        raw[0x1C..0x20].copy_from_slice(&spec.blocks.to_le_bytes());
        for (slot, ptr) in spec.block.iter().enumerate() {
            raw[0x28 + slot * 4..0x2C + slot * 4].copy_from_slice(&ptr.to_le_bytes());
        }
        raw[0x68..0x6C].copy_from_slice(&spec.file_acl.to_le_bytes());
        if spec.mode & S_IFMT == S_IFREG {
            raw[0x6C..0x70].copy_from_slice(&((spec.size >> 32) as u32).to_le_bytes());
        }
        raw[0x78..0x7A].copy_from_slice(&((spec.uid >> 16) as u16).to_le_bytes());
        raw[0x7A..0x7C].copy_from_slice(&((spec.gid >> 16) as u16).to_le_bytes());
        self.write_at(base, &raw);
    }

    /// Pack `entries` into `block`; the last record absorbs the rest of the block.
    ///
    /// # Panics
    /// If the entries do not fit in one block.
    pub fn write_dir_block(&mut self, block: u32, entries: &[DirEntrySpec]) {
        let bs = self.geometry.block_size as usize;
        let mut raw = vec![0_u8; bs];
        let mut offset = 0_usize;
        for (i, entry) in entries.iter().enumerate() {
            let rec_len = if i + 1 == entries.len() {
                bs - offset
            } else {
                entry.min_rec_len()
            };
            assert!(
                offset + entry.min_rec_len() <= bs,
                "directory entries overflow the block"
            );
            put_dir_entry(&mut raw[offset..], entry, rec_len);
            offset += rec_len;
        }
        self.write_block(block, 0, &raw);
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[must_use]
    pub fn into_device(self) -> MemoryByteDevice {
        MemoryByteDevice::new(self.bytes)
    }
}

fn put_dir_entry(raw: &mut [u8], entry: &DirEntrySpec, rec_len: usize) {
    assert!(entry.name.len() <= 255, "name too long");
    raw[0..4].copy_from_slice(&entry.inode.to_le_bytes());
    raw[4..6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    raw[6] = entry.name.len() as u8;
    raw[7] = entry.file_type;
    raw[8..8 + entry.name.len()].copy_from_slice(&entry.name);
}

/// A finished image plus where the builder put things.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub block_size: u32,
    data_blocks: BTreeMap<u32, Vec<u32>>,
}

impl BuiltImage {
    /// Physical data blocks of `ino` in logical order (holes omitted).
    #[must_use]
    pub fn data_blocks(&self, ino: InodeNumber) -> &[u32] {
        self.data_blocks.get(&ino.0).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn into_device(self) -> MemoryByteDevice {
        MemoryByteDevice::new(self.bytes)
    }
}

#[derive(Debug, Clone)]
struct DirState {
    entries: Vec<DirEntrySpec>,
}

/// Allocates inodes and blocks on top of a [`RawImage`].
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    raw: RawImage,
    next_block: u32,
    next_inode: u32,
    inodes: BTreeMap<u32, InodeSpec>,
    dirs: BTreeMap<u32, DirState>,
    data_blocks: BTreeMap<u32, Vec<u32>>,
}

impl ImageBuilder {
    /// Start an image whose root directory (inode 2) holds `.` and `..`.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let raw = RawImage::new(geometry);
        let next_block = raw.first_free_block();
        let mut builder = Self {
            raw,
            next_block,
            next_inode: 11,
            inodes: BTreeMap::new(),
            dirs: BTreeMap::new(),
            data_blocks: BTreeMap::new(),
        };
        let root = InodeNumber::ROOT.0;
        builder.inodes.insert(root, InodeSpec::dir(0));
        builder.dirs.insert(
            root,
            DirState {
                entries: vec![
                    DirEntrySpec::new(root, b".", FT_DIR),
                    DirEntrySpec::new(root, b"..", FT_DIR),
                ],
            },
        );
        builder
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.raw.geometry().block_size
    }

    /// Skip inode numbers so the next allocation returns `ino`.
    ///
    /// # Panics
    /// If `ino` was already handed out.
    pub fn set_next_inode(&mut self, ino: u32) {
        assert!(ino >= self.next_inode, "inode {ino} already allocated");
        self.next_inode = ino;
    }

    /// Skip blocks so the next allocation returns `block`.
    ///
    /// # Panics
    /// If `block` was already handed out.
    pub fn set_next_block(&mut self, block: u32) {
        assert!(block >= self.next_block, "block {block} already allocated");
        self.next_block = block;
    }

    fn alloc_inode(&mut self) -> u32 {
        let ino = self.next_inode;
        let max = self.raw.geometry().inodes_per_group * self.raw.geometry().groups();
        assert!(ino <= max, "out of inodes");
        self.next_inode += 1;
        ino
    }

    fn alloc_block(&mut self) -> u32 {
        let block = self.next_block;
        assert!(block < self.raw.geometry().blocks_count, "out of blocks");
        self.next_block += 1;
        block
    }

    fn sectors_per_block(&self) -> u32 {
        self.block_size() / 512
    }

    fn link(&mut self, parent: InodeNumber, name: &[u8], ino: u32, file_type: u8) {
        let dir = self
            .dirs
            .get_mut(&parent.0)
            .unwrap_or_else(|| panic!("inode {} is not a builder directory", parent.0));
        dir.entries.push(DirEntrySpec::new(ino, name, file_type));
    }

    /// Allocate an indirect block if `ptr` is empty; return the block.
    fn ensure_indirect(&mut self, ino: u32, ptr: u32) -> u32 {
        if ptr != 0 {
            return ptr;
        }
        let block = self.alloc_block();
        let sectors = self.sectors_per_block();
        if let Some(spec) = self.inodes.get_mut(&ino) {
            spec.blocks += sectors;
        }
        block
    }

    /// Follow (or create) the pointer in `slot` of indirect block `parent`.
    fn ensure_child(&mut self, ino: u32, parent: u32, slot: u32) -> u32 {
        let existing = self.raw.read_pointer(parent, slot);
        let child = self.ensure_indirect(ino, existing);
        self.raw.write_pointer(parent, slot, child);
        child
    }

    fn ensure_root(&mut self, ino: u32, slot: usize) -> u32 {
        let current = self.inodes[&ino].block[slot];
        let block = self.ensure_indirect(ino, current);
        if let Some(spec) = self.inodes.get_mut(&ino) {
            spec.block[slot] = block;
        }
        block
    }

    /// Point logical block `logical` of `ino` at `physical`.
    ///
    /// # Panics
    /// If `logical` is beyond triple indirection.
    pub fn map_block(&mut self, ino: InodeNumber, logical: u64, physical: u32) {
        let ino = ino.0;
        let p = u64::from(self.raw.geometry().pointers_per_block());
        #[allow(clippy::cast_possible_truncation)]
        let slot = |v: u64| v as u32;

        if logical < 12 {
            if let Some(spec) = self.inodes.get_mut(&ino) {
                spec.block[logical as usize] = physical;
            }
            return;
        }
        let mut rel = logical - 12;
        if rel < p {
            let ind = self.ensure_root(ino, 12);
            self.raw.write_pointer(ind, slot(rel), physical);
            return;
        }
        rel -= p;
        if rel < p * p {
            let dind = self.ensure_root(ino, 13);
            let ind = self.ensure_child(ino, dind, slot(rel / p));
            self.raw.write_pointer(ind, slot(rel % p), physical);
            return;
        }
        rel -= p * p;
        assert!(rel < p * p * p, "logical block {logical} not addressable");
        let tind = self.ensure_root(ino, 14);
        let dind = self.ensure_child(ino, tind, slot(rel / (p * p)));
        let ind = self.ensure_child(ino, dind, slot((rel % (p * p)) / p));
        self.raw.write_pointer(ind, slot(rel % p), physical);
    }

    fn store_block(&mut self, ino: u32, logical: u64, data: &[u8]) -> u32 {
        let block = self.alloc_block();
        self.raw.write_block(block, 0, data);
        self.map_block(InodeNumber(ino), logical, block);
        let sectors = self.sectors_per_block();
        if let Some(spec) = self.inodes.get_mut(&ino) {
            spec.blocks += sectors;
        }
        self.data_blocks.entry(ino).or_default().push(block);
        block
    }

    /// Regular file with `contents` stored in freshly allocated blocks.
    pub fn add_file(&mut self, parent: InodeNumber, name: &str, contents: &[u8]) -> InodeNumber {
        let ino = self.alloc_inode();
        self.inodes.insert(ino, InodeSpec::file(contents.len() as u64));
        let bs = self.block_size() as usize;
        for (logical, chunk) in contents.chunks(bs).enumerate() {
            self.store_block(ino, logical as u64, chunk);
        }
        self.link(parent, name.as_bytes(), ino, FT_REG_FILE);
        InodeNumber(ino)
    }

    /// Regular file of `size` bytes where only the listed logical blocks exist.
    pub fn add_sparse_file(
        &mut self,
        parent: InodeNumber,
        name: &str,
        size: u64,
        blocks: &[(u64, &[u8])],
    ) -> InodeNumber {
        let ino = self.alloc_inode();
        self.inodes.insert(ino, InodeSpec::file(size));
        for (logical, data) in blocks {
            self.store_block(ino, *logical, data);
        }
        self.link(parent, name.as_bytes(), ino, FT_REG_FILE);
        InodeNumber(ino)
    }

    pub fn add_dir(&mut self, parent: InodeNumber, name: &str) -> InodeNumber {
        let ino = self.alloc_inode();
        self.inodes.insert(ino, InodeSpec::dir(0));
        self.dirs.insert(
            ino,
            DirState {
                entries: vec![
                    DirEntrySpec::new(ino, b".", FT_DIR),
                    DirEntrySpec::new(parent.0, b"..", FT_DIR),
                ],
            },
        );
        if let Some(spec) = self.inodes.get_mut(&parent.0) {
            spec.links_count += 1;
        }
        self.link(parent, name.as_bytes(), ino, FT_DIR);
        InodeNumber(ino)
    }

    /// Symlink; targets under 60 bytes are stored inline, longer ones in a block.
    pub fn add_symlink(&mut self, parent: InodeNumber, name: &str, target: &[u8]) -> InodeNumber {
        let ino = self.alloc_inode();
        if target.len() < 60 {
            self.inodes.insert(ino, InodeSpec::inline_symlink(target));
        } else {
            let spec = InodeSpec {
                mode: S_IFLNK | 0o777,
                size: target.len() as u64,
                links_count: 1,
                ..InodeSpec::default()
            };
            self.inodes.insert(ino, spec);
            let bs = self.block_size() as usize;
            for (logical, chunk) in target.chunks(bs).enumerate() {
                self.store_block(ino, logical as u64, chunk);
            }
        }
        self.link(parent, name.as_bytes(), ino, FT_SYMLINK);
        InodeNumber(ino)
    }

    /// Character (`block == false`) or block device node with new-style numbering.
    pub fn add_device(
        &mut self,
        parent: InodeNumber,
        name: &str,
        block: bool,
        major: u32,
        minor: u32,
    ) -> InodeNumber {
        let ino = self.alloc_inode();
        let kind = if block { S_IFBLK } else { S_IFCHR };
        let encoded = (minor & 0xFF) | (major << 8) | ((minor & !0xFF) << 12);
        let spec = InodeSpec {
            mode: kind | 0o660,
            links_count: 1,
            ..InodeSpec::default()
        }
        .with_block(1, encoded);
        self.inodes.insert(ino, spec);
        let ft = if block { FT_BLKDEV } else { FT_CHRDEV };
        self.link(parent, name.as_bytes(), ino, ft);
        InodeNumber(ino)
    }

    /// Change ownership and timestamps of an inode added earlier.
    pub fn set_attrs(&mut self, ino: InodeNumber, uid: u32, gid: u32, mtime: u32) {
        if let Some(spec) = self.inodes.get_mut(&ino.0) {
            spec.uid = uid;
            spec.gid = gid;
            spec.mtime = mtime;
            spec.atime = mtime;
            spec.ctime = mtime;
        }
    }

    /// Write directory blocks and inode records; return the image.
    #[must_use]
    pub fn build(mut self) -> BuiltImage {
        let bs = self.block_size() as usize;
        let dirs: Vec<(u32, Vec<DirEntrySpec>)> = self
            .dirs
            .iter()
            .map(|(ino, state)| (*ino, state.entries.clone()))
            .collect();

        for (ino, entries) in dirs {
            let mut chunks: Vec<Vec<DirEntrySpec>> = vec![Vec::new()];
            let mut used = 0_usize;
            for entry in entries {
                let need = entry.min_rec_len();
                if used + need > bs {
                    chunks.push(Vec::new());
                    used = 0;
                }
                used += need;
                if let Some(last) = chunks.last_mut() {
                    last.push(entry);
                }
            }
            for (logical, chunk) in chunks.iter().enumerate() {
                let block = self.alloc_block();
                self.raw.write_dir_block(block, chunk);
                self.map_block(InodeNumber(ino), logical as u64, block);
                let sectors = self.sectors_per_block();
                if let Some(spec) = self.inodes.get_mut(&ino) {
                    spec.blocks += sectors;
                    spec.size = (chunks.len() * bs) as u64;
                }
                self.data_blocks.entry(ino).or_default().push(block);
            }
        }

        for (ino, spec) in &self.inodes {
            self.raw.write_inode(*ino, spec);
        }

        BuiltImage {
            block_size: self.block_size(),
            bytes: self.raw.into_bytes(),
            data_blocks: self.data_blocks,
        }
    }
}
