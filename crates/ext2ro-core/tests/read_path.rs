//! End-to-end read path scenarios over synthetic images.

use ext2ro_block::MemoryByteDevice;
use ext2ro_core::{Ext2Error, FsOps, InodeNumber, LogicalBlock, OpenOptions, Volume};
use ext2ro_harness::{Geometry, ImageBuilder, RawImage};
use proptest::prelude::*;
use std::io::Write;
use std::sync::LazyLock;

const P: u64 = 256;
const SINGLE_START: u64 = 12;
const DOUBLE_START: u64 = SINGLE_START + P;
const TRIPLE_START: u64 = DOUBLE_START + P * P;
const LIMIT: u64 = TRIPLE_START + P * P * P;

fn open_bytes(bytes: Vec<u8>) -> Result<Volume, Ext2Error> {
    Volume::from_device(
        Box::new(MemoryByteDevice::new(bytes)),
        &OpenOptions::default(),
    )
}

fn block_of(tag: u8) -> Vec<u8> {
    let mut block = vec![tag; 1024];
    block[0] = 0xB0;
    block[1023] = 0xE0;
    block
}

/// The volume from the worked example: `/greeting.txt` is inode 13 and its
/// only data block is block 50.
fn greeting_image() -> Vec<u8> {
    let mut builder = ImageBuilder::new(Geometry::new(1024));
    builder.set_next_inode(13);
    builder.set_next_block(50);
    let ino = builder.add_file(InodeNumber::ROOT, "greeting.txt", b"hello world");
    assert_eq!(ino, InodeNumber(13));
    let image = builder.build();
    assert_eq!(image.data_blocks(ino), &[50]);
    image.bytes
}

#[test]
fn greeting_example() {
    let vol = open_bytes(greeting_image()).expect("open");
    let (ino, inode) = vol.resolve_path("/greeting.txt").expect("resolve");
    assert_eq!(ino, InodeNumber(13));
    assert_eq!(inode.size, 11);
    assert_eq!(inode.block[0], 50);
    assert_eq!(vol.read_file(&inode, 0, 11).expect("read"), b"hello world");
    assert_eq!(vol.read_file(&inode, 6, 100).expect("read"), b"world");
}

#[test]
fn missing_path_is_not_found() {
    let vol = open_bytes(greeting_image()).expect("open");
    let err = vol.resolve_path("/missing").expect_err("missing");
    assert!(matches!(&err, Ext2Error::NotFound(p) if p == "/missing"));
    assert!(err.is_not_found());
}

#[test]
fn path_resolution_is_idempotent() {
    let vol = open_bytes(greeting_image()).expect("open");
    let first = vol.resolve_path("/greeting.txt").expect("first");
    let second = vol.resolve_path("/greeting.txt").expect("second");
    assert_eq!(first, second);
}

struct Boundaries {
    vol: Volume,
    ino: InodeNumber,
    /// (logical block, tag byte) for every mapped block.
    mapped: Vec<(u64, u8)>,
    physical: Vec<u32>,
}

/// A sparse file with data exactly at each indirection boundary.
fn boundary_file() -> Boundaries {
    let logicals = [
        11,
        SINGLE_START,
        DOUBLE_START - 1,
        DOUBLE_START,
        TRIPLE_START - 1,
        TRIPLE_START,
        LIMIT - 1,
    ];
    let mapped: Vec<(u64, u8)> = logicals
        .iter()
        .enumerate()
        .map(|(i, l)| (*l, 0x10 + i as u8))
        .collect();
    let blocks: Vec<Vec<u8>> = mapped.iter().map(|(_, tag)| block_of(*tag)).collect();
    let chunks: Vec<(u64, &[u8])> = mapped
        .iter()
        .zip(&blocks)
        .map(|((l, _), data)| (*l, data.as_slice()))
        .collect();

    let mut builder = ImageBuilder::new(Geometry::new(1024));
    let ino = builder.add_sparse_file(InodeNumber::ROOT, "sparse.bin", (LIMIT + 2) * 1024, &chunks);
    let image = builder.build();
    let physical = image.data_blocks(ino).to_vec();
    let vol = open_bytes(image.bytes).expect("open");
    Boundaries {
        vol,
        ino,
        mapped,
        physical,
    }
}

#[test]
fn each_indirection_boundary_resolves_to_its_block() {
    let fx = boundary_file();
    let inode = fx.vol.read_inode(fx.ino).expect("inode");
    for ((logical, _), physical) in fx.mapped.iter().zip(&fx.physical) {
        let got = fx
            .vol
            .resolve_block(&inode, LogicalBlock(*logical))
            .expect("resolve");
        assert_eq!(got.0, *physical, "logical block {logical}");
    }
    // Direct slot 11 is stored in the inode itself.
    assert_eq!(inode.block[11], fx.physical[0]);
}

#[test]
fn boundary_blocks_read_back_their_content() {
    let fx = boundary_file();
    let inode = fx.vol.read_inode(fx.ino).expect("inode");
    for (logical, tag) in &fx.mapped {
        let data = fx
            .vol
            .read_file(&inode, logical * 1024, 1024)
            .expect("read");
        assert_eq!(data, block_of(*tag), "logical block {logical}");
    }
}

#[test]
fn holes_at_every_level_read_as_zeros() {
    let fx = boundary_file();
    let inode = fx.vol.read_inode(fx.ino).expect("inode");
    let holes = [
        0,                       // direct pointer 0
        SINGLE_START + 1,        // zero slot in the single-indirect block
        DOUBLE_START + P,        // second double-level block never allocated
        TRIPLE_START + P * P,    // second triple-level subtree never allocated
        TRIPLE_START + 1,        // zero slot in an allocated leaf
    ];
    for logical in holes {
        let physical = fx
            .vol
            .resolve_block(&inode, LogicalBlock(logical))
            .expect("resolve");
        assert!(physical.is_sparse(), "logical block {logical}");
        let data = fx
            .vol
            .read_file(&inode, logical * 1024, 1024)
            .expect("read hole");
        assert_eq!(data.len(), 1024);
        assert!(data.iter().all(|b| *b == 0), "logical block {logical}");
    }
}

#[test]
fn beyond_triple_indirection_is_out_of_range() {
    let fx = boundary_file();
    let inode = fx.vol.read_inode(fx.ino).expect("inode");
    let err = fx
        .vol
        .resolve_block(&inode, LogicalBlock(LIMIT))
        .expect_err("out of range");
    assert!(matches!(err, Ext2Error::OutOfRange { logical_block } if logical_block == LIMIT));

    // The declared size covers it, so the read reaches the resolver.
    let err = fx
        .vol
        .read_file(&inode, LIMIT * 1024, 16)
        .expect_err("out of range");
    assert!(matches!(err, Ext2Error::OutOfRange { .. }));
}

#[test]
fn read_spanning_a_boundary_concatenates_blocks() {
    let fx = boundary_file();
    let inode = fx.vol.read_inode(fx.ino).expect("inode");
    let data = fx
        .vol
        .read_file(&inode, 11 * 1024 + 1000, 48)
        .expect("read");
    let mut expected = block_of(0x10)[1000..].to_vec();
    expected.extend_from_slice(&block_of(0x11)[..24]);
    assert_eq!(data, expected);
}

#[test]
fn directory_iteration_visits_written_names_in_order() {
    let mut builder = ImageBuilder::new(Geometry::new(1024));
    let names = ["Zeta", "alpha", "Alpha", "beta.txt", "a b", "ünïcode"];
    for name in names {
        builder.add_file(InodeNumber::ROOT, name, name.as_bytes());
    }
    let vol = open_bytes(builder.build().bytes).expect("open");
    let root = vol.read_inode(InodeNumber::ROOT).expect("root");
    let listed: Vec<Vec<u8>> = vol
        .read_dir(&root)
        .expect("read_dir")
        .into_iter()
        .map(|e| e.name)
        .skip(2)
        .collect();
    let expected: Vec<Vec<u8>> = names.iter().map(|n| n.as_bytes().to_vec()).collect();
    assert_eq!(listed, expected);

    let (alpha, _) = vol.resolve_path("/alpha").expect("alpha");
    let (upper, _) = vol.resolve_path("/Alpha").expect("Alpha");
    assert_ne!(alpha, upper);
}

#[test]
fn bad_magic_is_rejected() {
    let mut bytes = greeting_image();
    bytes[1024 + 0x38] = 0;
    let err = open_bytes(bytes).expect_err("bad magic");
    assert!(matches!(err, Ext2Error::Format(_)), "{err:?}");
}

#[test]
fn truncated_images_are_rejected() {
    let mut bytes = greeting_image();
    bytes.truncate(1500);
    let err = open_bytes(bytes).expect_err("short superblock");
    assert!(matches!(err, Ext2Error::Truncated { offset: 1024, .. }), "{err:?}");

    let mut bytes = greeting_image();
    bytes.truncate(2048 + 10);
    let err = open_bytes(bytes).expect_err("short group table");
    assert!(
        matches!(
            err,
            Ext2Error::Truncated {
                offset: 2048,
                needed: 32,
                actual: 10,
            }
        ),
        "{err:?}"
    );
}

#[test]
fn inode_out_of_range_is_invalid() {
    let vol = open_bytes(greeting_image()).expect("open");
    let err = vol.read_inode(InodeNumber(10_000)).expect_err("range");
    assert!(matches!(err, Ext2Error::InvalidInode(10_000)));
    assert!(err.is_not_found());
}

#[test]
fn corrupt_record_length_fails_lookup() {
    let mut builder = ImageBuilder::new(Geometry::new(1024));
    builder.add_file(InodeNumber::ROOT, "a", b"1");
    let image = builder.build();
    let dir_block = image.data_blocks(InodeNumber::ROOT)[0] as usize;
    let mut bytes = image.bytes;
    // rec_len of "." becomes 6: smaller than the header
    bytes[dir_block * 1024 + 4..dir_block * 1024 + 6].copy_from_slice(&6_u16.to_le_bytes());

    let vol = open_bytes(bytes).expect("open");
    let err = vol.resolve_path("/a").expect_err("corrupt");
    assert!(matches!(err, Ext2Error::Format(_)), "{err:?}");
    // The volume stays usable for other operations.
    vol.read_inode(InodeNumber::ROOT).expect("root inode");
}

#[test]
fn inodes_in_later_groups() {
    let mut geometry = Geometry::new(1024);
    geometry.blocks_per_group = 512;
    let mut builder = ImageBuilder::new(geometry);
    let docs = builder.add_dir(InodeNumber::ROOT, "docs");
    builder.set_next_inode(70);
    let second = builder.add_file(docs, "second-group.txt", b"group one");
    builder.set_next_inode(200);
    let fourth = builder.add_file(InodeNumber::ROOT, "fourth-group.txt", b"group three");
    let vol = open_bytes(builder.build().bytes).expect("open");

    assert_eq!(vol.geometry().groups_count, 4);
    let (ino, inode) = vol.resolve_path("/docs/second-group.txt").expect("second");
    assert_eq!(ino, second);
    assert_eq!(vol.read_file(&inode, 0, 64).expect("read"), b"group one");

    let (ino, inode) = vol.resolve_path("/fourth-group.txt").expect("fourth");
    assert_eq!(ino, fourth);
    assert_eq!(vol.read_file(&inode, 0, 64).expect("read"), b"group three");
}

#[test]
fn four_kib_blocks() {
    let mut builder = ImageBuilder::new(Geometry::new(4096));
    let contents: Vec<u8> = (0..14 * 4096).map(|i| (i % 241) as u8).collect();
    let big = builder.add_file(InodeNumber::ROOT, "big.bin", &contents);
    let last_single = vec![0x5A_u8; 4096];
    let first_double = vec![0xA5_u8; 4096];
    let sparse = builder.add_sparse_file(
        InodeNumber::ROOT,
        "sparse.bin",
        (12 + 1024 + 1) * 4096,
        &[
            (12 + 1023, last_single.as_slice()),
            (12 + 1024, first_double.as_slice()),
        ],
    );
    let vol = open_bytes(builder.build().bytes).expect("open");
    assert_eq!(vol.block_size(), 4096);
    assert_eq!(vol.superblock().group_desc_table_offset(), 4096);

    let inode = vol.read_inode(big).expect("big");
    assert_eq!(
        vol.read_file(&inode, 0, contents.len()).expect("read"),
        contents
    );

    let inode = vol.read_inode(sparse).expect("sparse");
    assert_eq!(
        vol.read_file(&inode, (12 + 1023) * 4096, 4096).expect("read"),
        last_single
    );
    assert_eq!(
        vol.read_file(&inode, (12 + 1024) * 4096, 4096).expect("read"),
        first_double
    );
    assert!(vol
        .read_file(&inode, 12 * 4096, 4096)
        .expect("hole")
        .iter()
        .all(|b| *b == 0));
}

#[test]
fn open_from_file_on_disk() {
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(&greeting_image()).expect("write");
    tmp.flush().expect("flush");

    let vol = Volume::open(tmp.path()).expect("open");
    let attr = vol.getattr(InodeNumber(13)).expect("getattr");
    assert_eq!(attr.size, 11);
    assert_eq!(vol.read(InodeNumber(13), 0, 5).expect("read"), b"hello");
    vol.close();
}

#[test]
fn open_missing_file_is_io_error() {
    let err = Volume::open("/nonexistent/ext2ro/disk.img").expect_err("missing");
    assert!(matches!(err, Ext2Error::Io(_)));
}

#[test]
fn concurrent_readers_share_one_volume() {
    let fx = boundary_file();
    std::thread::scope(|scope| {
        for (logical, tag) in fx.mapped.clone() {
            let vol = &fx.vol;
            let ino = fx.ino;
            scope.spawn(move || {
                let inode = vol.read_inode(ino).expect("inode");
                for _ in 0..20 {
                    let data = vol.read_file(&inode, logical * 1024, 1024).expect("read");
                    assert_eq!(data, block_of(tag));
                }
            });
        }
    });
}

struct SmallFile {
    vol: Volume,
    ino: InodeNumber,
    contents: Vec<u8>,
}

static SMALL_FILE: LazyLock<SmallFile> = LazyLock::new(|| {
    let contents: Vec<u8> = (0..5000_u32).map(|i| (i % 251) as u8).collect();
    let mut builder = ImageBuilder::new(Geometry::new(1024));
    let ino = builder.add_file(InodeNumber::ROOT, "five-k.bin", &contents);
    let vol = open_bytes(builder.build().bytes).expect("open");
    SmallFile { vol, ino, contents }
});

proptest! {
    #[test]
    fn reads_never_pass_end_of_file(offset in 0_u64..6000, count in 0_usize..7000) {
        let fx = &*SMALL_FILE;
        let inode = fx.vol.read_inode(fx.ino).expect("inode");
        let data = fx.vol.read_file(&inode, offset, count).expect("read");
        let size = fx.contents.len() as u64;
        prop_assert!(offset + data.len() as u64 <= size.max(offset));
        let start = (offset as usize).min(fx.contents.len());
        let end = (start + count).min(fx.contents.len());
        prop_assert_eq!(data.as_slice(), &fx.contents[start..end]);
    }
}

#[test]
fn raw_image_with_hand_written_root() {
    let mut raw = RawImage::new(Geometry::new(2048));
    let block = raw.first_free_block();
    raw.write_dir_block(
        block,
        &[
            ext2ro_harness::DirEntrySpec::new(2, b".", ext2ro_harness::FT_DIR),
            ext2ro_harness::DirEntrySpec::new(2, b"..", ext2ro_harness::FT_DIR),
        ],
    );
    raw.write_inode(2, &ext2ro_harness::InodeSpec::dir(2048).with_block(0, block));
    let vol = open_bytes(raw.into_bytes()).expect("open");
    assert_eq!(vol.block_size(), 2048);
    let entries = vol.readdir(InodeNumber::ROOT, 0).expect("readdir");
    assert_eq!(entries.len(), 2);
}
