#![forbid(unsafe_code)]

use ext2ro_harness::{DirEntrySpec, FT_DIR, FT_REG_FILE, Geometry, InodeSpec, RawImage};
use ext2ro_ondisk::{
    BlockMapPath, Ext2GroupDesc, Ext2Inode, Ext2Superblock, addressable_blocks, locate_block,
    parse_dir_entry,
};
use ext2ro_types::{LogicalBlock, ParseError};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

const ROUNDS: usize = 2_000;

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    invalid_magic: u32,
    invalid_field: u32,
    integer_conversion: u32,
}

impl ErrorCoverage {
    fn observe(&mut self, err: &ParseError) {
        match err {
            ParseError::InsufficientData { .. } => self.insufficient_data += 1,
            ParseError::InvalidMagic { .. } => self.invalid_magic += 1,
            ParseError::InvalidField { .. } => self.invalid_field += 1,
            ParseError::IntegerConversion { .. } => self.integer_conversion += 1,
        }
    }
}

/// xorshift64; fixed seed so a failing sample reproduces.
struct Mutator(u64);

impl Mutator {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        usize::try_from(self.next() % n as u64).expect("fits")
    }

    fn mutate(&mut self, seed: &[u8]) -> Vec<u8> {
        let mut out = seed.to_vec();
        match self.below(4) {
            0 => {
                let len = self.below(out.len());
                out.truncate(len);
            }
            1 => {
                for _ in 0..=self.below(8) {
                    let i = self.below(out.len());
                    out[i] ^= 1 << self.below(8);
                }
            }
            2 => {
                let i = self.below(out.len());
                out[i] = 0xFF;
            }
            _ => {
                let start = self.below(out.len());
                let end = (start + 1 + self.below(16)).min(out.len());
                out[start..end].fill(0);
            }
        }
        out
    }
}

struct Seeds {
    superblock: Vec<u8>,
    group_desc: Vec<u8>,
    inode: Vec<u8>,
    dir_block: Vec<u8>,
}

fn seeds() -> Seeds {
    let mut raw = RawImage::new(Geometry::new(1024));
    let block = raw.first_free_block();
    raw.write_dir_block(
        block,
        &[
            DirEntrySpec::new(2, b".", FT_DIR),
            DirEntrySpec::new(2, b"..", FT_DIR),
            DirEntrySpec::new(12, b"notes.txt", FT_REG_FILE),
        ],
    );
    raw.write_inode(2, &InodeSpec::dir(1024).with_block(0, block));
    let inode_at = raw.inode_offset(2);
    let bytes = raw.into_bytes();
    let block_at = block as usize * 1024;
    Seeds {
        superblock: bytes[1024..2048].to_vec(),
        group_desc: bytes[2048..2080].to_vec(),
        inode: bytes[inode_at..inode_at + 128].to_vec(),
        dir_block: bytes[block_at..block_at + 1024].to_vec(),
    }
}

fn run_parser<T, F>(
    sample: usize,
    parser_name: &'static str,
    parser_hits: &mut BTreeMap<&'static str, (u32, u32)>,
    coverage: &mut ErrorCoverage,
    parser: F,
) where
    F: FnOnce() -> Result<T, ParseError>,
{
    let hits = parser_hits.entry(parser_name).or_default();
    match catch_unwind(AssertUnwindSafe(parser)) {
        Ok(Ok(_)) => hits.0 += 1,
        Ok(Err(err)) => {
            hits.1 += 1;
            coverage.observe(&err);
        }
        Err(_) => panic!("parser `{parser_name}` panicked on sample {sample}"),
    }
}

fn parse_and_validate(region: &[u8]) -> Result<Ext2Superblock, ParseError> {
    let sb = Ext2Superblock::parse_superblock_region(region)?;
    sb.validate_geometry()?;
    sb.validate_features()?;
    // Derived values must not overflow on anything validation accepts.
    let _ = (sb.groups_count(), sb.volume_size(), sb.group_desc_table_offset());
    Ok(sb)
}

fn parse_inode(bytes: &[u8]) -> Result<Ext2Inode, ParseError> {
    let inode = Ext2Inode::parse_from_bytes(bytes)?;
    let _ = (
        inode.is_fast_symlink(1024),
        inode.fast_symlink_target(1024),
        inode.rdev(),
        inode.permission_bits(),
    );
    Ok(inode)
}

fn walk_dir_block(block: &[u8]) -> Result<usize, ParseError> {
    let mut live = 0;
    let mut offset = 0;
    while offset < block.len() {
        let entry = parse_dir_entry(block, offset, 1024, true)?;
        assert!(entry.rec_len >= 8);
        offset += entry.rec_len as usize;
        if !entry.is_unused() {
            live += 1;
        }
    }
    Ok(live)
}

fn patch(seed: &[u8], offset: usize, bytes: &[u8]) -> Vec<u8> {
    let mut out = seed.to_vec();
    out[offset..offset + bytes.len()].copy_from_slice(bytes);
    out
}

#[test]
fn seeds_are_valid() {
    let seeds = seeds();
    let sb = parse_and_validate(&seeds.superblock).expect("superblock");
    assert_eq!(sb.block_size, 1024);
    assert_eq!(Ext2GroupDesc::parse_table(&seeds.group_desc, 1).expect("gdt").len(), 1);
    assert!(parse_inode(&seeds.inode).expect("inode").is_dir());
    assert_eq!(walk_dir_block(&seeds.dir_block).expect("dir"), 3);
}

#[test]
fn adversarial_samples_are_panic_free_and_exercise_parse_error_variants() {
    let seeds = seeds();
    let mut parser_hits = BTreeMap::new();
    let mut coverage = ErrorCoverage::default();

    // Targeted damage first, so every variant is reached regardless of the
    // random walk below.
    let targeted_superblocks = [
        patch(&seeds.superblock, 0x38, &[0, 0]),                    // magic
        patch(&seeds.superblock, 0x18, &7_u32.to_le_bytes()),       // log_block_size
        patch(&seeds.superblock, 0x20, &0_u32.to_le_bytes()),       // blocks_per_group
        patch(&seeds.superblock, 0x28, &0_u32.to_le_bytes()),       // inodes_per_group
        patch(&seeds.superblock, 0x60, &0x40_u32.to_le_bytes()),    // EXTENTS
        seeds.superblock[..100].to_vec(),
    ];
    for (i, sample) in targeted_superblocks.iter().enumerate() {
        run_parser(i, "superblock", &mut parser_hits, &mut coverage, || {
            parse_and_validate(sample)
        });
    }
    let targeted_dirs = [
        patch(&seeds.dir_block, 4, &6_u16.to_le_bytes()),
        patch(&seeds.dir_block, 4, &10_u16.to_le_bytes()),
        patch(&seeds.dir_block, 4, &2048_u16.to_le_bytes()),
        seeds.dir_block[..5].to_vec(),
    ];
    for (i, sample) in targeted_dirs.iter().enumerate() {
        run_parser(i, "dir_block", &mut parser_hits, &mut coverage, || {
            walk_dir_block(sample)
        });
    }

    let mut rng = Mutator(0x9E37_79B9_7F4A_7C15);
    for sample in 0..ROUNDS {
        let sb = rng.mutate(&seeds.superblock);
        run_parser(sample, "superblock", &mut parser_hits, &mut coverage, || {
            parse_and_validate(&sb)
        });

        let gd = rng.mutate(&seeds.group_desc);
        run_parser(sample, "group_desc", &mut parser_hits, &mut coverage, || {
            Ext2GroupDesc::parse_table(&gd, 1)
        });

        let inode = rng.mutate(&seeds.inode);
        run_parser(sample, "inode", &mut parser_hits, &mut coverage, || {
            parse_inode(&inode)
        });

        let dir = rng.mutate(&seeds.dir_block);
        run_parser(sample, "dir_block", &mut parser_hits, &mut coverage, || {
            walk_dir_block(&dir)
        });
    }

    assert!(coverage.insufficient_data > 0, "expected InsufficientData coverage");
    assert!(coverage.invalid_magic > 0, "expected InvalidMagic coverage");
    assert!(coverage.invalid_field > 0, "expected InvalidField coverage");
    for (parser, (accepted, rejected)) in &parser_hits {
        assert!(*accepted > 0, "{parser}: no sample was accepted");
        assert!(*rejected > 0, "{parser}: no sample was rejected");
    }
}

#[test]
fn random_logical_blocks_map_or_report_out_of_range() {
    let mut rng = Mutator(0xDEAD_BEEF_CAFE_F00D);
    for ptrs in [256_u32, 512, 1024, 4096] {
        let limit = addressable_blocks(ptrs);
        for _ in 0..ROUNDS {
            // Bias towards the addressable range and its edge.
            let logical = match rng.below(3) {
                0 => rng.next() % limit,
                1 => limit - 1 - (rng.next() % 64).min(limit - 1),
                _ => limit + rng.next() % 1_000_000,
            };
            match locate_block(ptrs, LogicalBlock(logical)) {
                None => assert!(logical >= limit, "{logical} < {limit} but unmapped"),
                Some(BlockMapPath::Direct(slot)) => assert!(slot < 12 && logical < 12),
                Some(BlockMapPath::Indirect(path)) => {
                    assert!(logical < limit);
                    assert!(path.slots().iter().all(|s| *s < ptrs));
                }
            }
        }
    }
}
