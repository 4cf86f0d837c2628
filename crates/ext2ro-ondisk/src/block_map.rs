#![forbid(unsafe_code)]
//! Logical block → pointer path decomposition.
//!
//! An ext2 inode addresses its content through `i_block[15]`:
//!
//! | Logical range (`P` = pointers per block) | Depth | Root slot |
//! |-------------------------------------------|-------|-----------|
//! | `[0, 12)` | direct | `i_block[idx]` |
//! | `[12, 12+P)` | 1 | `i_block[12]` |
//! | `[12+P, 12+P+P²)` | 2 | `i_block[13]` |
//! | `[12+P+P², 12+P+P²+P³)` | 3 | `i_block[14]` |
//!
//! Within an indirect range the relative index `r` is written in base `P`
//! with `depth` digits, most significant first. Each digit is the slot to
//! read at one level of the tree. This module only does the arithmetic;
//! walking the tree needs I/O and lives in `ext2ro-core`.

use ext2ro_types::{EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, LogicalBlock};

/// Deepest indirection level ext2 supports.
pub const MAX_INDIRECTION: usize = 3;

/// Where a logical block's pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMapPath {
    /// `i_block[slot]` holds the physical block directly.
    Direct(usize),
    /// Walk one or more indirect blocks starting from `i_block[12 + depth - 1]`.
    Indirect(IndirectPath),
}

/// Slots to read at each level of an indirect walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectPath {
    depth: usize,
    slots: [u32; MAX_INDIRECTION],
}

impl IndirectPath {
    /// Number of indirect blocks on the path (1 = single, 2 = double, 3 = triple).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Index into `i_block` of the pointer that roots this walk.
    #[must_use]
    pub fn root_slot(&self) -> usize {
        EXT2_IND_BLOCK + self.depth - 1
    }

    /// Slot to read in each indirect block, outermost first.
    #[must_use]
    pub fn slots(&self) -> &[u32] {
        &self.slots[..self.depth]
    }
}

/// Total number of logical blocks addressable with fan-out `pointers_per_block`.
///
/// Saturates instead of overflowing; real block sizes never get close.
#[must_use]
pub fn addressable_blocks(pointers_per_block: u32) -> u64 {
    let p = u64::from(pointers_per_block);
    let mut total = EXT2_NDIR_BLOCKS as u64;
    let mut span = 1_u64;
    for _ in 0..MAX_INDIRECTION {
        span = span.saturating_mul(p);
        total = total.saturating_add(span);
    }
    total
}

/// Decompose `logical` into the pointer path that maps it.
///
/// Returns `None` when the index lies beyond triple indirection, or when
/// `pointers_per_block` is zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // digits are remainders of division by a u32
pub fn locate_block(pointers_per_block: u32, logical: LogicalBlock) -> Option<BlockMapPath> {
    let ndir = EXT2_NDIR_BLOCKS as u64;
    if logical.0 < ndir {
        return Some(BlockMapPath::Direct(logical.0 as usize));
    }
    if pointers_per_block == 0 {
        return None;
    }

    let p = u64::from(pointers_per_block);
    let mut rel = logical.0 - ndir;
    let mut span = p;
    for depth in 1..=MAX_INDIRECTION {
        if rel < span {
            let mut slots = [0_u32; MAX_INDIRECTION];
            for slot in slots[..depth].iter_mut().rev() {
                *slot = (rel % p) as u32;
                rel /= p;
            }
            return Some(BlockMapPath::Indirect(IndirectPath { depth, slots }));
        }
        rel -= span;
        span = span.checked_mul(p)?;
    }
    None
}
