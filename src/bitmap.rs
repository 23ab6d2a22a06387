//! Inode and block allocation bitmaps.
//!
//! Both bitmaps are loaded eagerly at mount into one [`Vob`] per kind and
//! written back group by group, only for groups whose bits changed. Bits are
//! stored LSB-first within each on-disk byte, matching the ext layout.
//!
//! Groups flagged `BG_BLOCK_UNINIT`/`BG_INODE_UNINIT` have no bitmap on disk;
//! their in-memory image is synthesized the way the kernel initializes them
//! (metadata blocks in use, everything else free). The filesystem layer
//! clears the flag before the first mutation so the synthesized bitmap is
//! persisted on flush.

use vob::Vob;

use crate::error::{CanFail, Error, Ext4Result};
use crate::group::{bg_has_super, GroupTable, BG_BLOCK_UNINIT, BG_INODE_UNINIT};
use crate::io::{BlockDevice, IoChannel};
use crate::sb::{crc32c_raw, Superblock};

/// Which of the two allocation bitmaps a cache holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmapKind {
    /// One bit per inode, numbering starts at 1.
    Inode,
    /// One bit per block, numbering starts at `s_first_data_block`.
    Block,
}

/// Whole-filesystem view of one allocation bitmap.
#[derive(Debug)]
pub struct BitmapCache {
    kind: BitmapKind,
    bits: Vob,
    /// First entity number covered by bit 0.
    base: u64,
    /// Bits per block group.
    per_group: u64,
    /// Total entities actually backed by the filesystem.
    entities: u64,
    dirty: Vec<bool>,
}

impl BitmapCache {
    /// Loads the bitmap of `kind` for every group.
    pub fn load<D: BlockDevice>(
        io: &mut IoChannel<D>,
        sb: &Superblock,
        groups: &GroupTable,
        kind: BitmapKind,
    ) -> Ext4Result<Self> {
        let (base, per_group, entities) = match kind {
            BitmapKind::Inode => (
                1u64,
                u64::from(sb.s_inodes_per_group),
                u64::from(sb.s_inodes_count),
            ),
            BitmapKind::Block => (
                u64::from(sb.s_first_data_block),
                u64::from(sb.s_blocks_per_group),
                sb.blk_count() - u64::from(sb.s_first_data_block),
            ),
        };
        let group_count = groups.count();
        let mut bits = Vob::new();
        bits.resize((per_group * u64::from(group_count)) as usize, false);
        let mut blk_buf = io.allocate_blk();

        for group in 0..group_count {
            let desc = groups.desc(group)?;
            let uninit = match kind {
                BitmapKind::Inode => desc.bg_flags & BG_INODE_UNINIT != 0,
                BitmapKind::Block => desc.bg_flags & BG_BLOCK_UNINIT != 0,
            };
            let first_bit = u64::from(group) * per_group;
            if uninit {
                synthesize_group(&mut bits, sb, groups, group, kind, per_group, entities)?;
                continue;
            }
            let bitmap_blk = match kind {
                BitmapKind::Inode => desc.inode_bitmap(sb),
                BitmapKind::Block => desc.block_bitmap(sb),
            };
            if bitmap_blk == 0 || bitmap_blk >= sb.blk_count() {
                return Err(Error::Corrupted("bitmap block out of range"));
            }
            io.read_blocks(bitmap_blk, &mut blk_buf)?;
            for bit in 0..per_group {
                let byte = blk_buf[(bit / 8) as usize];
                if byte >> (bit % 8) & 1 != 0 {
                    bits.set((first_bit + bit) as usize, true);
                }
            }
        }

        Ok(Self {
            kind,
            bits,
            base,
            per_group,
            entities,
            dirty: vec![false; group_count as usize],
        })
    }

    /// Builds an all-clear cache with the given geometry, bypassing the disk.
    #[cfg(test)]
    pub(crate) fn empty(kind: BitmapKind, base: u64, per_group: u64, entities: u64, groups: u32) -> Self {
        let mut bits = Vob::new();
        bits.resize((per_group * u64::from(groups)) as usize, false);
        Self {
            kind,
            bits,
            base,
            per_group,
            entities,
            dirty: vec![false; groups as usize],
        }
    }

    fn bit_index(&self, n: u64) -> Ext4Result<usize> {
        let idx = n
            .checked_sub(self.base)
            .filter(|&idx| idx < self.entities)
            .ok_or(Error::Corrupted("bitmap index out of range"))?;
        Ok(idx as usize)
    }

    /// Tests the bit for entity `n`.
    pub fn test(&self, n: u64) -> Ext4Result<bool> {
        let idx = self.bit_index(n)?;
        Ok(self.bits.get(idx).unwrap_or(false))
    }

    /// Sets the bit for entity `n`, returning its previous value.
    pub fn set(&mut self, n: u64) -> Ext4Result<bool> {
        let idx = self.bit_index(n)?;
        let prev = self.bits.get(idx).unwrap_or(false);
        self.bits.set(idx, true);
        self.dirty[idx / self.per_group as usize] = true;
        Ok(prev)
    }

    /// Clears the bit for entity `n`, returning its previous value.
    pub fn clear(&mut self, n: u64) -> Ext4Result<bool> {
        let idx = self.bit_index(n)?;
        let prev = self.bits.get(idx).unwrap_or(false);
        self.bits.set(idx, false);
        self.dirty[idx / self.per_group as usize] = true;
        Ok(prev)
    }

    /// Finds the first clear bit in `[from, to)` (entity numbers) and returns
    /// its entity number.
    pub fn find_clear(&self, from: u64, to: u64) -> Option<u64> {
        let lo = from.max(self.base);
        let hi = to.min(self.base + self.entities);
        if lo >= hi {
            return None;
        }
        let range = (lo - self.base) as usize..(hi - self.base) as usize;
        self.bits.iter_unset_bits(range).next().map(|idx| idx as u64 + self.base)
    }

    /// Finds the first run of at least `len` clear bits in `[from, to)`.
    pub fn find_clear_run(&self, from: u64, to: u64, len: u64) -> Option<u64> {
        let lo = from.max(self.base);
        let hi = to.min(self.base + self.entities);
        if lo >= hi {
            return None;
        }
        let range = (lo - self.base) as usize..(hi - self.base) as usize;
        let mut run_start = None;
        let mut prev = None;
        for idx in self.bits.iter_unset_bits(range) {
            let start = match (run_start, prev) {
                (Some(start), Some(p)) if idx == p + 1 => start,
                _ => idx,
            };
            run_start = Some(start);
            prev = Some(idx);
            if (idx - start + 1) as u64 >= len {
                return Some(start as u64 + self.base);
            }
        }
        None
    }

    /// Calls `f` for every maximal run of clear bits, as
    /// `(first_entity, length)`.
    pub fn for_each_clear_run(&self, mut f: impl FnMut(u64, u64) -> CanFail) -> CanFail {
        let mut run: Option<(usize, usize)> = None;
        for idx in self.bits.iter_unset_bits(0..self.entities as usize) {
            run = match run {
                Some((start, end)) if idx == end + 1 => Some((start, idx)),
                Some((start, end)) => {
                    f(start as u64 + self.base, (end - start + 1) as u64)?;
                    Some((idx, idx))
                }
                None => Some((idx, idx)),
            };
        }
        if let Some((start, end)) = run {
            f(start as u64 + self.base, (end - start + 1) as u64)?;
        }
        Ok(())
    }

    /// Number of clear bits within the entities the filesystem backs.
    pub fn count_free(&self) -> u64 {
        self.bits.iter_unset_bits(0..self.entities as usize).count() as u64
    }

    /// Number of clear bits in `group`.
    pub fn count_free_in_group(&self, group: u32) -> u64 {
        let start = u64::from(group) * self.per_group;
        let end = (start + self.per_group).min(self.entities);
        if start >= end {
            return 0;
        }
        self.bits
            .iter_unset_bits(start as usize..end as usize)
            .count() as u64
    }

    /// Entity range `[first, last)` covered by `group`.
    pub fn group_span(&self, group: u32) -> (u64, u64) {
        let first = self.base + u64::from(group) * self.per_group;
        let last = (first + self.per_group).min(self.base + self.entities);
        (first, last)
    }

    /// Whether any group needs write-back.
    pub fn is_dirty(&self) -> bool {
        self.dirty.iter().any(|&d| d)
    }

    /// Writes back dirty groups, refreshing the per-group bitmap checksums.
    pub fn flush<D: BlockDevice>(
        &mut self,
        io: &mut IoChannel<D>,
        sb: &Superblock,
        groups: &mut GroupTable,
    ) -> CanFail {
        let mut blk_buf = io.allocate_blk();
        for group in 0..groups.count() {
            if !self.dirty[group as usize] {
                continue;
            }
            blk_buf.fill(0xFF);
            let first_bit = u64::from(group) * self.per_group;
            for bit in 0..self.per_group {
                let idx = (first_bit + bit) as usize;
                let byte = &mut blk_buf[(bit / 8) as usize];
                if self.bits.get(idx).unwrap_or(true) {
                    *byte |= 1 << (bit % 8);
                } else {
                    *byte &= !(1 << (bit % 8));
                }
            }
            let desc = groups.desc(group)?;
            let bitmap_blk = match self.kind {
                BitmapKind::Inode => desc.inode_bitmap(sb),
                BitmapKind::Block => desc.block_bitmap(sb),
            };
            io.write_blocks(bitmap_blk, &blk_buf)?;
            if sb.metadata_csum() {
                let covered = (self.per_group / 8) as usize;
                let csum = crc32c_raw(sb.chksum_seed(), &blk_buf[..covered]);
                let desc = groups.desc_mut(group)?;
                match self.kind {
                    BitmapKind::Inode => {
                        desc.bg_inode_bitmap_csum_lo = csum as u16;
                        if sb.desc_size() > 32 {
                            desc.bg_inode_bitmap_csum_hi = (csum >> 16) as u16;
                        }
                    }
                    BitmapKind::Block => {
                        desc.bg_block_bitmap_csum_lo = csum as u16;
                        if sb.desc_size() > 32 {
                            desc.bg_block_bitmap_csum_hi = (csum >> 16) as u16;
                        }
                    }
                }
            }
            self.dirty[group as usize] = false;
        }
        Ok(())
    }
}

/// Builds the in-memory bitmap for an uninitialized group.
fn synthesize_group(
    bits: &mut Vob,
    sb: &Superblock,
    groups: &GroupTable,
    group: u32,
    kind: BitmapKind,
    per_group: u64,
    entities: u64,
) -> CanFail {
    let first_bit = u64::from(group) * per_group;
    // Pad bits past the end of the filesystem stay in use.
    let covered = entities.saturating_sub(first_bit).min(per_group);
    for bit in covered..per_group {
        bits.set((first_bit + bit) as usize, true);
    }
    if kind == BitmapKind::Inode {
        return Ok(());
    }

    // An uninitialized block bitmap still accounts for the group's metadata.
    let blk_size = sb.blk_size();
    let group_first = u64::from(sb.s_first_data_block)
        + u64::from(group) * u64::from(sb.s_blocks_per_group);
    let group_end = group_first + covered;
    let mut mark = |blk: u64| {
        if blk >= group_first && blk < group_end {
            bits.set((first_bit + (blk - group_first)) as usize, true);
        }
    };

    if bg_has_super(sb, group) {
        mark(group_first);
        let gdt_blocks =
            (u64::from(sb.bg_count()) * sb.desc_size() as u64).div_ceil(blk_size);
        let reserved = u64::from(sb.s_reserved_gdt_blocks);
        for i in 0..gdt_blocks + reserved {
            mark(group_first + 1 + i);
        }
    }
    let desc = groups.desc(group)?;
    mark(desc.block_bitmap(sb));
    mark(desc.inode_bitmap(sb));
    let itable_blocks =
        (u64::from(sb.s_inodes_per_group) * sb.inode_size() as u64).div_ceil(blk_size);
    let itable = desc.inode_table(sb);
    for i in 0..itable_blocks {
        mark(itable + i);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(bits: &[bool], base: u64, per_group: u64) -> BitmapCache {
        let mut vob = Vob::new();
        vob.resize(bits.len(), false);
        for (i, &b) in bits.iter().enumerate() {
            vob.set(i, b);
        }
        BitmapCache {
            kind: BitmapKind::Block,
            bits: vob,
            base,
            per_group,
            entities: bits.len() as u64,
            dirty: vec![false; bits.len().div_ceil(per_group as usize)],
        }
    }

    #[test]
    fn find_clear_respects_base_offset() {
        let c = cache(&[true, true, false, true, false, false], 1, 6);
        assert_eq!(c.find_clear(1, 7), Some(3));
        assert_eq!(c.find_clear(4, 7), Some(5));
        assert_eq!(c.find_clear_run(1, 7, 2), Some(5));
        assert_eq!(c.find_clear_run(1, 7, 3), None);
    }

    #[test]
    fn clear_runs_are_maximal() {
        let c = cache(&[false, true, false, false, true, false], 0, 6);
        let mut runs = Vec::new();
        c.for_each_clear_run(|start, len| {
            runs.push((start, len));
            Ok(())
        })
        .unwrap();
        assert_eq!(runs, vec![(0, 1), (2, 2), (5, 1)]);
    }

    #[test]
    fn set_and_clear_track_dirty_groups() {
        let mut c = cache(&[false; 16], 0, 8);
        assert!(!c.is_dirty());
        assert!(!c.set(9).unwrap());
        assert!(c.test(9).unwrap());
        assert!(c.dirty[1]);
        assert!(!c.dirty[0]);
        assert!(c.clear(9).unwrap());
        assert_eq!(c.count_free(), 16);
    }
}
