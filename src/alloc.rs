//! Inode and block placement policy.
//!
//! Allocation favors locality: inodes are placed in their parent directory's
//! block group, data blocks in their inode's group, both falling back to a
//! linear sweep of the remaining groups. New directories spread out instead,
//! preferring the group with the most room left.
//!
//! Every successful allocation keeps the three counters in step: the bitmap
//! bit, the group descriptor's free count, and the superblock's free count.

use crate::error::{CanFail, Error, Ext4Result};
use crate::fs::Ext4Fs;
use crate::group::{BG_BLOCK_UNINIT, BG_INODE_UNINIT};
use crate::inode::InodeNo;
use crate::io::BlockDevice;

impl<D: BlockDevice> Ext4Fs<D> {
    /// Block group holding inode `ino`.
    pub(crate) fn inode_group(&self, ino: InodeNo) -> u32 {
        (ino - 1) / self.sb.s_inodes_per_group
    }

    /// Block group holding block `blk`.
    pub(crate) fn block_group(&self, blk: u64) -> u32 {
        ((blk - u64::from(self.sb.s_first_data_block)) / u64::from(self.sb.s_blocks_per_group))
            as u32
    }

    /// Preferred allocation target for data belonging to `ino`: the first
    /// data block of its group.
    pub(crate) fn inode_goal(&self, ino: InodeNo) -> u64 {
        let group = self.inode_group(ino).min(self.groups.count() - 1);
        u64::from(self.sb.s_first_data_block)
            + u64::from(group) * u64::from(self.sb.s_blocks_per_group)
    }

    /// Picks and claims a free inode number.
    ///
    /// Regular files start searching in `parent`'s group; directories prefer
    /// the group with the most free inodes and blocks.
    pub(crate) fn alloc_inode(&mut self, parent: InodeNo, directory: bool) -> Ext4Result<InodeNo> {
        if self.sb.s_free_inodes_count == 0 {
            return Err(Error::NoSpace);
        }
        let group_count = self.groups.count();
        let start_group = if directory {
            self.best_group_for_directory()?
        } else {
            self.inode_group(parent)
        };

        for i in 0..group_count {
            let group = (start_group + i) % group_count;
            if self.groups.desc(group)?.free_inodes_count(&self.sb) == 0 {
                continue;
            }
            let (first, last) = self.inode_bitmap.group_span(group);
            let from = first.max(u64::from(self.sb.first_ino()));
            let Some(ino) = self.inode_bitmap.find_clear(from, last) else {
                continue;
            };
            let ino = ino as InodeNo;
            self.claim_inode(ino, directory)?;
            return Ok(ino);
        }
        Err(Error::NoSpace)
    }

    /// Orlov-style spread: the group with the most free inodes, free blocks
    /// breaking ties.
    fn best_group_for_directory(&self) -> Ext4Result<u32> {
        let mut best = 0u32;
        let mut best_score = (0u32, 0u32);
        for group in 0..self.groups.count() {
            let desc = self.groups.desc(group)?;
            let score = (
                desc.free_inodes_count(&self.sb),
                desc.free_blocks_count(&self.sb),
            );
            if score > best_score {
                best_score = score;
                best = group;
            }
        }
        Ok(best)
    }

    /// Marks `ino` in use and updates every counter.
    fn claim_inode(&mut self, ino: InodeNo, directory: bool) -> CanFail {
        if self.inode_bitmap.set(u64::from(ino))? {
            return Err(Error::Corrupted("allocated inode already in use"));
        }
        let group = self.inode_group(ino);
        let index = (ino - 1) % self.sb.s_inodes_per_group;
        let sb = self.sb;
        let desc = self.groups.desc_mut(group)?;
        let free = desc.free_inodes_count(&sb);
        desc.set_free_inodes_count(&sb, free.saturating_sub(1));
        if directory {
            let dirs = desc.used_dirs_count(&sb);
            desc.set_used_dirs_count(&sb, dirs + 1);
        }
        // The slot may sit in the never-used tail of the table.
        let unused = desc.itable_unused(&sb);
        if sb.s_inodes_per_group - index <= unused {
            desc.set_itable_unused(&sb, sb.s_inodes_per_group - index - 1);
        }
        desc.bg_flags &= !BG_INODE_UNINIT;
        self.sb.s_free_inodes_count -= 1;
        self.sb_dirty = true;
        Ok(())
    }

    /// Returns `ino` to the free pool.
    pub(crate) fn release_inode(&mut self, ino: InodeNo, directory: bool) -> CanFail {
        if !self.inode_bitmap.clear(u64::from(ino))? {
            return Err(Error::Corrupted("freed inode not in use"));
        }
        let group = self.inode_group(ino);
        let sb = self.sb;
        let desc = self.groups.desc_mut(group)?;
        let free = desc.free_inodes_count(&sb);
        desc.set_free_inodes_count(&sb, free + 1);
        if directory {
            let dirs = desc.used_dirs_count(&sb);
            desc.set_used_dirs_count(&sb, dirs.saturating_sub(1));
        }
        desc.bg_flags &= !BG_INODE_UNINIT;
        self.sb.s_free_inodes_count += 1;
        self.sb_dirty = true;
        Ok(())
    }

    /// Picks and claims one free block, preferring the neighborhood of
    /// `goal`.
    pub(crate) fn alloc_block(&mut self, goal: u64) -> Ext4Result<u64> {
        self.alloc_block_run(goal, 1)
    }

    /// Claims the first free run of `len` blocks at or after `goal`,
    /// sweeping the remaining groups when the goal's group is exhausted.
    /// Returns the first block of the run.
    pub(crate) fn alloc_block_run(&mut self, goal: u64, len: u64) -> Ext4Result<u64> {
        if self.sb.free_blk_count() < len {
            return Err(Error::NoSpace);
        }
        let group_count = self.groups.count();
        let first_data = u64::from(self.sb.s_first_data_block);
        let goal = goal.clamp(first_data, self.sb.blk_count() - 1);
        let start_group = self.block_group(goal);

        for i in 0..group_count {
            let group = (start_group + i) % group_count;
            if self.groups.desc(group)?.free_blocks_count(&self.sb) < len as u32 {
                continue;
            }
            let (first, last) = self.block_bitmap.group_span(group);
            let from = if i == 0 { goal.max(first) } else { first };
            let Some(blk) = self.block_bitmap.find_clear_run(from, last, len) else {
                // the goal may bisect the only free run; retry the whole group
                if i == 0 {
                    if let Some(blk) = self.block_bitmap.find_clear_run(first, last, len) {
                        self.claim_blocks(blk, len)?;
                        return Ok(blk);
                    }
                }
                continue;
            };
            self.claim_blocks(blk, len)?;
            return Ok(blk);
        }
        Err(Error::NoSpace)
    }

    fn claim_blocks(&mut self, start: u64, len: u64) -> CanFail {
        for blk in start..start + len {
            if self.block_bitmap.set(blk)? {
                return Err(Error::Corrupted("allocated block already in use"));
            }
            let group = self.block_group(blk);
            let sb = self.sb;
            let desc = self.groups.desc_mut(group)?;
            let free = desc.free_blocks_count(&sb);
            desc.set_free_blocks_count(&sb, free.saturating_sub(1));
            desc.bg_flags &= !BG_BLOCK_UNINIT;
        }
        self.sb.set_free_blk_count(self.sb.free_blk_count() - len);
        self.sb_dirty = true;
        self.trim_clean = false;
        Ok(())
    }

    /// Returns `len` blocks starting at `start` to the free pool.
    pub(crate) fn free_blocks(&mut self, start: u64, len: u64) -> CanFail {
        for blk in start..start + len {
            if !self.block_bitmap.clear(blk)? {
                return Err(Error::Corrupted("freed block not in use"));
            }
            let group = self.block_group(blk);
            let sb = self.sb;
            let desc = self.groups.desc_mut(group)?;
            let free = desc.free_blocks_count(&sb);
            desc.set_free_blocks_count(&sb, free + 1);
            desc.bg_flags &= !BG_BLOCK_UNINIT;
        }
        self.sb.set_free_blk_count(self.sb.free_blk_count() + len);
        self.sb_dirty = true;
        self.trim_clean = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::fs::tests::scratch_fs;

    #[test]
    fn block_allocation_updates_all_counters() {
        let mut fs = scratch_fs();
        let sb_free = fs.sb.free_blk_count();
        let desc_free = fs.groups.desc(0).unwrap().free_blocks_count(&fs.sb);

        let blk = fs.alloc_block(fs.inode_goal(12)).unwrap();
        assert!(fs.block_bitmap.test(blk).unwrap());
        assert_eq!(fs.sb.free_blk_count(), sb_free - 1);
        assert_eq!(
            fs.groups.desc(0).unwrap().free_blocks_count(&fs.sb),
            desc_free - 1
        );

        fs.free_blocks(blk, 1).unwrap();
        assert_eq!(fs.sb.free_blk_count(), sb_free);
        assert!(!fs.block_bitmap.test(blk).unwrap());
    }

    #[test]
    fn inode_allocation_skips_reserved_range() {
        let mut fs = scratch_fs();
        let ino = fs.alloc_inode(2, false).unwrap();
        assert!(ino >= fs.sb.first_ino());
        assert!(fs.inode_bitmap.test(u64::from(ino)).unwrap());

        fs.release_inode(ino, false).unwrap();
        assert!(!fs.inode_bitmap.test(u64::from(ino)).unwrap());
    }

    #[test]
    fn double_free_is_reported_as_corruption() {
        let mut fs = scratch_fs();
        let blk = fs.alloc_block(fs.inode_goal(12)).unwrap();
        fs.free_blocks(blk, 1).unwrap();
        assert!(matches!(
            fs.free_blocks(blk, 1),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let mut fs = scratch_fs();
        let free = fs.sb.free_blk_count();
        for _ in 0..free {
            fs.alloc_block(0).unwrap();
        }
        assert!(matches!(fs.alloc_block(0), Err(Error::NoSpace)));
    }
}
