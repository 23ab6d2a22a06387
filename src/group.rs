//! Block group descriptor table.
//!
//! One descriptor per block group, stored contiguously starting at the block
//! after the superblock. Descriptors are 32 bytes, or `s_desc_size` (64)
//! when the `64BIT` feature is enabled; the record below models the full
//! 64-byte layout and only its first half is read or written on 32-byte
//! filesystems.

use bytemuck::{bytes_of, bytes_of_mut, Pod, Zeroable};

use crate::error::{CanFail, Error, Ext4Result};
use crate::io::{BlockDevice, IoChannel};
use crate::sb::{crc32c_raw, RoCompatFeatures, Superblock};

/// `bg_flags`: the inode table and bitmap are not initialized.
pub const BG_INODE_UNINIT: u16 = 0x1;
/// `bg_flags`: the block bitmap is not initialized.
pub const BG_BLOCK_UNINIT: u16 = 0x2;
/// `bg_flags`: the inode table has been zeroed.
pub const BG_INODE_ZEROED: u16 = 0x4;

/// crc16 (IBM/ANSI, reflected 0xA001) used by the older `gdt_csum` group
/// descriptor checksums.
fn crc16(mut crc: u16, buf: &[u8]) -> u16 {
    for &b in buf {
        crc ^= u16::from(b);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// On-disk group descriptor, full 64-byte layout.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GroupDescriptor {
    /// Block bitmap location, low 32 bits.
    pub bg_block_bitmap_lo: u32,
    /// Inode bitmap location, low 32 bits.
    pub bg_inode_bitmap_lo: u32,
    /// Inode table location, low 32 bits.
    pub bg_inode_table_lo: u32,
    /// Free blocks in the group, low 16 bits.
    pub bg_free_blocks_count_lo: u16,
    /// Free inodes in the group, low 16 bits.
    pub bg_free_inodes_count_lo: u16,
    /// Directories in the group, low 16 bits.
    pub bg_used_dirs_count_lo: u16,
    /// Initialization state flags.
    pub bg_flags: u16,
    /// Snapshot exclude bitmap, low 32 bits.
    pub bg_exclude_bitmap_lo: u32,
    /// Block bitmap checksum, low 16 bits.
    pub bg_block_bitmap_csum_lo: u16,
    /// Inode bitmap checksum, low 16 bits.
    pub bg_inode_bitmap_csum_lo: u16,
    /// Never-used trailing inodes, low 16 bits.
    pub bg_itable_unused_lo: u16,
    /// Descriptor checksum.
    pub bg_checksum: u16,

    /// Block bitmap location, high 32 bits.
    pub bg_block_bitmap_hi: u32,
    /// Inode bitmap location, high 32 bits.
    pub bg_inode_bitmap_hi: u32,
    /// Inode table location, high 32 bits.
    pub bg_inode_table_hi: u32,
    /// Free blocks in the group, high 16 bits.
    pub bg_free_blocks_count_hi: u16,
    /// Free inodes in the group, high 16 bits.
    pub bg_free_inodes_count_hi: u16,
    /// Directories in the group, high 16 bits.
    pub bg_used_dirs_count_hi: u16,
    /// Never-used trailing inodes, high 16 bits.
    pub bg_itable_unused_hi: u16,
    /// Snapshot exclude bitmap, high 32 bits.
    pub bg_exclude_bitmap_hi: u32,
    /// Block bitmap checksum, high 16 bits.
    pub bg_block_bitmap_csum_hi: u16,
    /// Inode bitmap checksum, high 16 bits.
    pub bg_inode_bitmap_csum_hi: u16,
    pub bg_reserved: u32,
}

const _: () = assert!(core::mem::size_of::<GroupDescriptor>() == 64);

impl GroupDescriptor {
    fn is_64bit(sb: &Superblock) -> bool {
        sb.desc_size() >= 64
    }

    /// Block number of the group's block bitmap.
    pub fn block_bitmap(&self, sb: &Superblock) -> u64 {
        if Self::is_64bit(sb) {
            u64::from(self.bg_block_bitmap_lo) | (u64::from(self.bg_block_bitmap_hi) << 32)
        } else {
            u64::from(self.bg_block_bitmap_lo)
        }
    }

    /// Block number of the group's inode bitmap.
    pub fn inode_bitmap(&self, sb: &Superblock) -> u64 {
        if Self::is_64bit(sb) {
            u64::from(self.bg_inode_bitmap_lo) | (u64::from(self.bg_inode_bitmap_hi) << 32)
        } else {
            u64::from(self.bg_inode_bitmap_lo)
        }
    }

    /// Block number of the first inode table block.
    pub fn inode_table(&self, sb: &Superblock) -> u64 {
        if Self::is_64bit(sb) {
            u64::from(self.bg_inode_table_lo) | (u64::from(self.bg_inode_table_hi) << 32)
        } else {
            u64::from(self.bg_inode_table_lo)
        }
    }

    /// Free blocks in the group.
    pub fn free_blocks_count(&self, sb: &Superblock) -> u32 {
        if Self::is_64bit(sb) {
            u32::from(self.bg_free_blocks_count_lo)
                | (u32::from(self.bg_free_blocks_count_hi) << 16)
        } else {
            u32::from(self.bg_free_blocks_count_lo)
        }
    }

    /// Replaces the free block count.
    pub fn set_free_blocks_count(&mut self, sb: &Superblock, count: u32) {
        self.bg_free_blocks_count_lo = count as u16;
        if Self::is_64bit(sb) {
            self.bg_free_blocks_count_hi = (count >> 16) as u16;
        }
    }

    /// Free inodes in the group.
    pub fn free_inodes_count(&self, sb: &Superblock) -> u32 {
        if Self::is_64bit(sb) {
            u32::from(self.bg_free_inodes_count_lo)
                | (u32::from(self.bg_free_inodes_count_hi) << 16)
        } else {
            u32::from(self.bg_free_inodes_count_lo)
        }
    }

    /// Replaces the free inode count.
    pub fn set_free_inodes_count(&mut self, sb: &Superblock, count: u32) {
        self.bg_free_inodes_count_lo = count as u16;
        if Self::is_64bit(sb) {
            self.bg_free_inodes_count_hi = (count >> 16) as u16;
        }
    }

    /// Directory count in the group.
    pub fn used_dirs_count(&self, sb: &Superblock) -> u32 {
        if Self::is_64bit(sb) {
            u32::from(self.bg_used_dirs_count_lo) | (u32::from(self.bg_used_dirs_count_hi) << 16)
        } else {
            u32::from(self.bg_used_dirs_count_lo)
        }
    }

    /// Replaces the directory count.
    pub fn set_used_dirs_count(&mut self, sb: &Superblock, count: u32) {
        self.bg_used_dirs_count_lo = count as u16;
        if Self::is_64bit(sb) {
            self.bg_used_dirs_count_hi = (count >> 16) as u16;
        }
    }

    /// Count of never-used inodes at the end of the group's table.
    pub fn itable_unused(&self, sb: &Superblock) -> u32 {
        if Self::is_64bit(sb) {
            u32::from(self.bg_itable_unused_lo) | (u32::from(self.bg_itable_unused_hi) << 16)
        } else {
            u32::from(self.bg_itable_unused_lo)
        }
    }

    /// Replaces the never-used inode count.
    pub fn set_itable_unused(&mut self, sb: &Superblock, count: u32) {
        self.bg_itable_unused_lo = count as u16;
        if Self::is_64bit(sb) {
            self.bg_itable_unused_hi = (count >> 16) as u16;
        }
    }

    /// Recomputes `bg_checksum` for group `group` under whichever checksum
    /// scheme the filesystem uses. A no-op when neither is enabled.
    pub fn update_chksum(&mut self, sb: &Superblock, group: u32) {
        self.bg_checksum = 0;
        let desc_size = sb.desc_size();
        let raw = bytes_of(self);
        let csum_off = core::mem::offset_of!(GroupDescriptor, bg_checksum);
        if sb.metadata_csum() {
            let mut crc = crc32c_raw(sb.chksum_seed(), &group.to_le_bytes());
            crc = crc32c_raw(crc, &raw[..csum_off]);
            // the checksum field itself counts as zero
            crc = crc32c_raw(crc, &[0u8; 2]);
            if desc_size > 32 {
                crc = crc32c_raw(crc, &raw[csum_off + 2..desc_size]);
            }
            self.bg_checksum = crc as u16;
        } else if sb.has_ro_compat(RoCompatFeatures::GDT_CSUM) {
            let mut crc = crc16(!0, &sb.s_uuid);
            crc = crc16(crc, &group.to_le_bytes());
            crc = crc16(crc, &raw[..csum_off]);
            if desc_size > 32 {
                crc = crc16(crc, &raw[csum_off + 2..desc_size]);
            }
            self.bg_checksum = crc;
        }
    }
}

/// Whether `group` holds a superblock backup.
///
/// Under `sparse_super`, backups exist only in groups 0, 1 and powers of 3,
/// 5 and 7; otherwise every group has one.
pub fn bg_has_super(sb: &Superblock, group: u32) -> bool {
    if !sb.has_ro_compat(RoCompatFeatures::SPARSE_SUPER) {
        return true;
    }
    if group <= 1 {
        return true;
    }
    [3u32, 5, 7]
        .iter()
        .any(|&base| {
            let mut n = base;
            while n < group {
                n = n.saturating_mul(base);
            }
            n == group
        })
}

/// The in-memory group descriptor table, with per-descriptor dirty tracking.
#[derive(Debug)]
pub struct GroupTable {
    descs: Vec<GroupDescriptor>,
    dirty: Vec<bool>,
}

impl GroupTable {
    /// Block number of the first descriptor table block.
    fn table_start(sb: &Superblock) -> u64 {
        u64::from(sb.s_first_data_block) + 1
    }

    /// Reads the whole descriptor table.
    pub fn load<D: BlockDevice>(io: &mut IoChannel<D>, sb: &Superblock) -> Ext4Result<Self> {
        let count = sb.bg_count() as usize;
        let desc_size = sb.desc_size();
        let table_bytes = count * desc_size;
        let blk_size = sb.blk_size() as usize;
        let table_blocks = table_bytes.div_ceil(blk_size);

        let mut raw = vec![0u8; table_blocks * blk_size];
        io.read_blocks(Self::table_start(sb), &mut raw)?;

        let mut descs = Vec::with_capacity(count);
        for i in 0..count {
            let mut desc = GroupDescriptor::zeroed();
            let src = &raw[i * desc_size..(i + 1) * desc_size];
            bytes_of_mut(&mut desc)[..desc_size].copy_from_slice(src);
            descs.push(desc);
        }
        Ok(Self {
            dirty: vec![false; count],
            descs,
        })
    }

    /// Builds a table directly from descriptors, bypassing the disk.
    #[cfg(test)]
    pub(crate) fn from_descs(descs: Vec<GroupDescriptor>) -> Self {
        Self {
            dirty: vec![false; descs.len()],
            descs,
        }
    }

    /// Number of descriptors.
    pub fn count(&self) -> u32 {
        self.descs.len() as u32
    }

    /// Borrows the descriptor for `group`.
    pub fn desc(&self, group: u32) -> Ext4Result<&GroupDescriptor> {
        self.descs
            .get(group as usize)
            .ok_or(Error::Corrupted("block group out of range"))
    }

    /// Mutably borrows the descriptor for `group` and marks it dirty.
    pub fn desc_mut(&mut self, group: u32) -> Ext4Result<&mut GroupDescriptor> {
        let desc = self
            .descs
            .get_mut(group as usize)
            .ok_or(Error::Corrupted("block group out of range"))?;
        self.dirty[group as usize] = true;
        Ok(desc)
    }

    /// Whether any descriptor needs write-back.
    pub fn is_dirty(&self) -> bool {
        self.dirty.iter().any(|&d| d)
    }

    /// Writes back every dirty descriptor and clears the dirty flags.
    pub fn flush<D: BlockDevice>(&mut self, io: &mut IoChannel<D>, sb: &Superblock) -> CanFail {
        let desc_size = sb.desc_size();
        let table_off = Self::table_start(sb) * sb.blk_size();
        for (i, desc) in self.descs.iter_mut().enumerate() {
            if !self.dirty[i] {
                continue;
            }
            desc.update_chksum(sb, i as u32);
            let raw = &bytes_of(desc)[..desc_size];
            io.write_bytes(table_off + (i * desc_size) as u64, raw)?;
            self.dirty[i] = false;
        }
        Ok(())
    }
}
