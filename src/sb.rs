//! Superblock parsing, validation and write-back.
//!
//! The superblock lives in the 1024 bytes at byte offset 1024 and describes
//! the filesystem geometry and feature set. A copy is kept in other block
//! groups, but the engine only ever reads and rewrites the primary one (or an
//! explicitly requested backup).

use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};

use crate::error::{CanFail, Error, Ext4Result};
use crate::io::{BlockDevice, IoChannel};

/// The ext2/3/4 magic signature.
pub const EXT4_SIGNATURE: u16 = 0xEF53;

/// Byte offset of the primary superblock.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

/// Size of the on-disk superblock record.
pub const SUPERBLOCK_SIZE: usize = 1024;

/// Only checksum algorithm defined for `metadata_csum`.
pub const CHKSUM_TYPE_CRC32C: u8 = 0x1;

/// crc32c in the on-disk convention: seeded, never finalized.
///
/// The `crc32c` crate exposes the finalized CRC-32C; the ext family chains
/// unfinalized values, so both conversions are undone around the call.
pub(crate) fn crc32c_raw(seed: u32, buf: &[u8]) -> u32 {
    !crc32c::crc32c_append(!seed, buf)
}

/// Defines an on-disk feature word with set-style helpers.
macro_rules! feature_word {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Empty feature set.
            pub const EMPTY_SET: Self = Self(0);

            /// Checks if this set is a subset of `features`.
            pub fn is_subset_of(self, features: Self) -> bool {
                self.0 & !features.0 == 0
            }

            /// Checks if this set includes every flag of `features`.
            pub fn includes(self, features: Self) -> bool {
                features.is_subset_of(self)
            }

            /// Returns the flags of `self` not present in `features`.
            pub fn difference(self, features: Self) -> Self {
                Self(self.0 & !features.0)
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

feature_word!(
    /// Compatible feature set: the engine may read and write the filesystem
    /// even without understanding every flag.
    CompatFeatures
);

impl CompatFeatures {
    /// Directory preallocation.
    pub const DIR_PREALLOC: Self = Self(0x0001);

    /// A journal file exists (harmless for a clean filesystem).
    pub const HAS_JOURNAL: Self = Self(0x0004);

    /// Extended attributes.
    pub const EXT_ATTR: Self = Self(0x0008);

    /// Space reserved for group descriptor table growth.
    pub const RESIZE_INODE: Self = Self(0x0010);

    /// Hashed B-tree directory indexes.
    pub const DIR_INDEX: Self = Self(0x0020);
}

feature_word!(
    /// Read-only compatible feature set: unknown flags force a read-only
    /// mount.
    RoCompatFeatures
);

impl RoCompatFeatures {
    /// Backup superblocks only in a subset of groups.
    pub const SPARSE_SUPER: Self = Self(0x0001);

    /// Files larger than 2 GiB exist (`i_size_high` is meaningful).
    pub const LARGE_FILE: Self = Self(0x0002);

    /// Files larger than 2 TiB (`i_blocks` in filesystem blocks).
    pub const HUGE_FILE: Self = Self(0x0008);

    /// Group descriptors carry checksums.
    pub const GDT_CSUM: Self = Self(0x0010);

    /// The 65000 link limit on directories is lifted.
    pub const DIR_NLINK: Self = Self(0x0020);

    /// Inodes reserve space for extended metadata (ns timestamps, crtime).
    pub const EXTRA_ISIZE: Self = Self(0x0040);

    /// All metadata is checksummed.
    pub const METADATA_CSUM: Self = Self(0x0400);
}

feature_word!(
    /// Incompatible feature set: the engine refuses to mount when any flag it
    /// does not implement is present.
    IncompatFeatures
);

impl IncompatFeatures {
    /// Compression (not implemented anywhere).
    pub const COMPRESSION: Self = Self(0x0001);

    /// Directory entries carry a file-type byte.
    pub const FILETYPE: Self = Self(0x0002);

    /// The journal needs replay.
    pub const RECOVER: Self = Self(0x0004);

    /// This device holds an external journal.
    pub const JOURNAL_DEV: Self = Self(0x0008);

    /// Meta block groups.
    pub const META_BG: Self = Self(0x0010);

    /// Inodes may map their data with extent trees.
    pub const EXTENTS: Self = Self(0x0040);

    /// More than 2^32 blocks; 64-byte group descriptors.
    pub const B64BIT: Self = Self(0x0080);

    /// Multiple-mount protection.
    pub const MMP: Self = Self(0x0100);

    /// Flexible block groups (metadata may live outside its own group).
    pub const FLEX_BG: Self = Self(0x0200);

    /// Small file bodies stored in the inode itself.
    pub const INLINE_DATA: Self = Self(0x8000);

    /// Encrypted inodes.
    pub const ENCRYPT: Self = Self(0x10000);

    /// Every incompat flag this engine implements.
    pub const SUPPORTED: Self = Self(
        Self::FILETYPE.0 | Self::EXTENTS.0 | Self::B64BIT.0 | Self::FLEX_BG.0
            | Self::INLINE_DATA.0,
    );
}

/// The on-disk superblock, in the revision-1 dynamic layout.
///
/// 64-bit quantities are split into `lo`/`hi` pairs so the record stays free
/// of padding and alignment requirements above four bytes.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// Total inode count.
    pub s_inodes_count: u32,
    /// Total block count, low 32 bits.
    pub s_blocks_count_lo: u32,
    /// Blocks reserved for the superuser, low 32 bits.
    pub s_r_blocks_count_lo: u32,
    /// Free block count, low 32 bits.
    pub s_free_blocks_count_lo: u32,
    /// Free inode count.
    pub s_free_inodes_count: u32,
    /// First data block (1 for 1 KiB blocks, 0 otherwise).
    pub s_first_data_block: u32,
    /// `log2(block_size) - 10`.
    pub s_log_block_size: u32,
    /// `log2(cluster_size) - 10`.
    pub s_log_cluster_size: u32,
    /// Blocks per group.
    pub s_blocks_per_group: u32,
    /// Clusters per group.
    pub s_clusters_per_group: u32,
    /// Inodes per group.
    pub s_inodes_per_group: u32,
    /// Last mount time.
    pub s_mtime: u32,
    /// Last write time.
    pub s_wtime: u32,
    /// Mounts since the last fsck.
    pub s_mnt_count: u16,
    /// Mounts allowed between fscks.
    pub s_max_mnt_count: u16,
    /// Magic signature, `0xEF53`.
    pub s_magic: u16,
    /// Filesystem state.
    pub s_state: u16,
    /// Behaviour when detecting errors.
    pub s_errors: u16,
    /// Minor revision level.
    pub s_minor_rev_level: u16,
    /// Time of the last fsck.
    pub s_lastcheck: u32,
    /// Maximum time between fscks.
    pub s_checkinterval: u32,
    /// Creator OS.
    pub s_creator_os: u32,
    /// Revision level.
    pub s_rev_level: u32,
    /// Default uid for reserved blocks.
    pub s_def_resuid: u16,
    /// Default gid for reserved blocks.
    pub s_def_resgid: u16,

    // Dynamic-revision fields. Readers must check `s_rev_level` before
    // trusting anything below.
    /// First non-reserved inode.
    pub s_first_ino: u32,
    /// Size of an inode record.
    pub s_inode_size: u16,
    /// Group number of this superblock copy.
    pub s_block_group_nr: u16,
    /// Compatible features.
    pub s_feature_compat: CompatFeatures,
    /// Incompatible features.
    pub s_feature_incompat: IncompatFeatures,
    /// Read-only compatible features.
    pub s_feature_ro_compat: RoCompatFeatures,
    /// Filesystem UUID.
    pub s_uuid: [u8; 16],
    /// Volume label.
    pub s_volume_name: [u8; 16],
    /// Path of the last mount point.
    pub s_last_mounted: [u8; 64],
    /// Compression algorithms in use.
    pub s_algorithm_usage_bitmap: u32,
    /// Blocks preallocated to files.
    pub s_prealloc_blocks: u8,
    /// Blocks preallocated to directories.
    pub s_prealloc_dir_blocks: u8,
    /// Blocks reserved for future group descriptor growth.
    pub s_reserved_gdt_blocks: u16,
    /// Journal superblock UUID.
    pub s_journal_uuid: [u8; 16],
    /// Journal file inode.
    pub s_journal_inum: u32,
    /// Journal device number.
    pub s_journal_dev: u32,
    /// Head of the orphan inode list.
    pub s_last_orphan: u32,
    /// HTREE hash seed.
    pub s_hash_seed: [u32; 4],
    /// Default hash algorithm for directories.
    pub s_def_hash_version: u8,
    /// Journal backup type.
    pub s_jnl_backup_type: u8,
    /// Group descriptor size under `64BIT`.
    pub s_desc_size: u16,
    /// Default mount options.
    pub s_default_mount_opts: u32,
    /// First meta block group.
    pub s_first_meta_bg: u32,
    /// Filesystem creation time.
    pub s_mkfs_time: u32,
    /// Backup of the journal inode's `i_block` and size.
    pub s_jnl_blocks: [u32; 17],

    // 64BIT fields.
    /// Total block count, high 32 bits.
    pub s_blocks_count_hi: u32,
    /// Reserved block count, high 32 bits.
    pub s_r_blocks_count_hi: u32,
    /// Free block count, high 32 bits.
    pub s_free_blocks_count_hi: u32,
    /// Every inode has at least this much extra space.
    pub s_min_extra_isize: u16,
    /// New inodes should reserve this much extra space.
    pub s_want_extra_isize: u16,
    /// Miscellaneous flags.
    pub s_flags: u32,
    /// RAID stride.
    pub s_raid_stride: u16,
    /// Seconds between multi-mount protection checks.
    pub s_mmp_update_interval: u16,
    /// Block holding the multi-mount protection record.
    pub s_mmp_block: [u32; 2],
    /// RAID stripe width.
    pub s_raid_stripe_width: u32,
    /// `log2(groups_per_flex)`.
    pub s_log_groups_per_flex: u8,
    /// Metadata checksum algorithm (1 = crc32c).
    pub s_checksum_type: u8,
    pub s_reserved_pad: u16,
    /// Lifetime KiB written.
    pub s_kbytes_written: [u32; 2],

    /// Fields the engine carries through untouched.
    pub s_reserved: [u32; 159],
    /// crc32c of this record, when `metadata_csum` is enabled.
    pub s_checksum: u32,
}

// The record must project exactly onto its on-disk footprint.
const _: () = assert!(core::mem::size_of::<Superblock>() == SUPERBLOCK_SIZE);

impl Superblock {
    /// Reads and validates the superblock.
    ///
    /// `superblock_num` overrides the location for backup copies; zero means
    /// the primary superblock at byte 1024. `block_size` must accompany a
    /// non-zero `superblock_num` since the geometry is not yet known.
    pub fn read<D: BlockDevice>(
        io: &mut IoChannel<D>,
        superblock_num: u64,
        block_size: u32,
    ) -> Ext4Result<Self> {
        let offset = if superblock_num == 0 {
            SUPERBLOCK_OFFSET
        } else {
            superblock_num * u64::from(block_size)
        };
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        io.read_bytes(offset, &mut raw)?;

        let sb: Superblock = *from_bytes(&raw);
        sb.validate()?;
        Ok(sb)
    }

    /// Structural validation of a freshly read superblock.
    pub fn validate(&self) -> CanFail {
        if self.s_magic != EXT4_SIGNATURE {
            return Err(Error::Corrupted("bad superblock magic"));
        }
        if self.s_log_block_size > 6 {
            return Err(Error::Corrupted("unreasonable block size"));
        }
        // directory records encode their length in 16 bits; a 64 KiB block
        // cannot hold a block-spanning record
        if self.s_log_block_size > 5 {
            return Err(Error::Unsupported("block size above 32 KiB"));
        }
        let bits_per_blk = self.blk_size() * 8;
        if self.s_blocks_per_group == 0 || u64::from(self.s_blocks_per_group) > bits_per_blk {
            return Err(Error::Corrupted("blocks per group out of range"));
        }
        if self.s_inodes_per_group == 0 || u64::from(self.s_inodes_per_group) > bits_per_blk {
            return Err(Error::Corrupted("inodes per group out of range"));
        }
        if self.s_rev_level >= 1 {
            let isize = self.s_inode_size;
            if !isize.is_power_of_two() || isize < 128 || u64::from(isize) > self.blk_size() {
                return Err(Error::Corrupted("invalid inode size"));
            }
        }
        if self.s_checksum_type == CHKSUM_TYPE_CRC32C && !self.verify_chksum() {
            return Err(Error::Corrupted("superblock checksum mismatch"));
        }
        let unsupported = self.s_feature_incompat.difference(IncompatFeatures::SUPPORTED);
        if unsupported != IncompatFeatures::EMPTY_SET {
            log::warn!(
                "refusing to mount: unsupported incompat features {:#x}",
                unsupported.0
            );
            return Err(Error::Unsupported("incompatible feature set"));
        }
        Ok(())
    }

    /// Writes the record back to its primary location.
    pub fn write<D: BlockDevice>(&mut self, io: &mut IoChannel<D>) -> CanFail {
        if self.s_checksum_type == CHKSUM_TYPE_CRC32C {
            self.update_chksum();
        }
        io.write_bytes(SUPERBLOCK_OFFSET, bytes_of(self))
    }

    /// The block size, in bytes.
    pub fn blk_size(&self) -> u64 {
        1024 << self.s_log_block_size
    }

    /// Whether the given incompat feature is enabled.
    pub fn has_incompat(&self, feature: IncompatFeatures) -> bool {
        self.s_feature_incompat.includes(feature)
    }

    /// Whether the given read-only compat feature is enabled.
    pub fn has_ro_compat(&self, feature: RoCompatFeatures) -> bool {
        self.s_feature_ro_compat.includes(feature)
    }

    /// Total block count, `64BIT`-aware.
    pub fn blk_count(&self) -> u64 {
        if self.has_incompat(IncompatFeatures::B64BIT) {
            u64::from(self.s_blocks_count_lo) | (u64::from(self.s_blocks_count_hi) << 32)
        } else {
            u64::from(self.s_blocks_count_lo)
        }
    }

    /// Free block count, `64BIT`-aware.
    pub fn free_blk_count(&self) -> u64 {
        if self.has_incompat(IncompatFeatures::B64BIT) {
            u64::from(self.s_free_blocks_count_lo)
                | (u64::from(self.s_free_blocks_count_hi) << 32)
        } else {
            u64::from(self.s_free_blocks_count_lo)
        }
    }

    /// Replaces the free block count.
    pub fn set_free_blk_count(&mut self, count: u64) {
        self.s_free_blocks_count_lo = count as u32;
        if self.has_incompat(IncompatFeatures::B64BIT) {
            self.s_free_blocks_count_hi = (count >> 32) as u32;
        }
    }

    /// Number of block groups.
    pub fn bg_count(&self) -> u32 {
        let data_blocks = self.blk_count() - u64::from(self.s_first_data_block);
        data_blocks.div_ceil(u64::from(self.s_blocks_per_group)) as u32
    }

    /// Size of one group descriptor, in bytes.
    pub fn desc_size(&self) -> usize {
        if self.has_incompat(IncompatFeatures::B64BIT) && self.s_desc_size >= 64 {
            usize::from(self.s_desc_size)
        } else {
            32
        }
    }

    /// Size of one inode record, in bytes.
    pub fn inode_size(&self) -> usize {
        if self.s_rev_level >= 1 {
            usize::from(self.s_inode_size)
        } else {
            128
        }
    }

    /// First inode number available for regular allocation.
    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level >= 1 {
            self.s_first_ino.max(11)
        } else {
            11
        }
    }

    /// Seed for metadata checksums: `crc32c(~0, uuid)`.
    pub fn chksum_seed(&self) -> u32 {
        crc32c_raw(!0, &self.s_uuid)
    }

    /// Whether metadata checksums are maintained on this filesystem.
    pub fn metadata_csum(&self) -> bool {
        self.has_ro_compat(RoCompatFeatures::METADATA_CSUM)
    }

    /// Compares the stored checksum against the record contents.
    pub fn verify_chksum(&self) -> bool {
        let computed = self.compute_chksum();
        if computed != self.s_checksum {
            log::error!(
                "invalid superblock checksum (got {computed:#010x}, expected {:#010x})",
                self.s_checksum
            );
            return false;
        }
        true
    }

    /// Recomputes the checksum field from the current contents.
    pub fn update_chksum(&mut self) {
        self.s_checksum = self.compute_chksum();
    }

    fn compute_chksum(&self) -> u32 {
        let raw = bytes_of(self);
        crc32c_raw(!0, &raw[..SUPERBLOCK_SIZE - 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn record_layout_matches_disk_offsets() {
        assert_eq!(offset_of!(Superblock, s_magic), 0x38);
        assert_eq!(offset_of!(Superblock, s_first_ino), 0x54);
        assert_eq!(offset_of!(Superblock, s_feature_incompat), 0x60);
        assert_eq!(offset_of!(Superblock, s_uuid), 0x68);
        assert_eq!(offset_of!(Superblock, s_algorithm_usage_bitmap), 0xC8);
        assert_eq!(offset_of!(Superblock, s_hash_seed), 0xEC);
        assert_eq!(offset_of!(Superblock, s_desc_size), 0xFE);
        assert_eq!(offset_of!(Superblock, s_jnl_blocks), 0x10C);
        assert_eq!(offset_of!(Superblock, s_blocks_count_hi), 0x150);
        assert_eq!(offset_of!(Superblock, s_flags), 0x160);
        assert_eq!(offset_of!(Superblock, s_checksum), 0x3FC);
    }

    #[test]
    fn unsupported_incompat_features_are_rejected() {
        let mut sb = Superblock::zeroed();
        sb.s_magic = EXT4_SIGNATURE;
        sb.s_blocks_per_group = 8192;
        sb.s_inodes_per_group = 1024;
        sb.s_feature_incompat = IncompatFeatures::FILETYPE | IncompatFeatures::ENCRYPT;
        assert!(matches!(
            sb.validate(),
            Err(Error::Unsupported(_))
        ));

        sb.s_feature_incompat = IncompatFeatures::FILETYPE | IncompatFeatures::EXTENTS;
        sb.validate().unwrap();
    }

    #[test]
    fn free_count_round_trips_under_64bit() {
        let mut sb = Superblock::zeroed();
        sb.s_feature_incompat = IncompatFeatures::B64BIT;
        sb.set_free_blk_count(0x1_2345_6789);
        assert_eq!(sb.free_blk_count(), 0x1_2345_6789);
        assert_eq!(sb.s_free_blocks_count_lo, 0x2345_6789);
        assert_eq!(sb.s_free_blocks_count_hi, 1);
    }
}
