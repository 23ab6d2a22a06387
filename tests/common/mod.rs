//! Shared harness for the integration suites: an in-memory block device
//! whose image survives unmounting, and a minimal ext2/ext4 image formatter
//! producing a one-group filesystem with an empty root directory.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytemuck::{bytes_of, Zeroable};
use extfs::dir::Dirent;
use extfs::extent::{Extent, ExtentHeader, EXTENT_MAGIC};
use extfs::group::GroupDescriptor;
use extfs::inode::{FileMode, Inode, InodeFlags};
use extfs::sb::{IncompatFeatures, Superblock, EXT4_SIGNATURE, SUPERBLOCK_OFFSET};
use extfs::BlockDevice;

pub const BLOCK_SIZE: usize = 1024;
pub const BLOCK_COUNT: u32 = 4096;
pub const INODE_COUNT: u32 = 256;

/// Inode table start block; the table spans 32 blocks, the root directory's
/// data block follows it.
const ITABLE_START: u32 = 5;
const ROOT_DATA_BLOCK: u32 = 37;

/// A cloneable in-memory disk. Clones share the same image, so a test can
/// keep one handle across mount/unmount cycles. Discard requests are
/// recorded for inspection.
#[derive(Clone)]
pub struct SharedDisk {
    image: Arc<Mutex<Vec<u8>>>,
    discards: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl SharedDisk {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image: Arc::new(Mutex::new(image)),
            discards: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.image.lock().unwrap().clone()
    }

    /// Byte ranges discarded since the last call.
    pub fn take_discards(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut *self.discards.lock().unwrap())
    }
}

impl BlockDevice for SharedDisk {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let image = self.image.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > image.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of image",
            ));
        }
        buf.copy_from_slice(&image[start..end]);
        Ok(())
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        let mut image = self.image.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > image.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of image",
            ));
        }
        image[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn discard(&mut self, offset: u64, length: u64) -> std::io::Result<()> {
        self.discards.lock().unwrap().push((offset, length));
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Which optional features the formatted image carries.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageSpec {
    pub extents: bool,
    pub inline_data: bool,
}

impl ImageSpec {
    pub fn ext2() -> Self {
        Self::default()
    }

    pub fn ext4() -> Self {
        Self {
            extents: true,
            ..Self::default()
        }
    }
}

fn set_bitmap_bit(image: &mut [u8], bitmap_block: u32, bit: u32) {
    let byte = bitmap_block as usize * BLOCK_SIZE + (bit / 8) as usize;
    image[byte] |= 1 << (bit % 8);
}

/// Formats a 4 MiB image: 1 KiB blocks, one block group, 256 inodes, an
/// empty root directory, and nothing else.
pub fn build_image(spec: ImageSpec) -> Vec<u8> {
    let mut image = vec![0u8; BLOCK_COUNT as usize * BLOCK_SIZE];
    let used_blocks = ROOT_DATA_BLOCK; // blocks 1..=37 hold metadata + root
    let reserved_inodes = 10u32;

    let mut incompat = IncompatFeatures::FILETYPE;
    if spec.extents {
        incompat = incompat | IncompatFeatures::EXTENTS;
    }
    if spec.inline_data {
        incompat = incompat | IncompatFeatures::INLINE_DATA;
    }

    let mut sb = Superblock::zeroed();
    sb.s_magic = EXT4_SIGNATURE;
    sb.s_rev_level = 1;
    sb.s_inode_size = 128;
    sb.s_first_ino = 11;
    sb.s_inodes_count = INODE_COUNT;
    sb.s_inodes_per_group = INODE_COUNT;
    sb.s_blocks_count_lo = BLOCK_COUNT;
    sb.s_blocks_per_group = 8192;
    sb.s_first_data_block = 1;
    sb.s_log_block_size = 0;
    sb.s_free_blocks_count_lo = BLOCK_COUNT - 1 - used_blocks;
    sb.s_free_inodes_count = INODE_COUNT - reserved_inodes;
    sb.s_max_mnt_count = u16::MAX;
    sb.s_state = 1;
    sb.s_feature_incompat = incompat;
    image[SUPERBLOCK_OFFSET as usize..SUPERBLOCK_OFFSET as usize + 1024]
        .copy_from_slice(bytes_of(&sb));

    let mut desc = GroupDescriptor::zeroed();
    desc.bg_block_bitmap_lo = 3;
    desc.bg_inode_bitmap_lo = 4;
    desc.bg_inode_table_lo = ITABLE_START;
    desc.bg_free_blocks_count_lo = (BLOCK_COUNT - 1 - used_blocks) as u16;
    desc.bg_free_inodes_count_lo = (INODE_COUNT - reserved_inodes) as u16;
    desc.bg_used_dirs_count_lo = 1;
    let desc_bytes = bytes_of(&desc);
    image[2 * BLOCK_SIZE..2 * BLOCK_SIZE + 32].copy_from_slice(&desc_bytes[..32]);

    // Block bitmap: blocks 1..=37 in use, pad bits past the last block.
    for blk in 1..=used_blocks {
        set_bitmap_bit(&mut image, 3, blk - 1);
    }
    for bit in (BLOCK_COUNT - 1)..8 * BLOCK_SIZE as u32 {
        set_bitmap_bit(&mut image, 3, bit);
    }

    // Inode bitmap: the reserved inodes, pad bits past the last inode.
    for ino in 1..=reserved_inodes {
        set_bitmap_bit(&mut image, 4, ino - 1);
    }
    for bit in INODE_COUNT..8 * BLOCK_SIZE as u32 {
        set_bitmap_bit(&mut image, 4, bit);
    }

    // Root directory inode (#2).
    let mut root = Inode::zeroed();
    root.i_mode = FileMode::new(FileMode::IFDIR, 0o755);
    root.i_links_count = 2;
    root.set_size(BLOCK_SIZE as u64);
    root.set_blocks(2);
    root.i_atime = 1_600_000_000;
    root.i_ctime = 1_600_000_000;
    root.i_mtime = 1_600_000_000;
    if spec.extents {
        root.i_flags = InodeFlags::EXTENTS;
        let header = ExtentHeader {
            eh_magic: EXTENT_MAGIC,
            eh_entries: 1,
            eh_max: 4,
            eh_depth: 0,
            eh_generation: 0,
        };
        let extent = Extent {
            ee_block: 0,
            ee_len: 1,
            ee_start_hi: 0,
            ee_start_lo: ROOT_DATA_BLOCK,
        };
        let mut blk = [0u8; 60];
        blk[..12].copy_from_slice(bytes_of(&header));
        blk[12..24].copy_from_slice(bytes_of(&extent));
        root.set_block_bytes(&blk);
    } else {
        root.i_block[0] = ROOT_DATA_BLOCK;
    }
    let root_off = ITABLE_START as usize * BLOCK_SIZE + 128;
    image[root_off..root_off + 128].copy_from_slice(&bytes_of(&root)[..128]);

    // Root directory data: `.` and `..`, both pointing at the root.
    let dot = Dirent {
        inode: 2,
        rec_len: 12,
        file_type: 2,
        name: b".".to_vec(),
    };
    let dotdot = Dirent {
        inode: 2,
        rec_len: (BLOCK_SIZE - 12) as u16,
        file_type: 2,
        name: b"..".to_vec(),
    };
    let base = ROOT_DATA_BLOCK as usize * BLOCK_SIZE;
    dot.encode(&mut image[base..base + 12], &sb);
    dotdot.encode(&mut image[base + 12..base + BLOCK_SIZE], &sb);

    image
}

/// Formats an image and wraps it in a [`SharedDisk`].
pub fn fresh_disk(spec: ImageSpec) -> SharedDisk {
    SharedDisk::new(build_image(spec))
}

/// Reads the free-count words and bitmap population straight from the raw
/// image bytes, for cross-checking the on-disk invariants after a flush.
pub struct RawCounts {
    pub sb_free_blocks: u32,
    pub sb_free_inodes: u32,
    pub bitmap_free_blocks: u32,
    pub bitmap_free_inodes: u32,
}

pub fn raw_counts(image: &[u8]) -> RawCounts {
    let sb_free_blocks = u32::from_le_bytes(image[1024 + 0x0C..1024 + 0x10].try_into().unwrap());
    let sb_free_inodes = u32::from_le_bytes(image[1024 + 0x10..1024 + 0x14].try_into().unwrap());

    let count_clear = |bitmap_block: usize, entities: u32| -> u32 {
        let mut clear = 0;
        for bit in 0..entities {
            let byte = image[bitmap_block * BLOCK_SIZE + (bit / 8) as usize];
            if byte >> (bit % 8) & 1 == 0 {
                clear += 1;
            }
        }
        clear
    };
    RawCounts {
        sb_free_blocks,
        sb_free_inodes,
        bitmap_free_blocks: count_clear(3, BLOCK_COUNT - 1),
        bitmap_free_inodes: count_clear(4, INODE_COUNT),
    }
}
