//! Inode records and the inode table.
//!
//! An inode is the fixed-size record holding a file's metadata and the roots
//! of its data-block mapping. The classic record is 128 bytes; revision-1
//! filesystems usually reserve 256, of which the first 160 carry defined
//! fields (extended timestamps, creation time, project id). The record below
//! models those 160 bytes; whatever the filesystem reserves beyond them is
//! preserved untouched.

use bytemuck::{bytes_of, bytes_of_mut, Pod, Zeroable};

use crate::error::{CanFail, Error, Ext4Result};
use crate::group::GroupTable;
use crate::io::{BlockDevice, IoChannel};
use crate::sb::{crc32c_raw, RoCompatFeatures, Superblock};

/// Inode numbers are 32-bit and start at 1.
pub type InodeNo = u32;

/// The root directory inode.
pub const ROOT_INO: InodeNo = 2;

/// Number of direct block slots in `i_block`.
pub const DIRECT_BLOCKS: usize = 12;

/// A symlink target of at most this many bytes lives inline in `i_block`.
pub const SYMLINK_INLINE_LIMIT: u64 = 60;

/// Bytes of `i_block` usable for inline file data.
pub const INLINE_DATA_LIMIT: u64 = 60;

/// Defined portion of the large inode record.
pub const INODE_RECORD_SIZE: usize = 160;

/// File type and permission word (`i_mode`), using the Linux `S_IF*`
/// encoding redefined locally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    /// Mask of the file-type bits.
    pub const IFMT: u16 = 0xF000;

    /// FIFO.
    pub const IFIFO: u16 = 0x1000;
    /// Character device.
    pub const IFCHR: u16 = 0x2000;
    /// Directory.
    pub const IFDIR: u16 = 0x4000;
    /// Block device.
    pub const IFBLK: u16 = 0x6000;
    /// Regular file.
    pub const IFREG: u16 = 0x8000;
    /// Symbolic link.
    pub const IFLNK: u16 = 0xA000;
    /// Socket.
    pub const IFSOCK: u16 = 0xC000;

    /// Builds a mode from a type and permission bits.
    pub fn new(file_type: u16, perm: u16) -> Self {
        Self((file_type & Self::IFMT) | (perm & 0o7777))
    }

    /// The file type carried by this mode.
    pub fn kind(self) -> FileKind {
        FileKind::from_mode_bits(self.0)
    }

    /// The permission (and suid/sgid/sticky) bits.
    pub fn perm(self) -> u16 {
        self.0 & 0o7777
    }

    /// Replaces the permission bits, preserving the type.
    pub fn set_perm(&mut self, perm: u16) {
        self.0 = (self.0 & Self::IFMT) | (perm & 0o7777);
    }
}

/// Type of a filesystem object, as carried by `i_mode` and (under the
/// `FILETYPE` feature) by directory entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    SymbolicLink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileKind {
    /// Decodes the type from `i_mode` bits.
    pub fn from_mode_bits(mode: u16) -> Self {
        match mode & FileMode::IFMT {
            FileMode::IFREG => Self::Regular,
            FileMode::IFDIR => Self::Directory,
            FileMode::IFLNK => Self::SymbolicLink,
            FileMode::IFCHR => Self::CharacterDevice,
            FileMode::IFBLK => Self::BlockDevice,
            FileMode::IFIFO => Self::Fifo,
            FileMode::IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }

    /// The `i_mode` type bits for this kind.
    pub fn to_mode_bits(self) -> u16 {
        match self {
            Self::Regular => FileMode::IFREG,
            Self::Directory => FileMode::IFDIR,
            Self::SymbolicLink => FileMode::IFLNK,
            Self::CharacterDevice => FileMode::IFCHR,
            Self::BlockDevice => FileMode::IFBLK,
            Self::Fifo => FileMode::IFIFO,
            Self::Socket => FileMode::IFSOCK,
            Self::Unknown => 0,
        }
    }
}

/// `i_flags` word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeFlags(pub u32);

impl InodeFlags {
    /// Do not update `i_atime`.
    pub const NOATIME: Self = Self(0x80);

    /// Directory uses hashed indexes.
    pub const INDEX: Self = Self(0x1000);

    /// The file's data is mapped by an extent tree.
    pub const EXTENTS: Self = Self(0x8_0000);

    /// The file's data lives in the inode itself.
    pub const INLINE_DATA: Self = Self(0x1000_0000);

    /// Whether every flag of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the flags of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the flags of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// A point in time with nanosecond precision, as the extended inode
/// timestamps encode it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timespec {
    /// Seconds since the epoch.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: u32,
}

impl Timespec {
    /// The current wall-clock time.
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Encodes into a seconds word and the `_extra` word (2-bit epoch in the
    /// low bits, 30-bit nanoseconds above).
    pub fn encode(self) -> (u32, u32) {
        let epoch = ((self.sec >> 32) & 0x3) as u32;
        (self.sec as u32, epoch | (self.nsec.min(999_999_999) << 2))
    }

    /// Decodes from a seconds word and its `_extra` word.
    pub fn decode(sec: u32, extra: u32) -> Self {
        Self {
            sec: i64::from(sec) | (i64::from(extra & 0x3) << 32),
            nsec: extra >> 2,
        }
    }
}

/// The on-disk inode record, large layout.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Inode {
    /// Type and permissions.
    pub i_mode: FileMode,
    /// Owner, low 16 bits.
    pub i_uid: u16,
    /// Size in bytes, low 32 bits.
    pub i_size_lo: u32,
    /// Last access time.
    pub i_atime: u32,
    /// Last inode change time.
    pub i_ctime: u32,
    /// Last data modification time.
    pub i_mtime: u32,
    /// Deletion time.
    pub i_dtime: u32,
    /// Group, low 16 bits.
    pub i_gid: u16,
    /// Hard link count.
    pub i_links_count: u16,
    /// 512-byte sectors attributed to the file, low 32 bits.
    pub i_blocks_lo: u32,
    /// Inode flags.
    pub i_flags: InodeFlags,
    /// Version, low 32 bits.
    pub i_version_lo: u32,
    /// Block map: 12 direct slots plus single/double/triple indirect roots,
    /// or an extent tree, or inline data, or a fast symlink target.
    pub i_block: [u32; 15],
    /// File version (NFS) / checksum input.
    pub i_generation: u32,
    /// Extended attribute block, low 32 bits.
    pub i_file_acl_lo: u32,
    /// Size in bytes, high 32 bits.
    pub i_size_high: u32,
    /// Obsolete fragment address.
    pub i_obso_faddr: u32,
    /// 512-byte sectors, high 16 bits.
    pub i_blocks_high: u16,
    /// Extended attribute block, high 16 bits.
    pub i_file_acl_high: u16,
    /// Owner, high 16 bits.
    pub i_uid_high: u16,
    /// Group, high 16 bits.
    pub i_gid_high: u16,
    /// Inode checksum, low 16 bits.
    pub i_checksum_lo: u16,
    pub i_reserved: u16,

    // Fields below exist only when `s_inode_size` > 128 and are guarded by
    // `i_extra_isize`.
    /// Valid bytes beyond the classic 128.
    pub i_extra_isize: u16,
    /// Inode checksum, high 16 bits.
    pub i_checksum_hi: u16,
    /// Extra change-time bits.
    pub i_ctime_extra: u32,
    /// Extra modification-time bits.
    pub i_mtime_extra: u32,
    /// Extra access-time bits.
    pub i_atime_extra: u32,
    /// Creation time.
    pub i_crtime: u32,
    /// Extra creation-time bits.
    pub i_crtime_extra: u32,
    /// Version, high 32 bits.
    pub i_version_hi: u32,
    /// Project id.
    pub i_projid: u32,
}

const _: () = assert!(core::mem::size_of::<Inode>() == INODE_RECORD_SIZE);

impl Inode {
    /// The file type.
    pub fn kind(&self) -> FileKind {
        self.i_mode.kind()
    }

    /// 32-bit owner id.
    pub fn uid(&self) -> u32 {
        u32::from(self.i_uid) | (u32::from(self.i_uid_high) << 16)
    }

    /// Splits a 32-bit owner id into the low word and its `_high` half.
    pub fn set_uid(&mut self, uid: u32) {
        self.i_uid = uid as u16;
        self.i_uid_high = (uid >> 16) as u16;
    }

    /// 32-bit group id.
    pub fn gid(&self) -> u32 {
        u32::from(self.i_gid) | (u32::from(self.i_gid_high) << 16)
    }

    /// Splits a 32-bit group id into the low word and its `_high` half.
    pub fn set_gid(&mut self, gid: u32) {
        self.i_gid = gid as u16;
        self.i_gid_high = (gid >> 16) as u16;
    }

    /// File size in bytes.
    ///
    /// The high word is meaningful for regular files only; `i_size_high`
    /// doubles as the directory ACL slot in the classic layout.
    pub fn size(&self) -> u64 {
        if self.kind() == FileKind::Regular {
            u64::from(self.i_size_lo) | (u64::from(self.i_size_high) << 32)
        } else {
            u64::from(self.i_size_lo)
        }
    }

    /// Replaces the size field.
    pub fn set_size(&mut self, size: u64) {
        self.i_size_lo = size as u32;
        if self.kind() == FileKind::Regular {
            self.i_size_high = (size >> 32) as u32;
        }
    }

    /// 512-byte sectors attributed to the file.
    pub fn blocks(&self) -> u64 {
        u64::from(self.i_blocks_lo) | (u64::from(self.i_blocks_high) << 32)
    }

    /// Replaces the sector count.
    pub fn set_blocks(&mut self, sectors: u64) {
        self.i_blocks_lo = sectors as u32;
        self.i_blocks_high = (sectors >> 32) as u16;
    }

    /// Adds or removes whole filesystem blocks from the sector count.
    pub fn adjust_blocks(&mut self, sb: &Superblock, delta: i64) {
        let sectors_per_blk = (sb.blk_size() / 512) as i64;
        let new = self.blocks() as i64 + delta * sectors_per_blk;
        self.set_blocks(new.max(0) as u64);
    }

    /// Extended attribute block number.
    pub fn file_acl(&self) -> u64 {
        u64::from(self.i_file_acl_lo) | (u64::from(self.i_file_acl_high) << 32)
    }

    /// Whether the field at byte `offset` of the record is backed on disk.
    fn has_field(&self, offset: usize) -> bool {
        offset + 4 <= 128 + usize::from(self.i_extra_isize)
    }

    /// Last access time.
    pub fn atime(&self) -> Timespec {
        if self.has_field(core::mem::offset_of!(Inode, i_atime_extra)) {
            Timespec::decode(self.i_atime, self.i_atime_extra)
        } else {
            Timespec {
                sec: i64::from(self.i_atime),
                nsec: 0,
            }
        }
    }

    /// Sets the access time, dropping precision the record cannot store.
    pub fn set_atime(&mut self, t: Timespec) {
        let (sec, extra) = t.encode();
        self.i_atime = sec;
        if self.has_field(core::mem::offset_of!(Inode, i_atime_extra)) {
            self.i_atime_extra = extra;
        }
    }

    /// Last modification time.
    pub fn mtime(&self) -> Timespec {
        if self.has_field(core::mem::offset_of!(Inode, i_mtime_extra)) {
            Timespec::decode(self.i_mtime, self.i_mtime_extra)
        } else {
            Timespec {
                sec: i64::from(self.i_mtime),
                nsec: 0,
            }
        }
    }

    /// Sets the modification time.
    pub fn set_mtime(&mut self, t: Timespec) {
        let (sec, extra) = t.encode();
        self.i_mtime = sec;
        if self.has_field(core::mem::offset_of!(Inode, i_mtime_extra)) {
            self.i_mtime_extra = extra;
        }
    }

    /// Last change time.
    pub fn ctime(&self) -> Timespec {
        if self.has_field(core::mem::offset_of!(Inode, i_ctime_extra)) {
            Timespec::decode(self.i_ctime, self.i_ctime_extra)
        } else {
            Timespec {
                sec: i64::from(self.i_ctime),
                nsec: 0,
            }
        }
    }

    /// Sets the change time.
    pub fn set_ctime(&mut self, t: Timespec) {
        let (sec, extra) = t.encode();
        self.i_ctime = sec;
        if self.has_field(core::mem::offset_of!(Inode, i_ctime_extra)) {
            self.i_ctime_extra = extra;
        }
    }

    /// Sets the creation time, when the record stores one.
    pub fn set_crtime(&mut self, t: Timespec) {
        if self.has_field(core::mem::offset_of!(Inode, i_crtime)) {
            let (sec, extra) = t.encode();
            self.i_crtime = sec;
            if self.has_field(core::mem::offset_of!(Inode, i_crtime_extra)) {
                self.i_crtime_extra = extra;
            }
        }
    }

    /// Whether `i_block` holds a block map at all.
    ///
    /// Fast symlinks keep their target text in `i_block`, and inline-data
    /// inodes keep file bytes there; neither consumes data blocks.
    pub fn has_valid_blocks(&self) -> bool {
        if self.i_flags.contains(InodeFlags::INLINE_DATA) {
            return false;
        }
        !(self.kind() == FileKind::SymbolicLink && self.size() <= SYMLINK_INLINE_LIMIT)
    }

    /// Whether the data mapping is an extent tree.
    pub fn uses_extents(&self) -> bool {
        self.i_flags.contains(InodeFlags::EXTENTS)
    }

    /// `i_block` viewed as raw bytes (fast symlink target, inline data).
    pub fn block_bytes(&self) -> [u8; 60] {
        let mut out = [0u8; 60];
        for (i, word) in self.i_block.iter().enumerate() {
            out[i * 4..(i + 1) * 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Overwrites the first `data.len()` bytes of `i_block`, zeroing the
    /// rest.
    pub fn set_block_bytes(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= 60);
        let mut raw = [0u8; 60];
        raw[..data.len()].copy_from_slice(data);
        for (i, word) in self.i_block.iter_mut().enumerate() {
            *word = u32::from_le_bytes(raw[i * 4..(i + 1) * 4].try_into().unwrap());
        }
    }

    fn compute_chksum(&self, sb: &Superblock, ino: InodeNo) -> u32 {
        let mut scratch = *self;
        scratch.i_checksum_lo = 0;
        if scratch.has_field(core::mem::offset_of!(Inode, i_checksum_hi)) {
            scratch.i_checksum_hi = 0;
        }
        // the checksum spans the full on-disk slot; bytes past the modelled
        // record are zero on any inode this engine writes
        let mut raw = vec![0u8; sb.inode_size()];
        let len = sb.inode_size().min(INODE_RECORD_SIZE);
        raw[..len].copy_from_slice(&bytes_of(&scratch)[..len]);
        let mut crc = crc32c_raw(sb.chksum_seed(), &ino.to_le_bytes());
        crc = crc32c_raw(crc, &self.i_generation.to_le_bytes());
        crc32c_raw(crc, &raw)
    }

    /// Refreshes the checksum fields when `metadata_csum` is enabled.
    pub fn update_chksum(&mut self, sb: &Superblock, ino: InodeNo) {
        if !sb.metadata_csum() {
            return;
        }
        let crc = self.compute_chksum(sb, ino);
        self.i_checksum_lo = crc as u16;
        if self.has_field(core::mem::offset_of!(Inode, i_checksum_hi)) {
            self.i_checksum_hi = (crc >> 16) as u16;
        }
    }

    /// Validates the checksum fields; mismatches are logged, not fatal.
    pub fn verify_chksum(&self, sb: &Superblock, ino: InodeNo) -> bool {
        if !sb.metadata_csum() {
            return true;
        }
        let crc = self.compute_chksum(sb, ino);
        let mut stored = u32::from(self.i_checksum_lo);
        let mut computed = crc & 0xFFFF;
        if self.has_field(core::mem::offset_of!(Inode, i_checksum_hi)) {
            stored |= u32::from(self.i_checksum_hi) << 16;
            computed = crc;
        }
        if stored != computed {
            log::error!("inode {ino}: checksum mismatch (got {computed:#x}, stored {stored:#x})");
            return false;
        }
        true
    }
}

/// Byte location of inode `ino` on disk.
fn inode_position(
    sb: &Superblock,
    groups: &GroupTable,
    ino: InodeNo,
) -> Ext4Result<u64> {
    if ino == 0 || ino > sb.s_inodes_count {
        return Err(Error::Corrupted("inode number out of range"));
    }
    let index = ino - 1;
    let group = index / sb.s_inodes_per_group;
    let slot = u64::from(index % sb.s_inodes_per_group);
    let table = groups.desc(group)?.inode_table(sb);
    Ok(table * sb.blk_size() + slot * sb.inode_size() as u64)
}

/// Reads the record for inode `ino`.
pub fn read_inode<D: BlockDevice>(
    io: &mut IoChannel<D>,
    sb: &Superblock,
    groups: &GroupTable,
    ino: InodeNo,
) -> Ext4Result<Inode> {
    let pos = inode_position(sb, groups, ino)?;
    let rec_size = sb.inode_size();
    let mut raw = vec![0u8; rec_size];
    io.read_bytes(pos, &mut raw)?;

    let mut inode = Inode::zeroed();
    let len = rec_size.min(INODE_RECORD_SIZE);
    bytes_of_mut(&mut inode)[..len].copy_from_slice(&raw[..len]);
    inode.verify_chksum(sb, ino);
    Ok(inode)
}

/// Writes the record for inode `ino`, bumping its version word.
pub fn write_inode<D: BlockDevice>(
    io: &mut IoChannel<D>,
    sb: &Superblock,
    groups: &GroupTable,
    ino: InodeNo,
    inode: &mut Inode,
) -> CanFail {
    let pos = inode_position(sb, groups, ino)?;
    inode.i_version_lo = inode.i_version_lo.wrapping_add(1);
    inode.update_chksum(sb, ino);
    let len = sb.inode_size().min(INODE_RECORD_SIZE);
    io.write_bytes(pos, &bytes_of(inode)[..len])
}

/// Zeroes the full on-disk slot for `ino`, then writes `inode` into it.
pub fn write_new_inode<D: BlockDevice>(
    io: &mut IoChannel<D>,
    sb: &Superblock,
    groups: &GroupTable,
    ino: InodeNo,
    inode: &mut Inode,
) -> CanFail {
    let pos = inode_position(sb, groups, ino)?;
    let rec_size = sb.inode_size();
    if rec_size > 128 && sb.has_ro_compat(RoCompatFeatures::EXTRA_ISIZE) {
        inode.i_extra_isize = (INODE_RECORD_SIZE - 128) as u16;
    }
    io.write_bytes(pos, &vec![0u8; rec_size])?;
    write_inode(io, sb, groups, ino, inode)
}
