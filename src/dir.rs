//! Directory blocks and the operations over them.
//!
//! A directory's data blocks hold a chain of variable-length records:
//! `inode (4) | rec_len (2) | name_len (1) | file_type (1) | name`. Records
//! are 4-byte aligned and never cross a block boundary; the last live record
//! in a block carries the slack to the block end in its `rec_len`. A record
//! whose inode is zero is a free slot. Under `metadata_csum` each block ends
//! with a 12-byte checksum pseudo-entry that iteration must never hand out
//! as a slot.

use bitflags::bitflags;

use crate::bmap;
use crate::error::{CanFail, Error, Ext4Result};
use crate::fs::Ext4Fs;
use crate::inode::{FileKind, Inode, InodeFlags, InodeNo};
use crate::io::BlockDevice;
use crate::sb::{crc32c_raw, IncompatFeatures, Superblock};

/// Fixed header bytes before the name.
pub const DIRENT_HEADER: usize = 8;

/// Record alignment.
pub const DIRENT_ALIGN: usize = 4;

/// Longest entry name.
pub const NAME_MAX: usize = 255;

/// `file_type` marker of the checksum pseudo-entry.
const DIRENT_CSUM_TYPE: u8 = 0xDE;

/// Record size needed for a name of `len` bytes.
pub fn dirent_size(len: usize) -> usize {
    (DIRENT_HEADER + len).next_multiple_of(DIRENT_ALIGN)
}

bitflags! {
    /// What a [`dir_iterate`] callback asks of the walker.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IterAction: u8 {
        /// The entry was modified; rewrite its block.
        const CHANGED = 0x1;
        /// Stop after the current block.
        const ABORT = 0x2;
    }
}

/// One decoded directory record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    /// Referenced inode; zero marks a free slot.
    pub inode: InodeNo,
    /// Total record length.
    pub rec_len: u16,
    /// Raw `file_type` byte (or high name-length bits without `FILETYPE`).
    pub file_type: u8,
    /// The entry's name.
    pub name: Vec<u8>,
}

impl Dirent {
    /// Decodes the record at the head of `buf`.
    pub fn decode(buf: &[u8], sb: &Superblock) -> Ext4Result<Self> {
        if buf.len() < DIRENT_HEADER {
            return Err(Error::Corrupted("truncated directory entry"));
        }
        let inode = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let rec_len = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let name_len = buf[6];
        let file_type = buf[7];
        let rec = usize::from(rec_len);
        if rec < DIRENT_HEADER || rec % DIRENT_ALIGN != 0 || rec > buf.len() {
            return Err(Error::Corrupted("bad directory record length"));
        }
        let name_len = if sb.has_incompat(IncompatFeatures::FILETYPE) {
            usize::from(name_len)
        } else {
            usize::from(name_len) | (usize::from(file_type) << 8)
        };
        if inode != 0 && DIRENT_HEADER + name_len > rec {
            return Err(Error::Corrupted("directory name overruns its record"));
        }
        let name = if inode != 0 {
            buf[DIRENT_HEADER..DIRENT_HEADER + name_len].to_vec()
        } else {
            Vec::new()
        };
        Ok(Self {
            inode,
            rec_len,
            file_type,
            name,
        })
    }

    /// Encodes the record at the head of `buf`, which must hold `rec_len`
    /// bytes.
    pub fn encode(&self, buf: &mut [u8], sb: &Superblock) {
        debug_assert!(usize::from(self.rec_len) <= buf.len());
        buf[0..4].copy_from_slice(&self.inode.to_le_bytes());
        buf[4..6].copy_from_slice(&self.rec_len.to_le_bytes());
        if sb.has_incompat(IncompatFeatures::FILETYPE) {
            buf[6] = self.name.len() as u8;
            buf[7] = self.file_type;
        } else {
            buf[6] = self.name.len() as u8;
            buf[7] = (self.name.len() >> 8) as u8;
        }
        buf[DIRENT_HEADER..DIRENT_HEADER + self.name.len()].copy_from_slice(&self.name);
    }

    /// Whether this record is an unused slot.
    pub fn is_free(&self) -> bool {
        self.inode == 0
    }

    /// The file type hint, when the `FILETYPE` feature stores one.
    pub fn kind(&self, sb: &Superblock) -> Option<FileKind> {
        if !sb.has_incompat(IncompatFeatures::FILETYPE) {
            return None;
        }
        Some(match self.file_type {
            1 => FileKind::Regular,
            2 => FileKind::Directory,
            3 => FileKind::CharacterDevice,
            4 => FileKind::BlockDevice,
            5 => FileKind::Fifo,
            6 => FileKind::Socket,
            7 => FileKind::SymbolicLink,
            _ => FileKind::Unknown,
        })
    }
}

/// The `file_type` byte for `kind`, under the `FILETYPE` feature.
pub fn file_type_byte(sb: &Superblock, kind: FileKind) -> u8 {
    if !sb.has_incompat(IncompatFeatures::FILETYPE) {
        return 0;
    }
    match kind {
        FileKind::Regular => 1,
        FileKind::Directory => 2,
        FileKind::CharacterDevice => 3,
        FileKind::BlockDevice => 4,
        FileKind::Fifo => 5,
        FileKind::Socket => 6,
        FileKind::SymbolicLink => 7,
        FileKind::Unknown => 0,
    }
}

/// Usable bytes of a directory block: everything before the checksum
/// pseudo-entry, when one is reserved.
fn usable_len(sb: &Superblock, blk_len: usize) -> usize {
    if sb.metadata_csum() {
        blk_len - 12
    } else {
        blk_len
    }
}

/// Rewrites a directory block, refreshing its checksum tail.
fn write_dir_block<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_gen: u32,
    phys: u64,
    buf: &mut [u8],
) -> CanFail {
    if fs.sb.metadata_csum() {
        let tail_off = buf.len() - 12;
        let tail = Dirent {
            inode: 0,
            rec_len: 12,
            file_type: DIRENT_CSUM_TYPE,
            name: Vec::new(),
        };
        let (head, tail_buf) = buf.split_at_mut(tail_off);
        tail.encode(tail_buf, &fs.sb);
        let mut crc = crc32c_raw(fs.sb.chksum_seed(), &dir_ino.to_le_bytes());
        crc = crc32c_raw(crc, &dir_gen.to_le_bytes());
        crc = crc32c_raw(crc, head);
        tail_buf[8..12].copy_from_slice(&crc.to_le_bytes());
    }
    fs.write_blk(phys, buf)
}

/// Ensures `ino` refers to a directory.
pub fn check_directory<D: BlockDevice>(fs: &mut Ext4Fs<D>, ino: InodeNo) -> CanFail {
    let inode = fs.read_inode(ino)?;
    if inode.kind() != FileKind::Directory {
        return Err(Error::NotADirectory);
    }
    Ok(())
}

/// Walks every record of the directory, free slots included.
///
/// The callback receives each decoded entry and its byte offset within the
/// directory. Returning [`IterAction::CHANGED`] persists the (possibly
/// modified) entry in place; the record length must not change. Returning
/// [`IterAction::ABORT`] stops the walk after the current block.
pub fn dir_iterate<D, F>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &Inode,
    mut f: F,
) -> CanFail
where
    D: BlockDevice,
    F: FnMut(&mut Dirent, u64) -> Ext4Result<IterAction>,
{
    if dir_inode.kind() != FileKind::Directory {
        return Err(Error::NotADirectory);
    }
    if dir_inode.i_flags.contains(InodeFlags::INLINE_DATA) {
        return Err(Error::Unsupported("inline directory"));
    }
    let blk_size = fs.sb.blk_size();
    let blocks = dir_inode.size().div_ceil(blk_size) as u32;

    for logical in 0..blocks {
        let Some(phys) = bmap::bmap(fs, dir_ino, dir_inode, logical)? else {
            continue;
        };
        let mut buf = fs.read_blk(phys)?;
        let usable = usable_len(&fs.sb, buf.len());
        let mut off = 0usize;
        let mut changed = false;
        let mut abort = false;
        while off < usable {
            let mut ent = Dirent::decode(&buf[off..usable], &fs.sb)?;
            let rec = usize::from(ent.rec_len);
            let action = f(&mut ent, u64::from(logical) * blk_size + off as u64)?;
            if action.contains(IterAction::CHANGED) {
                if usize::from(ent.rec_len) != rec {
                    return Err(Error::InvalidArgument);
                }
                ent.encode(&mut buf[off..off + rec], &fs.sb);
                changed = true;
            }
            if action.contains(IterAction::ABORT) {
                abort = true;
                break;
            }
            off += rec;
        }
        if changed {
            write_dir_block(fs, dir_ino, dir_inode.i_generation, phys, &mut buf)?;
        }
        if abort {
            break;
        }
    }
    Ok(())
}

/// Finds the entry named `name`; returns its inode and byte offset.
pub fn lookup<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &Inode,
    name: &[u8],
) -> Ext4Result<Option<(InodeNo, u64)>> {
    let mut found = None;
    dir_iterate(fs, dir_ino, dir_inode, |ent, off| {
        if !ent.is_free() && ent.name == name {
            found = Some((ent.inode, off));
            return Ok(IterAction::ABORT);
        }
        Ok(IterAction::empty())
    })?;
    Ok(found)
}

/// Collects the live entries, in directory order.
pub fn read_entries<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &Inode,
) -> Ext4Result<Vec<Dirent>> {
    let mut entries = Vec::new();
    dir_iterate(fs, dir_ino, dir_inode, |ent, _| {
        if !ent.is_free() {
            entries.push(ent.clone());
        }
        Ok(IterAction::empty())
    })?;
    Ok(entries)
}

/// Whether the directory holds nothing besides `.` and `..`.
pub fn is_empty<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &Inode,
) -> Ext4Result<bool> {
    let mut empty = true;
    dir_iterate(fs, dir_ino, dir_inode, |ent, _| {
        if !ent.is_free() && ent.name != b"." && ent.name != b".." {
            empty = false;
            return Ok(IterAction::ABORT);
        }
        Ok(IterAction::empty())
    })?;
    Ok(empty)
}

/// Inserts `name -> target` into the directory.
///
/// The first slot with enough slack is taken: either a free record, or the
/// tail slack of a live record. With no slot anywhere the function fails
/// with [`Error::NoSpace`] and the caller decides whether to expand the
/// directory.
pub fn link<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &Inode,
    name: &[u8],
    target: InodeNo,
    kind: FileKind,
) -> CanFail {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Error::InvalidArgument);
    }
    if dir_inode.i_flags.contains(InodeFlags::INLINE_DATA) {
        return Err(Error::Unsupported("inline directory"));
    }
    let needed = dirent_size(name.len());
    let blk_size = fs.sb.blk_size();
    if needed > usable_len(&fs.sb, blk_size as usize) {
        return Err(Error::InvalidArgument);
    }
    let blocks = dir_inode.size().div_ceil(blk_size) as u32;
    let file_type = file_type_byte(&fs.sb, kind);

    for logical in 0..blocks {
        let Some(phys) = bmap::bmap(fs, dir_ino, dir_inode, logical)? else {
            continue;
        };
        let mut buf = fs.read_blk(phys)?;
        let usable = usable_len(&fs.sb, buf.len());
        let mut off = 0usize;
        while off < usable {
            let ent = Dirent::decode(&buf[off..usable], &fs.sb)?;
            let rec = usize::from(ent.rec_len);
            if ent.is_free() && rec >= needed {
                // Take over the free slot wholesale.
                let new = Dirent {
                    inode: target,
                    rec_len: ent.rec_len,
                    file_type,
                    name: name.to_vec(),
                };
                new.encode(&mut buf[off..off + rec], &fs.sb);
                return write_dir_block(fs, dir_ino, dir_inode.i_generation, phys, &mut buf);
            }
            let used = dirent_size(ent.name.len());
            if !ent.is_free() && rec - used >= needed {
                // Split the live record's tail slack.
                let mut head = ent;
                let slack = rec - used;
                head.rec_len = used as u16;
                head.encode(&mut buf[off..off + used], &fs.sb);
                let new = Dirent {
                    inode: target,
                    rec_len: slack as u16,
                    file_type,
                    name: name.to_vec(),
                };
                new.encode(&mut buf[off + used..off + rec], &fs.sb);
                return write_dir_block(fs, dir_ino, dir_inode.i_generation, phys, &mut buf);
            }
            off += rec;
        }
    }
    Err(Error::NoSpace)
}

/// Appends one block to the directory, formatted as a single free record.
///
/// Returns nothing; the caller re-runs [`link`], which now finds room.
pub fn expand<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &mut Inode,
) -> CanFail {
    let blk_size = fs.sb.blk_size();
    let blocks = dir_inode.size().div_ceil(blk_size) as u32;
    let phys = bmap::bmap_alloc(fs, dir_ino, dir_inode, blocks)?;
    let mut buf = fs.io.allocate_blk();
    let free = Dirent {
        inode: 0,
        rec_len: usable_len(&fs.sb, buf.len()) as u16,
        file_type: 0,
        name: Vec::new(),
    };
    free.encode(&mut buf[..], &fs.sb);
    write_dir_block(fs, dir_ino, dir_inode.i_generation, phys, &mut buf)?;
    dir_inode.set_size(u64::from(blocks + 1) * blk_size);
    Ok(())
}

/// Removes the entry named `name`.
///
/// A leading record is freed by zeroing its inode; any other record is
/// merged into its predecessor's `rec_len`. The directory never shrinks.
pub fn unlink<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &Inode,
    name: &[u8],
) -> CanFail {
    if dir_inode.i_flags.contains(InodeFlags::INLINE_DATA) {
        return Err(Error::Unsupported("inline directory"));
    }
    let blk_size = fs.sb.blk_size();
    let blocks = dir_inode.size().div_ceil(blk_size) as u32;

    for logical in 0..blocks {
        let Some(phys) = bmap::bmap(fs, dir_ino, dir_inode, logical)? else {
            continue;
        };
        let mut buf = fs.read_blk(phys)?;
        let usable = usable_len(&fs.sb, buf.len());
        let mut off = 0usize;
        let mut prev: Option<usize> = None;
        while off < usable {
            let mut ent = Dirent::decode(&buf[off..usable], &fs.sb)?;
            let rec = usize::from(ent.rec_len);
            if !ent.is_free() && ent.name == name {
                match prev {
                    Some(prev_off) => {
                        let mut prev_ent = Dirent::decode(&buf[prev_off..usable], &fs.sb)?;
                        prev_ent.rec_len += ent.rec_len;
                        let prev_rec = usize::from(prev_ent.rec_len);
                        prev_ent.encode(&mut buf[prev_off..prev_off + prev_rec], &fs.sb);
                    }
                    None => {
                        ent.inode = 0;
                        ent.name.clear();
                        ent.encode(&mut buf[off..off + rec], &fs.sb);
                    }
                }
                return write_dir_block(fs, dir_ino, dir_inode.i_generation, phys, &mut buf);
            }
            prev = Some(off);
            off += rec;
        }
    }
    Err(Error::NotFound)
}

/// Writes the initial `.` and `..` records of a fresh directory block.
///
/// `.` takes the canonical 12 bytes, `..` the rest of the block.
pub fn mkdir_seed<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &mut Inode,
    parent: InodeNo,
) -> CanFail {
    let phys = bmap::bmap_alloc(fs, dir_ino, dir_inode, 0)?;
    let mut buf = fs.io.allocate_blk();
    let usable = usable_len(&fs.sb, buf.len());
    let dot = Dirent {
        inode: dir_ino,
        rec_len: 12,
        file_type: file_type_byte(&fs.sb, FileKind::Directory),
        name: b".".to_vec(),
    };
    dot.encode(&mut buf[..12], &fs.sb);
    let dotdot = Dirent {
        inode: parent,
        rec_len: (usable - 12) as u16,
        file_type: file_type_byte(&fs.sb, FileKind::Directory),
        name: b"..".to_vec(),
    };
    dotdot.encode(&mut buf[12..usable], &fs.sb);
    write_dir_block(fs, dir_ino, dir_inode.i_generation, phys, &mut buf)?;
    dir_inode.set_size(fs.sb.blk_size());
    Ok(())
}

/// Repoints the `..` record at `new_parent`.
pub fn update_dotdot<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    dir_ino: InodeNo,
    dir_inode: &Inode,
    new_parent: InodeNo,
) -> CanFail {
    let mut found = false;
    dir_iterate(fs, dir_ino, dir_inode, |ent, _| {
        if !ent.is_free() && ent.name == b".." {
            ent.inode = new_parent;
            found = true;
            return Ok(IterAction::CHANGED | IterAction::ABORT);
        }
        Ok(IterAction::empty())
    })?;
    if !found {
        return Err(Error::Corrupted("directory has no .. entry"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sb::Superblock;
    use bytemuck::Zeroable;

    fn sb_with_filetype() -> Superblock {
        let mut sb = Superblock::zeroed();
        sb.s_feature_incompat = IncompatFeatures::FILETYPE;
        sb
    }

    #[test]
    fn dirent_round_trip() {
        let sb = sb_with_filetype();
        let ent = Dirent {
            inode: 42,
            rec_len: 16,
            file_type: 2,
            name: b"subdir".to_vec(),
        };
        let mut buf = [0u8; 16];
        ent.encode(&mut buf, &sb);
        let back = Dirent::decode(&buf, &sb).unwrap();
        assert_eq!(back, ent);
        assert_eq!(back.kind(&sb), Some(FileKind::Directory));
    }

    #[test]
    fn decode_rejects_malformed_records() {
        let sb = sb_with_filetype();
        // record length below the header size
        let mut buf = [0u8; 16];
        buf[4] = 4;
        assert!(Dirent::decode(&buf, &sb).is_err());
        // misaligned record length
        buf[4] = 13;
        assert!(Dirent::decode(&buf, &sb).is_err());
        // name overruns the record
        buf[0] = 1;
        buf[4] = 12;
        buf[6] = 10;
        assert!(Dirent::decode(&buf, &sb).is_err());
    }

    #[test]
    fn dirent_size_is_aligned() {
        assert_eq!(dirent_size(1), 12);
        assert_eq!(dirent_size(4), 12);
        assert_eq!(dirent_size(5), 16);
        assert_eq!(dirent_size(255), 264);
    }

    #[test]
    fn sixteen_bit_name_length_without_filetype() {
        let sb = Superblock::zeroed();
        let name = vec![b'x'; 300];
        let mut ent = Dirent {
            inode: 7,
            rec_len: dirent_size(300) as u16,
            file_type: 0,
            name,
        };
        let mut buf = vec![0u8; usize::from(ent.rec_len)];
        ent.encode(&mut buf, &sb);
        let back = Dirent::decode(&buf, &sb).unwrap();
        assert_eq!(back.name.len(), 300);
        ent.file_type = back.file_type;
        assert_eq!(back.name, ent.name);
    }
}
