//! Open file objects.
//!
//! A [`File`] ties an inode to a cursor and a one-block cache. Reads and
//! writes stream through the cache: crossing into another block flushes the
//! dirty block first, then loads (or, for writes, allocates) the new one.
//! Holes read as zeros and only materialize when written.

use bitflags::bitflags;

use crate::bmap;
use crate::error::{CanFail, Error, Ext4Result};
use crate::extent;
use crate::fs::LockedFs;
use crate::inode::{Inode, InodeFlags, InodeNo, Timespec, INLINE_DATA_LIMIT};
use crate::io::BlockDevice;
use crate::sb::IncompatFeatures;

bitflags! {
    /// Engine-level open flags.
    ///
    /// `CREAT`, `EXCL`, `TRUNC`, `DIRECTORY` and `NOFOLLOW` are enforced by
    /// the path-level API; the file object itself only honors the access
    /// mode, `APPEND` and `NOATIME`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 0x0001;
        /// Open for writing.
        const WRITE = 0x0002;
        /// Create the file when missing.
        const CREAT = 0x0010;
        /// With `CREAT`, refuse an existing file.
        const EXCL = 0x0020;
        /// Truncate to zero length on open.
        const TRUNC = 0x0040;
        /// Every write lands at the end of the file.
        const APPEND = 0x0080;
        /// Do not follow a terminal symlink.
        const NOFOLLOW = 0x0100;
        /// Fail unless the path names a directory.
        const DIRECTORY = 0x0200;
        /// Do not update the access time on reads.
        const NOATIME = 0x0400;
    }
}

/// Where [`File::llseek`] measures its offset from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekWhence {
    /// From the start of the file.
    Set,
    /// From the current position.
    Current,
    /// From the end of the file.
    End,
}

/// Projection of an inode record returned by `fstat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    /// Type and permission bits.
    pub mode: u16,
    /// Hard link count.
    pub nlink: u16,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// 512-byte sectors in use.
    pub blocks: u64,
    /// Last access time.
    pub atime: Timespec,
    /// Last modification time.
    pub mtime: Timespec,
    /// Last change time.
    pub ctime: Timespec,
}

impl FileStat {
    pub(crate) fn from_inode(inode: &Inode) -> Self {
        Self {
            mode: inode.i_mode.0,
            nlink: inode.i_links_count,
            uid: inode.uid(),
            gid: inode.gid(),
            size: inode.size(),
            blocks: inode.blocks(),
            atime: inode.atime(),
            mtime: inode.mtime(),
            ctime: inode.ctime(),
        }
    }
}

/// One cached data block.
struct CachedBlock {
    logical: u32,
    /// Backing block; `None` while the block is still a hole.
    phys: Option<u64>,
    buf: Vec<u8>,
    dirty: bool,
}

/// An open file: a shared filesystem handle, a cached inode record, a
/// cursor, and a one-block cache.
pub struct File<D: BlockDevice> {
    fs: LockedFs<D>,
    ino: InodeNo,
    inode: Inode,
    flags: OpenFlags,
    pos: u64,
    cache: Option<CachedBlock>,
    inode_dirty: bool,
}

impl<D: BlockDevice> File<D> {
    pub(crate) fn new(fs: LockedFs<D>, ino: InodeNo, inode: Inode, flags: OpenFlags) -> Self {
        Self {
            fs,
            ino,
            inode,
            flags,
            pos: 0,
            cache: None,
            inode_dirty: false,
        }
    }

    /// The inode number backing this file.
    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// The current cursor position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Projects the cached inode record.
    pub fn fstat(&self) -> FileStat {
        FileStat::from_inode(&self.inode)
    }

    /// Moves the cursor. Seeking past the end is allowed; the hole only
    /// materializes on write.
    pub fn llseek(&mut self, offset: i64, whence: SeekWhence) -> Ext4Result<u64> {
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Current => self.pos as i64,
            SeekWhence::End => self.inode.size() as i64,
        };
        let target = base.checked_add(offset).ok_or(Error::InvalidArgument)?;
        if target < 0 {
            return Err(Error::InvalidArgument);
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    /// Reads up to `buf.len()` bytes at the cursor, returning how many were
    /// filled. Returns short (possibly zero) at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Ext4Result<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(Error::InvalidArgument);
        }
        let size = self.inode.size();
        let mut done = 0usize;

        if self.inode.i_flags.contains(InodeFlags::INLINE_DATA) {
            let inline = self.inode.block_bytes();
            while done < buf.len() && self.pos < size {
                buf[done] = inline[self.pos as usize];
                done += 1;
                self.pos += 1;
            }
        } else {
            let blk_size = {
                let fs = self.fs.read();
                fs.sb.blk_size()
            };
            while done < buf.len() && self.pos < size {
                let logical = (self.pos / blk_size) as u32;
                let off = (self.pos % blk_size) as usize;
                self.load_block(logical, false)?;
                let cache = self.cache.as_ref().unwrap();
                let n = buf.len() - done;
                let n = n
                    .min((blk_size as usize) - off)
                    .min((size - self.pos) as usize);
                buf[done..done + n].copy_from_slice(&cache.buf[off..off + n]);
                done += n;
                self.pos += n as u64;
            }
        }

        let update_atime = {
            let fs = self.fs.read();
            fs.writable && !self.flags.contains(OpenFlags::NOATIME)
        };
        if update_atime {
            self.inode.set_atime(Timespec::now());
            self.inode_dirty = true;
        }
        Ok(done)
    }

    /// Writes `buf` at the cursor, growing the file as needed.
    pub fn write(&mut self, buf: &[u8]) -> Ext4Result<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(Error::InvalidArgument);
        }
        {
            let fs = self.fs.read();
            if !fs.writable {
                return Err(Error::ReadOnly);
            }
        }
        if self.flags.contains(OpenFlags::APPEND) {
            self.pos = self.inode.size();
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.inode.i_flags.contains(InodeFlags::INLINE_DATA) {
            let end = self.pos.checked_add(buf.len() as u64).ok_or(Error::FileTooBig)?;
            if end <= INLINE_DATA_LIMIT {
                let mut inline = self.inode.block_bytes();
                inline[self.pos as usize..end as usize].copy_from_slice(buf);
                self.inode.set_block_bytes(&inline);
                self.pos = end;
                if end > self.inode.size() {
                    self.inode.set_size(end);
                }
                self.touch_mtime();
                return Ok(buf.len());
            }
            self.promote_inline()?;
        }

        let blk_size = {
            let fs = self.fs.read();
            fs.sb.blk_size()
        };
        let mut done = 0usize;
        while done < buf.len() {
            let logical = (self.pos / blk_size) as u32;
            let off = (self.pos % blk_size) as usize;
            let n = (buf.len() - done).min(blk_size as usize - off);
            self.load_block(logical, true)?;
            let cache = self.cache.as_mut().unwrap();
            cache.buf[off..off + n].copy_from_slice(&buf[done..done + n]);
            cache.dirty = true;
            done += n;
            self.pos += n as u64;
            if self.pos > self.inode.size() {
                self.inode.set_size(self.pos);
            }
        }
        self.touch_mtime();
        Ok(done)
    }

    /// Extends or truncates the file to `size` bytes.
    ///
    /// Extension only moves the size; the gap reads as zeros. Truncation
    /// punches the tail blocks.
    pub fn set_size(&mut self, size: u64) -> CanFail {
        {
            let fs = self.fs.read();
            if !fs.writable {
                return Err(Error::ReadOnly);
            }
        }
        let old = self.inode.size();
        if size == old {
            return Ok(());
        }

        if self.inode.i_flags.contains(InodeFlags::INLINE_DATA) {
            if size > INLINE_DATA_LIMIT {
                self.promote_inline()?;
            } else {
                if size < old {
                    let mut inline = self.inode.block_bytes();
                    inline[size as usize..old as usize].fill(0);
                    self.inode.set_block_bytes(&inline);
                }
                self.inode.set_size(size);
                self.touch_mtime();
                return Ok(());
            }
        }

        let handle = self.fs.clone();
        let mut guard = handle.write();
        let fs = &mut *guard;
        let blk_size = fs.sb.blk_size();
        if size < old {
            // Drop cached state covering the removed tail, then punch it.
            let first_gone = size.div_ceil(blk_size) as u32;
            if let Some(cache) = &self.cache {
                if cache.logical >= first_gone {
                    self.cache = None;
                }
            }
            bmap::punch(fs, self.ino, &mut self.inode, first_gone, u32::MAX)?;
            // Stale bytes in the kept partial block must read as zeros if
            // the file grows again.
            let tail = (size % blk_size) as usize;
            if tail != 0 {
                let logical = (size / blk_size) as u32;
                if let Some(phys) = bmap::bmap(fs, self.ino, &self.inode, logical)? {
                    let mut buf = fs.read_blk(phys)?;
                    buf[tail..].fill(0);
                    fs.write_blk(phys, &buf)?;
                    if let Some(cache) = &mut self.cache {
                        if cache.logical == logical {
                            cache.buf.copy_from_slice(&buf);
                            cache.dirty = false;
                        }
                    }
                }
            }
        }
        self.inode.set_size(size);
        self.touch_mtime();
        Ok(())
    }

    /// Writes back the dirty cached block and the dirty inode record.
    pub fn flush(&mut self) -> CanFail {
        let handle = self.fs.clone();
        let mut guard = handle.write();
        let fs = &mut *guard;
        if let Some(cache) = &mut self.cache {
            if cache.dirty {
                let phys = cache.phys.ok_or(Error::InvalidArgument)?;
                fs.write_blk(phys, &cache.buf)?;
                cache.dirty = false;
            }
        }
        if self.inode_dirty {
            fs.write_inode_rec(self.ino, &mut self.inode)?;
            self.inode_dirty = false;
        }
        Ok(())
    }

    /// Flushes and releases the file.
    pub fn close(mut self) -> CanFail {
        self.flush()
    }

    /// Overlays new permission bits, preserving the file type.
    pub fn chmod(&mut self, mode: u16) -> CanFail {
        {
            let fs = self.fs.read();
            if !fs.writable {
                return Err(Error::ReadOnly);
            }
        }
        self.inode.i_mode.set_perm(mode);
        self.inode.set_ctime(Timespec::now());
        self.inode_dirty = true;
        self.flush()
    }

    /// Replaces the owner and group, splitting the `_high` halves.
    pub fn chown(&mut self, uid: u32, gid: u32) -> CanFail {
        {
            let fs = self.fs.read();
            if !fs.writable {
                return Err(Error::ReadOnly);
            }
        }
        self.inode.set_uid(uid);
        self.inode.set_gid(gid);
        self.inode.set_ctime(Timespec::now());
        self.inode_dirty = true;
        self.flush()
    }

    fn touch_mtime(&mut self) {
        let now = Timespec::now();
        self.inode.set_mtime(now);
        self.inode.set_ctime(now);
        self.inode_dirty = true;
    }

    /// Moves inline payload out of `i_block` into a real data block.
    fn promote_inline(&mut self) -> CanFail {
        let handle = self.fs.clone();
        let mut guard = handle.write();
        let fs = &mut *guard;
        let data = self.inode.block_bytes();
        let size = self.inode.size() as usize;

        self.inode.i_flags.remove(InodeFlags::INLINE_DATA);
        self.inode.i_block = [0; 15];
        if fs.sb.has_incompat(IncompatFeatures::EXTENTS) {
            extent::extent_init(&mut self.inode);
        }
        if size > 0 {
            let phys = bmap::bmap_alloc(fs, self.ino, &mut self.inode, 0)?;
            let mut buf = fs.io.allocate_blk();
            buf[..size].copy_from_slice(&data[..size]);
            fs.write_blk(phys, &buf)?;
        }
        self.inode_dirty = true;
        Ok(())
    }

    /// Makes the cache hold `logical`, flushing whatever it held before.
    ///
    /// With `alloc` unset a hole loads as zeros; with it set the block is
    /// allocated first.
    fn load_block(&mut self, logical: u32, alloc: bool) -> CanFail {
        if let Some(cache) = &self.cache {
            if cache.logical == logical && (cache.phys.is_some() || !alloc) {
                return Ok(());
            }
        }
        let handle = self.fs.clone();
        let mut guard = handle.write();
        let fs = &mut *guard;

        // Write back the outgoing block.
        if let Some(cache) = &mut self.cache {
            if cache.dirty {
                let phys = cache.phys.ok_or(Error::InvalidArgument)?;
                fs.write_blk(phys, &cache.buf)?;
                cache.dirty = false;
            }
        }

        if alloc {
            let existing = bmap::bmap(fs, self.ino, &self.inode, logical)?;
            let (phys, buf) = match existing {
                Some(phys) => (phys, fs.read_blk(phys)?),
                None => {
                    let phys = bmap::bmap_alloc(fs, self.ino, &mut self.inode, logical)?;
                    self.inode_dirty = true;
                    // a freshly allocated block starts as zeros
                    (phys, fs.io.allocate_blk())
                }
            };
            self.cache = Some(CachedBlock {
                logical,
                phys: Some(phys),
                buf,
                dirty: false,
            });
        } else {
            let phys = bmap::bmap(fs, self.ino, &self.inode, logical)?;
            let buf = match phys {
                Some(phys) => fs.read_blk(phys)?,
                None => fs.io.allocate_blk(),
            };
            self.cache = Some(CachedBlock {
                logical,
                phys,
                buf,
                dirty: false,
            });
        }
        Ok(())
    }
}

impl<D: BlockDevice> Drop for File<D> {
    fn drop(&mut self) {
        if self.inode_dirty || self.cache.as_ref().is_some_and(|c| c.dirty) {
            if let Err(err) = self.flush() {
                log::error!("inode {}: flush on drop failed: {err}", self.ino);
            }
        }
    }
}
