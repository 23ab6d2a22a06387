//! The filesystem handle and the path-level API.
//!
//! [`Ext4Fs`] owns everything a mount needs: the IO channel, the superblock,
//! the group descriptor table and both allocation bitmaps, plus the dirty
//! flags that drive write-back. Exactly one handle exists per mount; the
//! public [`Ext4`] wrapper shares it with every open [`File`] through the
//! usual locked-handle pattern.
//!
//! Mutation discipline: operations mutate the in-memory state and set dirty
//! flags; [`Ext4::flush`] (or unmounting) persists. After any successful
//! operation followed by a flush, a fresh mount observes the operation.

use std::sync::Arc;

use bytemuck::Zeroable;
use spin::RwLock;

use crate::bitmap::{BitmapCache, BitmapKind};
use crate::bmap;
use crate::dir;
use crate::error::{CanFail, Error, Ext4Result};
use crate::extent;
use crate::file::{File, FileStat, OpenFlags};
use crate::group::GroupTable;
use crate::inode::{
    self, FileKind, FileMode, Inode, InodeFlags, InodeNo, Timespec, ROOT_INO,
    SYMLINK_INLINE_LIMIT,
};
use crate::io::{BlockDevice, IoChannel};
use crate::namei;
use crate::sb::{IncompatFeatures, Superblock};

/// Shared ownership of one mounted filesystem.
pub type LockedFs<D> = Arc<RwLock<Ext4Fs<D>>>;

/// Mount-time options.
#[derive(Clone, Copy, Debug)]
pub struct MountOptions {
    /// Allow mutation. A read-only handle rejects every write operation.
    pub write: bool,
    /// Block number of a backup superblock to mount from; zero means the
    /// primary superblock at byte 1024.
    pub superblock: u64,
    /// Block size accompanying a non-zero `superblock`.
    pub block_size: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            write: true,
            superblock: 0,
            block_size: 0,
        }
    }
}

/// One entry reported by [`Ext4::readdir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, as stored on disk.
    pub name: Vec<u8>,
    /// Referenced inode.
    pub ino: InodeNo,
    /// File type.
    pub kind: FileKind,
}

/// Filesystem-wide statistics reported by [`Ext4::statfs`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStat {
    /// Block size in bytes.
    pub block_size: u64,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub free_blocks: u64,
    /// Total inodes.
    pub inodes: u32,
    /// Free inodes.
    pub free_inodes: u32,
    /// Longest entry name.
    pub name_max: u32,
}

/// The mounted filesystem state.
pub struct Ext4Fs<D: BlockDevice> {
    pub(crate) io: IoChannel<D>,
    pub(crate) sb: Superblock,
    pub(crate) groups: GroupTable,
    pub(crate) inode_bitmap: BitmapCache,
    pub(crate) block_bitmap: BitmapCache,
    pub(crate) writable: bool,
    pub(crate) sb_dirty: bool,
    /// No block changed hands since the last trim pass.
    pub(crate) trim_clean: bool,
}

impl<D: BlockDevice> Ext4Fs<D> {
    /// Reads one whole block.
    pub(crate) fn read_blk(&mut self, blk: u64) -> Ext4Result<Vec<u8>> {
        if blk >= self.sb.blk_count() {
            return Err(Error::Corrupted("block read out of range"));
        }
        let mut buf = self.io.allocate_blk();
        self.io.read_blocks(blk, &mut buf)?;
        Ok(buf)
    }

    /// Writes one whole block.
    pub(crate) fn write_blk(&mut self, blk: u64, buf: &[u8]) -> CanFail {
        if blk >= self.sb.blk_count() {
            return Err(Error::Corrupted("block write out of range"));
        }
        self.io.write_blocks(blk, buf)
    }

    /// Zero-fills one block.
    pub(crate) fn zero_blk(&mut self, blk: u64) -> CanFail {
        let buf = self.io.allocate_blk();
        self.write_blk(blk, &buf)
    }

    /// Reads the record of inode `ino`.
    pub(crate) fn read_inode(&mut self, ino: InodeNo) -> Ext4Result<Inode> {
        inode::read_inode(&mut self.io, &self.sb, &self.groups, ino)
    }

    /// Writes the record of inode `ino`, bumping its version.
    pub(crate) fn write_inode_rec(&mut self, ino: InodeNo, rec: &mut Inode) -> CanFail {
        self.ensure_writable()?;
        inode::write_inode(&mut self.io, &self.sb, &self.groups, ino, rec)
    }

    /// Zeroes the slot of `ino` and writes `rec` into it.
    pub(crate) fn write_new_inode_rec(&mut self, ino: InodeNo, rec: &mut Inode) -> CanFail {
        self.ensure_writable()?;
        inode::write_new_inode(&mut self.io, &self.sb, &self.groups, ino, rec)
    }

    pub(crate) fn ensure_writable(&self) -> CanFail {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Inserts a directory entry, expanding the directory by one block when
    /// every existing block is full.
    fn dir_link(
        &mut self,
        dir_ino: InodeNo,
        dir_inode: &mut Inode,
        name: &[u8],
        target: InodeNo,
        kind: FileKind,
    ) -> CanFail {
        match dir::link(self, dir_ino, dir_inode, name, target, kind) {
            Err(Error::NoSpace) => {
                dir::expand(self, dir_ino, dir_inode)?;
                dir::link(self, dir_ino, dir_inode, name, target, kind)
            }
            other => other,
        }
    }

    /// Final teardown of an unreferenced inode: punches the data blocks,
    /// frees the extended-attribute block, stamps the deletion time and
    /// returns the number to the free pool.
    fn remove_inode(&mut self, ino: InodeNo, rec: &mut Inode) -> CanFail {
        let is_dir = rec.kind() == FileKind::Directory;
        bmap::punch(self, ino, rec, 0, u32::MAX)?;
        let acl = rec.file_acl();
        if acl != 0 {
            self.free_blocks(acl, 1)?;
            rec.i_file_acl_lo = 0;
            rec.i_file_acl_high = 0;
        }
        let now = Timespec::now();
        rec.set_size(0);
        rec.i_links_count = 0;
        rec.i_dtime = now.sec as u32;
        self.write_inode_rec(ino, rec)?;
        self.release_inode(ino, is_dir)
    }

    /// Stamps and persists a parent directory after a namespace change.
    fn touch_dir(&mut self, ino: InodeNo, rec: &mut Inode) -> CanFail {
        let now = Timespec::now();
        rec.set_mtime(now);
        rec.set_ctime(now);
        self.write_inode_rec(ino, rec)
    }

    /// Seeds a fresh inode record with type, permissions and timestamps.
    fn new_inode_record(&self, kind: FileKind, perm: u16) -> Inode {
        let mut rec = Inode::zeroed();
        rec.i_mode = FileMode::new(kind.to_mode_bits(), perm);
        rec.i_links_count = 1;
        let now = Timespec::now();
        rec.set_atime(now);
        rec.set_mtime(now);
        rec.set_ctime(now);
        if self.sb.inode_size() > 128 {
            rec.i_extra_isize = (crate::inode::INODE_RECORD_SIZE - 128) as u16;
        }
        rec.set_crtime(now);
        rec
    }

    /// Writes back everything dirty: bitmaps, group descriptors, the
    /// superblock, then the device itself.
    pub(crate) fn flush_metadata(&mut self) -> CanFail {
        if !self.writable {
            return Ok(());
        }
        self.inode_bitmap
            .flush(&mut self.io, &self.sb, &mut self.groups)?;
        self.block_bitmap
            .flush(&mut self.io, &self.sb, &mut self.groups)?;
        self.groups.flush(&mut self.io, &self.sb)?;
        if self.sb_dirty {
            self.sb.s_wtime = Timespec::now().sec as u32;
            self.sb.write(&mut self.io)?;
            self.sb_dirty = false;
        }
        self.io.flush()
    }
}

/// A mounted filesystem.
///
/// Cloning the handle shares the same mount; open [`File`]s hold a clone of
/// their own. All calls on one handle must be externally serialized with
/// respect to each other; the engine performs no internal fine-grained
/// locking beyond the handle lock itself.
pub struct Ext4<D: BlockDevice> {
    inner: LockedFs<D>,
}

impl<D: BlockDevice> Clone for Ext4<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: BlockDevice> Ext4<D> {
    /// Mounts the filesystem on `device`.
    ///
    /// Reads and validates the superblock, loads the group descriptor table
    /// and both allocation bitmaps. Filesystems carrying incompatible
    /// features the engine does not implement are refused.
    pub fn mount(device: D, options: MountOptions) -> Ext4Result<Self> {
        let mut io = IoChannel::new(device);
        let sb = Superblock::read(&mut io, options.superblock, options.block_size)?;
        io.set_block_size(sb.blk_size() as u32);
        let groups = GroupTable::load(&mut io, &sb)?;
        let inode_bitmap = BitmapCache::load(&mut io, &sb, &groups, BitmapKind::Inode)?;
        let block_bitmap = BitmapCache::load(&mut io, &sb, &groups, BitmapKind::Block)?;
        let mut fs = Ext4Fs {
            io,
            sb,
            groups,
            inode_bitmap,
            block_bitmap,
            writable: options.write,
            sb_dirty: false,
            trim_clean: false,
        };
        if fs.writable {
            fs.sb.s_mtime = Timespec::now().sec as u32;
            fs.sb.s_mnt_count = fs.sb.s_mnt_count.wrapping_add(1);
            fs.sb_dirty = true;
        }
        log::info!(
            "mounted: {} blocks of {} bytes, {} inodes, {} groups",
            fs.sb.blk_count(),
            fs.sb.blk_size(),
            fs.sb.s_inodes_count,
            fs.groups.count()
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(fs)),
        })
    }

    /// Runs `f` under the handle lock, recording structural errors so the
    /// next flush rewrites the superblock.
    fn with<R>(&self, f: impl FnOnce(&mut Ext4Fs<D>) -> Ext4Result<R>) -> Ext4Result<R> {
        let mut guard = self.inner.write();
        let fs = &mut *guard;
        let result = f(fs);
        if let Err(err) = &result {
            if err.is_structural() {
                fs.sb_dirty = true;
            }
        }
        result
    }

    /// Opens (and possibly creates) the file at `path`.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u16) -> Ext4Result<File<D>> {
        let follow = !flags.contains(OpenFlags::NOFOLLOW);
        let ino = self.with(|fs| {
            match namei::namei(fs, ROOT_INO, ROOT_INO, path.as_bytes(), follow) {
                Ok(ino) => {
                    if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                        return Err(Error::AlreadyExists);
                    }
                    Ok(ino)
                }
                Err(Error::NotFound) if flags.contains(OpenFlags::CREAT) => {
                    create_file(fs, path.as_bytes(), mode)
                }
                Err(err) => Err(err),
            }
        })?;
        let rec = self.with(|fs| {
            let rec = fs.read_inode(ino)?;
            match rec.kind() {
                FileKind::Directory => {
                    if flags.intersects(OpenFlags::WRITE) {
                        return Err(Error::IsADirectory);
                    }
                }
                FileKind::SymbolicLink => {
                    // only reachable with NOFOLLOW; the link itself is not
                    // openable
                    return Err(Error::SymlinkLoop);
                }
                _ => {
                    if flags.contains(OpenFlags::DIRECTORY) {
                        return Err(Error::NotADirectory);
                    }
                }
            }
            Ok(rec)
        })?;
        let mut file = File::new(self.inner.clone(), ino, rec, flags);
        if flags.contains(OpenFlags::TRUNC) && flags.contains(OpenFlags::WRITE) {
            file.set_size(0)?;
            file.flush()?;
        }
        Ok(file)
    }

    /// Reports the entries of the directory at `path`, `.` and `..`
    /// excluded.
    pub fn readdir(&self, path: &str) -> Ext4Result<Vec<DirEntry>> {
        self.with(|fs| {
            let ino = namei::namei(fs, ROOT_INO, ROOT_INO, path.as_bytes(), true)?;
            let rec = fs.read_inode(ino)?;
            if rec.kind() != FileKind::Directory {
                return Err(Error::NotADirectory);
            }
            let mut out = Vec::new();
            for ent in dir::read_entries(fs, ino, &rec)? {
                if ent.name == b"." || ent.name == b".." {
                    continue;
                }
                let kind = match ent.kind(&fs.sb) {
                    Some(kind) if kind != FileKind::Unknown => kind,
                    _ => fs.read_inode(ent.inode)?.kind(),
                };
                out.push(DirEntry {
                    ino: ent.inode,
                    kind,
                    name: ent.name,
                });
            }
            Ok(out)
        })
    }

    /// Creates a directory at `path`.
    pub fn mkdir(&self, path: &str, mode: u16) -> CanFail {
        self.with(|fs| {
            fs.ensure_writable()?;
            let (parent, name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, path.as_bytes())?;
            let mut parent_rec = fs.read_inode(parent)?;
            if dir::lookup(fs, parent, &parent_rec, name)?.is_some() {
                return Err(Error::AlreadyExists);
            }
            if parent_rec.i_links_count == u16::MAX {
                return Err(Error::NoSpace);
            }
            let ino = fs.alloc_inode(parent, true)?;
            let mut rec = fs.new_inode_record(FileKind::Directory, mode);
            rec.i_links_count = 2;
            if fs.sb.has_incompat(IncompatFeatures::EXTENTS) {
                extent::extent_init(&mut rec);
            }
            dir::mkdir_seed(fs, ino, &mut rec, parent)?;
            fs.write_new_inode_rec(ino, &mut rec)?;
            fs.dir_link(parent, &mut parent_rec, name, ino, FileKind::Directory)?;
            parent_rec.i_links_count += 1;
            fs.touch_dir(parent, &mut parent_rec)
        })
    }

    /// Removes the empty directory at `path`.
    pub fn rmdir(&self, path: &str) -> CanFail {
        self.with(|fs| {
            fs.ensure_writable()?;
            let (parent, name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, path.as_bytes())?;
            let mut parent_rec = fs.read_inode(parent)?;
            let (ino, _) = dir::lookup(fs, parent, &parent_rec, name)?.ok_or(Error::NotFound)?;
            let mut rec = fs.read_inode(ino)?;
            if rec.kind() != FileKind::Directory {
                return Err(Error::NotADirectory);
            }
            if !dir::is_empty(fs, ino, &rec)? {
                return Err(Error::NotEmpty);
            }
            dir::unlink(fs, parent, &parent_rec, name)?;
            parent_rec.i_links_count = parent_rec.i_links_count.saturating_sub(1);
            fs.touch_dir(parent, &mut parent_rec)?;
            // a directory is linked from itself as well; both references die
            fs.remove_inode(ino, &mut rec)
        })
    }

    /// Removes the non-directory at `path`.
    pub fn unlink(&self, path: &str) -> CanFail {
        self.with(|fs| {
            fs.ensure_writable()?;
            let (parent, name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, path.as_bytes())?;
            let mut parent_rec = fs.read_inode(parent)?;
            let (ino, _) = dir::lookup(fs, parent, &parent_rec, name)?.ok_or(Error::NotFound)?;
            let mut rec = fs.read_inode(ino)?;
            if rec.kind() == FileKind::Directory {
                return Err(Error::IsADirectory);
            }
            dir::unlink(fs, parent, &parent_rec, name)?;
            rec.i_links_count = rec.i_links_count.saturating_sub(1);
            if rec.i_links_count == 0 {
                fs.remove_inode(ino, &mut rec)?;
            } else {
                rec.set_ctime(Timespec::now());
                fs.write_inode_rec(ino, &mut rec)?;
            }
            fs.touch_dir(parent, &mut parent_rec)
        })
    }

    /// Creates a hard link `dest` to the file at `src`.
    pub fn link(&self, src: &str, dest: &str) -> CanFail {
        self.with(|fs| {
            fs.ensure_writable()?;
            let ino = namei::namei(fs, ROOT_INO, ROOT_INO, src.as_bytes(), true)?;
            let mut rec = fs.read_inode(ino)?;
            if rec.kind() == FileKind::Directory {
                return Err(Error::IsADirectory);
            }
            if rec.i_links_count == u16::MAX {
                return Err(Error::NoSpace);
            }
            let (parent, name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, dest.as_bytes())?;
            let mut parent_rec = fs.read_inode(parent)?;
            if dir::lookup(fs, parent, &parent_rec, name)?.is_some() {
                return Err(Error::AlreadyExists);
            }
            fs.dir_link(parent, &mut parent_rec, name, ino, rec.kind())?;
            rec.i_links_count += 1;
            rec.set_ctime(Timespec::now());
            fs.write_inode_rec(ino, &mut rec)?;
            fs.touch_dir(parent, &mut parent_rec)
        })
    }

    /// Creates a symbolic link at `linkpath` holding `target`.
    pub fn symlink(&self, target: &str, linkpath: &str) -> CanFail {
        self.with(|fs| {
            fs.ensure_writable()?;
            let target = target.as_bytes();
            if target.is_empty() || target.len() as u64 >= fs.sb.blk_size() {
                return Err(Error::InvalidArgument);
            }
            let (parent, name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, linkpath.as_bytes())?;
            let mut parent_rec = fs.read_inode(parent)?;
            if dir::lookup(fs, parent, &parent_rec, name)?.is_some() {
                return Err(Error::AlreadyExists);
            }
            let ino = fs.alloc_inode(parent, false)?;
            let mut rec = fs.new_inode_record(FileKind::SymbolicLink, 0o777);
            if target.len() as u64 <= SYMLINK_INLINE_LIMIT {
                // fast symlink: the target lives in i_block
                rec.set_block_bytes(target);
            } else {
                if fs.sb.has_incompat(IncompatFeatures::EXTENTS) {
                    extent::extent_init(&mut rec);
                }
                let phys = bmap::bmap_alloc(fs, ino, &mut rec, 0)?;
                let mut buf = fs.io.allocate_blk();
                buf[..target.len()].copy_from_slice(target);
                fs.write_blk(phys, &buf)?;
            }
            rec.set_size(target.len() as u64);
            fs.write_new_inode_rec(ino, &mut rec)?;
            fs.dir_link(parent, &mut parent_rec, name, ino, FileKind::SymbolicLink)?;
            fs.touch_dir(parent, &mut parent_rec)
        })
    }

    /// Reads the target of the symlink at `path`, without following it.
    pub fn readlink(&self, path: &str) -> Ext4Result<Vec<u8>> {
        self.with(|fs| {
            let ino = namei::namei(fs, ROOT_INO, ROOT_INO, path.as_bytes(), false)?;
            let rec = fs.read_inode(ino)?;
            namei::read_symlink(fs, ino, &rec)
        })
    }

    /// Moves `from` to `to`.
    ///
    /// An existing target is replaced; a target directory must be empty.
    /// The operation is not transactional: an error in the middle leaves
    /// the steps already performed in place.
    pub fn rename(&self, from: &str, to: &str) -> CanFail {
        self.with(|fs| rename_inner(fs, from.as_bytes(), to.as_bytes()))?;
        self.flush()
    }

    /// Reports filesystem-wide statistics.
    pub fn statfs(&self) -> Ext4Result<FsStat> {
        self.with(|fs| {
            Ok(FsStat {
                block_size: fs.sb.blk_size(),
                blocks: fs.sb.blk_count(),
                free_blocks: fs.sb.free_blk_count(),
                inodes: fs.sb.s_inodes_count,
                free_inodes: fs.sb.s_free_inodes_count,
                name_max: dir::NAME_MAX as u32,
            })
        })
    }

    /// Stats the file at `path`, following symlinks.
    pub fn stat(&self, path: &str) -> Ext4Result<FileStat> {
        self.with(|fs| {
            let ino = namei::namei(fs, ROOT_INO, ROOT_INO, path.as_bytes(), true)?;
            Ok(FileStat::from_inode(&fs.read_inode(ino)?))
        })
    }

    /// Issues a discard for every maximal run of free blocks.
    ///
    /// Idempotent: repeating the pass with no allocation activity in
    /// between discards nothing.
    pub fn trim(&self) -> CanFail {
        self.with(|fs| {
            if fs.trim_clean {
                return Ok(());
            }
            let Ext4Fs {
                io, block_bitmap, ..
            } = fs;
            block_bitmap.for_each_clear_run(|start, len| io.discard_blocks(start, len))?;
            fs.trim_clean = true;
            Ok(())
        })
    }

    /// Persists every dirty structure and flushes the device.
    pub fn flush(&self) -> CanFail {
        self.with(|fs| fs.flush_metadata())
    }

    /// Flushes and releases the mount.
    ///
    /// Fails with [`Error::Busy`] while file objects are still open.
    pub fn unmount(self) -> CanFail {
        self.flush()?;
        match Arc::try_unwrap(self.inner) {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Busy),
        }
    }
}

/// Creates a regular file and links it into its parent.
fn create_file<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    path: &[u8],
    mode: u16,
) -> Ext4Result<InodeNo> {
    fs.ensure_writable()?;
    let (parent, name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, path)?;
    let mut parent_rec = fs.read_inode(parent)?;
    if dir::lookup(fs, parent, &parent_rec, name)?.is_some() {
        return Err(Error::AlreadyExists);
    }
    let ino = fs.alloc_inode(parent, false)?;
    let mut rec = fs.new_inode_record(FileKind::Regular, mode);
    if fs.sb.has_incompat(IncompatFeatures::INLINE_DATA) {
        rec.i_flags.insert(InodeFlags::INLINE_DATA);
    } else if fs.sb.has_incompat(IncompatFeatures::EXTENTS) {
        extent::extent_init(&mut rec);
    }
    fs.write_new_inode_rec(ino, &mut rec)?;
    fs.dir_link(parent, &mut parent_rec, name, ino, FileKind::Regular)?;
    fs.touch_dir(parent, &mut parent_rec)?;
    Ok(ino)
}

fn rename_inner<D: BlockDevice>(fs: &mut Ext4Fs<D>, from: &[u8], to: &[u8]) -> CanFail {
    fs.ensure_writable()?;
    let (from_parent, from_name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, from)?;
    let from_parent_rec = fs.read_inode(from_parent)?;
    let (ino, _) =
        dir::lookup(fs, from_parent, &from_parent_rec, from_name)?.ok_or(Error::NotFound)?;
    let rec = fs.read_inode(ino)?;
    let is_dir = rec.kind() == FileKind::Directory;

    let (to_parent, to_name) = namei::namei_parent(fs, ROOT_INO, ROOT_INO, to)?;
    let same_parent = to_parent == from_parent;
    let mut to_parent_rec = if same_parent {
        from_parent_rec
    } else {
        fs.read_inode(to_parent)?
    };

    // Replace an existing target first.
    if let Some((existing, _)) = dir::lookup(fs, to_parent, &to_parent_rec, to_name)? {
        if existing == ino {
            return Ok(());
        }
        let mut existing_rec = fs.read_inode(existing)?;
        let existing_is_dir = existing_rec.kind() == FileKind::Directory;
        if existing_is_dir {
            if !is_dir {
                return Err(Error::IsADirectory);
            }
            if !dir::is_empty(fs, existing, &existing_rec)? {
                return Err(Error::NotEmpty);
            }
        } else if is_dir {
            return Err(Error::NotADirectory);
        }
        dir::unlink(fs, to_parent, &to_parent_rec, to_name)?;
        if existing_is_dir {
            to_parent_rec.i_links_count -= 1;
            fs.remove_inode(existing, &mut existing_rec)?;
        } else {
            existing_rec.i_links_count = existing_rec.i_links_count.saturating_sub(1);
            if existing_rec.i_links_count == 0 {
                fs.remove_inode(existing, &mut existing_rec)?;
            } else {
                existing_rec.set_ctime(Timespec::now());
                fs.write_inode_rec(existing, &mut existing_rec)?;
            }
        }
    }

    fs.dir_link(to_parent, &mut to_parent_rec, to_name, ino, rec.kind())?;
    if is_dir && !same_parent {
        dir::update_dotdot(fs, ino, &rec, to_parent)?;
        to_parent_rec.i_links_count += 1;
    }

    if same_parent {
        dir::unlink(fs, to_parent, &to_parent_rec, from_name)?;
        fs.touch_dir(to_parent, &mut to_parent_rec)?;
    } else {
        fs.dir_unlink_from(from_parent, from_name)?;
        if is_dir {
            let mut from_parent_rec = fs.read_inode(from_parent)?;
            from_parent_rec.i_links_count -= 1;
            fs.touch_dir(from_parent, &mut from_parent_rec)?;
        } else {
            let mut from_parent_rec = fs.read_inode(from_parent)?;
            fs.touch_dir(from_parent, &mut from_parent_rec)?;
        }
        fs.touch_dir(to_parent, &mut to_parent_rec)?;
    }
    Ok(())
}

impl<D: BlockDevice> Ext4Fs<D> {
    /// Removes `name` from the directory `parent`, re-reading the parent
    /// record first.
    fn dir_unlink_from(&mut self, parent: InodeNo, name: &[u8]) -> CanFail {
        let rec = self.read_inode(parent)?;
        dir::unlink(self, parent, &rec, name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bitmap::{BitmapCache, BitmapKind};
    use crate::group::{GroupDescriptor, GroupTable};
    use crate::io::MemDevice;
    use crate::sb::EXT4_SIGNATURE;

    /// A one-group, 512-block, 1 KiB-block scratch filesystem with nothing
    /// in it, not even a root directory. Metadata lives in blocks 1..13.
    pub(crate) fn scratch_fs() -> Ext4Fs<MemDevice> {
        let block_count = 512u64;
        let device = MemDevice::new(vec![0u8; (block_count * 1024) as usize]);
        let mut io = IoChannel::new(device);
        io.set_block_size(1024);

        let mut sb = Superblock::zeroed();
        sb.s_magic = EXT4_SIGNATURE;
        sb.s_rev_level = 1;
        sb.s_inode_size = 128;
        sb.s_first_ino = 11;
        sb.s_inodes_count = 64;
        sb.s_inodes_per_group = 64;
        sb.s_blocks_count_lo = block_count as u32;
        sb.s_blocks_per_group = 8192;
        sb.s_first_data_block = 1;
        sb.s_log_block_size = 0;
        sb.s_feature_incompat = IncompatFeatures::FILETYPE | IncompatFeatures::EXTENTS;

        let mut desc = GroupDescriptor::zeroed();
        desc.bg_block_bitmap_lo = 3;
        desc.bg_inode_bitmap_lo = 4;
        desc.bg_inode_table_lo = 5;
        let groups = GroupTable::from_descs(vec![desc]);

        let mut inode_bitmap = BitmapCache::empty(BitmapKind::Inode, 1, 64, 64, 1);
        for ino in 1..=10u64 {
            inode_bitmap.set(ino).unwrap();
        }
        // inode table spans 64 * 128 bytes = 8 blocks (5..13)
        let mut block_bitmap =
            BitmapCache::empty(BitmapKind::Block, 1, 8192, block_count - 1, 1);
        for blk in 1..13u64 {
            block_bitmap.set(blk).unwrap();
        }

        let mut fs = Ext4Fs {
            io,
            sb,
            groups,
            inode_bitmap,
            block_bitmap,
            writable: true,
            sb_dirty: false,
            trim_clean: false,
        };
        let free_blocks = fs.block_bitmap.count_free();
        let free_inodes = fs.inode_bitmap.count_free();
        fs.sb.set_free_blk_count(free_blocks);
        fs.sb.s_free_inodes_count = free_inodes as u32;
        let sb = fs.sb;
        let desc = fs.groups.desc_mut(0).unwrap();
        desc.set_free_blocks_count(&sb, free_blocks as u32);
        desc.set_free_inodes_count(&sb, free_inodes as u32);
        fs
    }

    /// A scratch filesystem with a seeded root directory.
    pub(crate) fn scratch_fs_with_root() -> Ext4Fs<MemDevice> {
        let mut fs = scratch_fs();
        let mut root = fs.new_inode_record(FileKind::Directory, 0o755);
        root.i_links_count = 2;
        extent::extent_init(&mut root);
        dir::mkdir_seed(&mut fs, ROOT_INO, &mut root, ROOT_INO).unwrap();
        fs.write_new_inode_rec(ROOT_INO, &mut root).unwrap();
        let sb = fs.sb;
        let desc = fs.groups.desc_mut(0).unwrap();
        desc.set_used_dirs_count(&sb, 1);
        fs
    }

    #[test]
    fn scratch_root_has_dot_and_dotdot() {
        let mut fs = scratch_fs_with_root();
        let root = fs.read_inode(ROOT_INO).unwrap();
        assert_eq!(root.kind(), FileKind::Directory);
        let entries = dir::read_entries(&mut fs, ROOT_INO, &root).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b".");
        assert_eq!(entries[0].inode, ROOT_INO);
        assert_eq!(entries[1].name, b"..");
        assert_eq!(entries[1].inode, ROOT_INO);
        assert!(dir::is_empty(&mut fs, ROOT_INO, &root).unwrap());
    }

    #[test]
    fn dir_link_expands_when_full() {
        let mut fs = scratch_fs_with_root();
        let mut root = fs.read_inode(ROOT_INO).unwrap();
        // 1 KiB blocks hold ~60 sixteen-byte entries; push past one block
        for i in 0..80 {
            let name = format!("file{i:03}");
            fs.dir_link(ROOT_INO, &mut root, name.as_bytes(), 12, FileKind::Regular)
                .unwrap();
        }
        assert!(root.size() > fs.sb.blk_size());
        let entries = dir::read_entries(&mut fs, ROOT_INO, &root).unwrap();
        assert_eq!(entries.len(), 82);
    }
}
