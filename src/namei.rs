//! Path-to-inode resolution.
//!
//! Paths are resolved component by component from the root (absolute) or a
//! caller-supplied directory (relative). `.` and `..` need no special
//! handling: every directory stores both as real records. Symbolic links
//! are the only source of cycles, bounded by a descent budget and a set of
//! symlink inodes already visited on the chain.

use hashbrown::HashSet;

use crate::dir;
use crate::error::{Error, Ext4Result};
use crate::fs::Ext4Fs;
use crate::inode::{FileKind, Inode, InodeNo};
use crate::io::BlockDevice;

/// Most symlink resolutions allowed while walking one path.
pub const SYMLINK_MAX_DEPTH: usize = 40;

/// Reads a symlink's target bytes: inline from `i_block` for fast symlinks
/// and inline data, from the single data block otherwise.
pub fn read_symlink<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    ino: InodeNo,
    inode: &Inode,
) -> Ext4Result<Vec<u8>> {
    if inode.kind() != FileKind::SymbolicLink {
        return Err(Error::InvalidArgument);
    }
    let size = inode.size();
    if size == 0 || size >= fs.sb.blk_size() {
        return Err(Error::Corrupted("unreasonable symlink size"));
    }
    if !inode.has_valid_blocks() {
        return Ok(inode.block_bytes()[..size as usize].to_vec());
    }
    let phys = crate::bmap::bmap(fs, ino, inode, 0)?
        .ok_or(Error::Corrupted("symlink without target block"))?;
    let buf = fs.read_blk(phys)?;
    Ok(buf[..size as usize].to_vec())
}

struct Walk {
    /// Symlink resolutions left.
    budget: usize,
    /// Symlink inodes already followed on this chain.
    seen: HashSet<InodeNo>,
}

impl Walk {
    fn enter_symlink(&mut self, ino: InodeNo) -> Ext4Result<()> {
        if self.budget == 0 || !self.seen.insert(ino) {
            return Err(Error::SymlinkLoop);
        }
        self.budget -= 1;
        Ok(())
    }
}

fn resolve<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    root: InodeNo,
    cwd: InodeNo,
    path: &[u8],
    follow_terminal: bool,
    walk: &mut Walk,
) -> Ext4Result<InodeNo> {
    let mut current = if path.first() == Some(&b'/') { root } else { cwd };
    let components: Vec<&[u8]> = path.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect();

    for (i, component) in components.iter().enumerate() {
        let last = i + 1 == components.len();
        let dir_inode = fs.read_inode(current)?;
        if dir_inode.kind() != FileKind::Directory {
            return Err(Error::NotADirectory);
        }
        let (ino, _) = dir::lookup(fs, current, &dir_inode, component)?
            .ok_or(Error::NotFound)?;
        let inode = fs.read_inode(ino)?;
        if inode.kind() == FileKind::SymbolicLink && (!last || follow_terminal) {
            walk.enter_symlink(ino)?;
            let target = read_symlink(fs, ino, &inode)?;
            // the target resolves against the directory holding the link
            current = resolve(fs, root, current, &target, true, walk)?;
        } else {
            current = ino;
        }
    }
    Ok(current)
}

/// Resolves `path` to an inode number.
///
/// A symlink in a non-terminal position is always followed; the terminal
/// component is followed only when `follow_terminal` is set. Exceeding
/// [`SYMLINK_MAX_DEPTH`] resolutions, or following the same symlink inode
/// twice, fails with [`Error::SymlinkLoop`].
pub fn namei<D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    root: InodeNo,
    cwd: InodeNo,
    path: &[u8],
    follow_terminal: bool,
) -> Ext4Result<InodeNo> {
    let mut walk = Walk {
        budget: SYMLINK_MAX_DEPTH,
        seen: HashSet::new(),
    };
    resolve(fs, root, cwd, path, follow_terminal, &mut walk)
}

/// Splits `path` into its parent directory and final name, resolving the
/// parent. Fails with [`Error::InvalidArgument`] when the path has no final
/// component (the root, or an empty path).
pub fn namei_parent<'p, D: BlockDevice>(
    fs: &mut Ext4Fs<D>,
    root: InodeNo,
    cwd: InodeNo,
    path: &'p [u8],
) -> Ext4Result<(InodeNo, &'p [u8])> {
    let trimmed = {
        let mut p = path;
        while p.last() == Some(&b'/') {
            p = &p[..p.len() - 1];
        }
        p
    };
    let split = trimmed.iter().rposition(|&b| b == b'/');
    let (parent_path, name) = match split {
        Some(i) => (&trimmed[..i + 1], &trimmed[i + 1..]),
        None => (&b""[..], trimmed),
    };
    if name.is_empty() || name == b"." || name == b".." {
        return Err(Error::InvalidArgument);
    }
    let parent = if parent_path.is_empty() {
        if path.first() == Some(&b'/') {
            root
        } else {
            cwd
        }
    } else {
        namei(fs, root, cwd, parent_path, true)?
    };
    dir::check_directory(fs, parent)?;
    Ok((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_split_handles_trailing_slashes() {
        // pure path-splitting behavior, no filesystem access needed until
        // the parent path is non-trivial
        let mut fs = crate::fs::tests::scratch_fs_with_root();
        let root = crate::inode::ROOT_INO;

        let (parent, name) = namei_parent(&mut fs, root, root, b"/hello").unwrap();
        assert_eq!(parent, root);
        assert_eq!(name, b"hello");

        let (parent, name) = namei_parent(&mut fs, root, root, b"/hello///").unwrap();
        assert_eq!(parent, root);
        assert_eq!(name, b"hello");

        assert!(matches!(
            namei_parent(&mut fs, root, root, b"/"),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            namei_parent(&mut fs, root, root, b"/a/.."),
            Err(Error::InvalidArgument)
        ));
    }
}
