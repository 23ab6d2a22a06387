//! Read/write access to ext2/ext3/ext4 filesystem images.
//!
//! The engine operates on an injected [`BlockDevice`] and never touches the
//! host's mounted filesystems. [`Ext4::mount`] validates the superblock,
//! loads the group descriptors and both allocation bitmaps, and hands back a
//! handle exposing a POSIX-like surface: [`Ext4::open`], [`Ext4::readdir`],
//! [`Ext4::mkdir`], [`Ext4::rename`], [`Ext4::symlink`], and friends; byte
//! I/O goes through [`File`] objects.
//!
//! ```no_run
//! use extfs::{Ext4, MemDevice, MountOptions, OpenFlags};
//!
//! # fn main() -> extfs::Ext4Result<()> {
//! let image = std::fs::read("disk.img").unwrap();
//! let fs = Ext4::mount(MemDevice::new(image), MountOptions::default())?;
//! let mut file = fs.open("/hello", OpenFlags::READ, 0)?;
//! let mut buf = [0u8; 64];
//! let n = file.read(&mut buf)?;
//! println!("{}", String::from_utf8_lossy(&buf[..n]));
//! file.close()?;
//! fs.unmount()
//! # }
//! ```
//!
//! Journal recovery, online resize, encryption, quotas and filesystem
//! creation are out of scope; images requiring unknown incompatible
//! features are refused at mount.
//!
//! One handle is single-threaded by contract: callers serialize access,
//! the engine adds no internal locking beyond the shared-handle lock.

pub mod alloc;
pub mod bitmap;
pub mod bmap;
pub mod dir;
pub mod error;
pub mod extent;
pub mod file;
pub mod fs;
pub mod group;
pub mod inode;
pub mod io;
pub mod namei;
pub mod sb;

pub use error::{CanFail, Error, Ext4Result};
pub use file::{File, FileStat, OpenFlags, SeekWhence};
pub use fs::{DirEntry, Ext4, FsStat, MountOptions};
pub use inode::{FileKind, InodeNo, Timespec, ROOT_INO};
pub use io::{BlockDevice, IoChannel, MemDevice};
