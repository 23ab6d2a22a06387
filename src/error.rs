//! Error kinds surfaced by the filesystem engine.
//!
//! Every public operation returns [`Ext4Result`]. Read-path failures abort the
//! operation; write-path failures may leave the in-memory state ahead of the
//! disk until the next [`flush`](crate::fs::Ext4::flush) or unmount.

/// Return type for fallible operations that produce no value.
pub type CanFail = Result<(), Error>;

/// Return type of every public engine operation.
pub type Ext4Result<T> = Result<T, Error>;

/// Errors reported by the engine.
///
/// Structural damage on disk is reported as [`Error::Corrupted`], never as a
/// panic. Failures of the underlying block device always surface as
/// [`Error::Io`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A parameter was out of range or inconsistent with the operation.
    #[error("invalid argument")]
    InvalidArgument,

    /// A path component used as a directory is not one.
    #[error("not a directory")]
    NotADirectory,

    /// The operation requires a non-directory but found a directory.
    #[error("is a directory")]
    IsADirectory,

    /// No entry with the requested name exists.
    #[error("no such file or directory")]
    NotFound,

    /// No free inode, block, or directory slot could be obtained, even after
    /// internal expansion attempts.
    #[error("no space left on filesystem")]
    NoSpace,

    /// More than [`SYMLINK_MAX_DEPTH`](crate::namei::SYMLINK_MAX_DEPTH)
    /// symlink resolutions, or a symlink chain revisited an inode.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,

    /// The file would exceed what its block-map layout can address.
    #[error("file too big")]
    FileTooBig,

    /// The target name already exists.
    #[error("file exists")]
    AlreadyExists,

    /// A directory that must be empty is not.
    #[error("directory not empty")]
    NotEmpty,

    /// The filesystem is busy (multi-mount protection style conditions).
    #[error("device or resource busy")]
    Busy,

    /// The requested attribute does not exist.
    #[error("no data available")]
    NoData,

    /// The on-disk structure requires a feature the engine does not
    /// implement.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// A mutating operation was attempted on a read-only mount.
    #[error("read-only filesystem")]
    ReadOnly,

    /// An on-disk structure failed validation.
    #[error("filesystem corrupted: {0}")]
    Corrupted(&'static str),

    /// The underlying block device failed.
    #[error("i/o error")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error denotes structural damage that should mark the
    /// superblock dirty so the next flush rewrites it.
    pub(crate) fn is_structural(&self) -> bool {
        matches!(self, Self::Corrupted(_))
    }
}
