//! Error taxonomy.
//!
//! Resource exhaustion and user-visible failures travel as `FsError`;
//! invariant violations that indicate a corrupted file system panic at the
//! point of detection instead of surfacing here.

pub type Result<T> = core::result::Result<T, FsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("out of blocks")]
    OutOfBlocks,

    #[error("out of inodes")]
    OutOfInodes,

    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("directory not empty")]
    NotEmpty,

    #[error("path component too long")]
    NameTooLong,

    #[error("file too large")]
    FileTooBig,

    #[error("bad file handle")]
    BadFd,

    #[error("invalid path")]
    InvalidPath,
}
