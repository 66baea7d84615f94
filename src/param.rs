//! File system geometry and tunable constants.

use core::mem;

/// Block size in bytes. Journal records carry one block of payload each.
pub const BSIZE: usize = 4096;

/// Direct block addresses per inode.
pub const NDIRECT: usize = 10;

/// Block addresses per indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Maximum file size in blocks (direct + indirect + doubly-indirect).
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Maximum length of a path component.
pub const DIRSIZ: usize = 12;

/// Core slots. Threads are folded onto this many per-core oplog buffers
/// and inode-allocation hints.
pub const NCPU: usize = 8;

/// Root directory i-number.
pub const ROOTINO: u32 = 1;

/// Root directory mnode number.
pub const ROOT_MNUM: u64 = 1;

/// Capacity of the superblock's deferred-reclaim inode list.
pub const NRECLAIM_INODES: usize = 32;

/// Largest number of payload blocks one sub-transaction stages; the file
/// sync path chunks page writes at this granularity so a single
/// sub-transaction always fits an empty journal.
pub const MAXOPBLOCKS: usize = 64;

/// On-disk size of a journal record header.
pub const JHDR_SIZE: usize = 32;

/// One journal record: a header followed by a block of payload.
pub const JRECORD_SIZE: usize = JHDR_SIZE + BSIZE;

/// Size of the physical journal file in bytes.
pub const PHYS_JOURNAL_SIZE: usize = 256 * JRECORD_SIZE;

/// Path of the physical journal file.
pub const JOURNAL_PATH: &str = "/sv6journal";
