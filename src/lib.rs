//! A multicore-scalable journaling file system.
//!
//! The in-memory namespace is decoupled from the on-disk representation:
//! metadata system calls mutate mnodes and append logical operations to
//! per-object operation logs, absorbing mutations with no cross-core
//! synchronization beyond a per-core buffer. `fsync` runs the dependency
//! resolver, which drains the reachable oplogs into transactions in a
//! causally correct order, and the journal manager commits those
//! transactions to a write-ahead log before writing home locations.
//! Recovery at mount replays the committed prefix of the journal.
//!
//! Bottom to top:
//!   + `device`: the block device trait and host-side implementations.
//!   + `bio`: the buffer cache.
//!   + `fs`: the physical file system — allocator, inodes, directories,
//!     paths, journal, mkfs.
//!   + `oplog`: per-object, per-core logical operation logs.
//!   + `mfs`: mnodes, bindings, the dependency resolver, and the public
//!     operation surface.

pub mod bio;
pub mod cpu;
pub mod device;
pub mod error;
pub mod fs;
pub mod lock;
pub mod mfs;
pub mod oplog;
pub mod param;

pub use device::{BlockDevice, FileDisk, MemDisk};
pub use error::{FsError, Result};
pub use mfs::{MnodeType, ScaleFs};
