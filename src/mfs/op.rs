//! The logical operation set.
//!
//! The variant set is closed: the resolver pattern-matches on it to
//! decide ordering, and the apply path turns each variant into disk
//! writes inside a transaction. A rename contributes two sub-operations
//! sharing one timestamp (the pairing key), plus a barrier in the moved
//! directory's own log when the rename crosses directories.

use crate::mfs::MnodeType;

#[derive(Clone, Debug)]
pub enum Operation {
    /// Bring `mnum` into existence under `parent`.
    Create {
        mnum: u64,
        parent: u64,
        typ: MnodeType,
        timestamp: u64,
    },

    /// Add the directory entry `name -> mnum` in `parent`.
    Link {
        mnum: u64,
        parent: u64,
        name: String,
        typ: MnodeType,
        timestamp: u64,
    },

    /// Remove the directory entry `name` (referring to `mnum`) from
    /// `parent`.
    Unlink {
        parent: u64,
        name: String,
        mnum: u64,
        timestamp: u64,
    },

    /// Ordering marker in a renamed directory's own log: everything that
    /// follows depends on the rename into `parent` being applied.
    RenameBarrier {
        mnum: u64,
        parent: u64,
        timestamp: u64,
    },

    /// The link half of a rename, logged against the destination parent.
    RenameLink {
        src_parent: u64,
        dst_parent: u64,
        mnum: u64,
        newname: String,
        typ: MnodeType,
        timestamp: u64,
    },

    /// The unlink half of a rename, logged against the source parent.
    RenameUnlink {
        src_parent: u64,
        dst_parent: u64,
        mnum: u64,
        name: String,
        timestamp: u64,
    },

    /// Remove `mnum`'s inode and contents from the disk.
    Delete { mnum: u64, timestamp: u64 },
}

impl Operation {
    pub fn timestamp(&self) -> u64 {
        match self {
            Operation::Create { timestamp, .. }
            | Operation::Link { timestamp, .. }
            | Operation::Unlink { timestamp, .. }
            | Operation::RenameBarrier { timestamp, .. }
            | Operation::RenameLink { timestamp, .. }
            | Operation::RenameUnlink { timestamp, .. }
            | Operation::Delete { timestamp, .. } => *timestamp,
        }
    }
}
