//! Dependency resolver.
//!
//! `fsync` drains oplogs into journaled transactions in a causally
//! correct order. Three stacks drive the walk: the pending stack of
//! oplogs still to drain, the rename stack of half-seen rename pairs,
//! and the barrier stack for renamed-directory ordering markers.
//!
//! The invariants that fall out: a create is applied before any link to
//! the created object, the two halves of a rename are applied in one
//! transaction, and cross-object ordering follows timestamp order.

use log::debug;

use std::sync::Arc;

use crate::fs::inode::{Inode, T_DIR};
use crate::fs::journal::Transaction;
use crate::oplog::MfsLogicalLog;
use crate::param::ROOT_MNUM;

use super::op::Operation;
use super::{MnodeType, ScaleFs};

/// What `process_ops_from_oplog` ran into.
enum OplogOutcome {
    /// Processed everything asked for in this log.
    Done,

    /// A link whose target has no inode yet; the target's create was
    /// pushed as a dependency.
    Link,

    /// A rename barrier; the new parent was pushed as a dependency.
    RenameBarrier,

    /// First half of a rename pair; the counterpart's log was pushed.
    RenameSubop,

    /// Second half of a rename pair; both halves are ready to apply.
    RenamePair,
}

#[derive(Clone, Copy)]
struct PendingMetadata {
    mnum: u64,
    max_tsc: u64,

    /// Number of operations to process; -1 means all, 1 means "only the
    /// create of this mnode" (the link-dependency mode).
    count: i32,
}

struct RenameMetadata {
    src_parent: u64,
    dst_parent: u64,
    timestamp: u64,
}

struct RenameBarrierMetadata {
    mnum: u64,
    timestamp: u64,
}

impl ScaleFs {
    /// Drain every metadata operation with timestamp <= `max_tsc`
    /// reachable from `mnum`. The target's current parent is drained
    /// too: that is where the target's name (link, rename) is logged.
    pub(super) fn process_metadata_log(&self, max_tsc: u64, mnum: u64) {
        let mut pending = vec![PendingMetadata {
            mnum,
            max_tsc,
            count: -1,
        }];
        if let Ok(m) = self.mnode(mnum) {
            let parent = m.parent.load(core::sync::atomic::Ordering::Relaxed);
            if parent != 0 && parent != mnum {
                pending.push(PendingMetadata {
                    mnum: parent,
                    max_tsc,
                    count: -1,
                });
            }
        }

        let mut rename_stack: Vec<RenameMetadata> = Vec::new();
        let mut barrier_stack: Vec<RenameBarrierMetadata> = Vec::new();

        while let Some(pm) = pending.last().copied() {
            let log = self.oplog(pm.mnum);
            let outcome = {
                let _serial = log.lock.lock();
                self.process_ops_from_oplog(
                    &log,
                    pm.max_tsc,
                    pm.count,
                    &mut pending,
                    &mut rename_stack,
                    &mut barrier_stack,
                )
            };

            match outcome {
                OplogOutcome::Done => {
                    pending.pop();
                }
                OplogOutcome::Link | OplogOutcome::RenameBarrier | OplogOutcome::RenameSubop => {
                    continue;
                }
                OplogOutcome::RenamePair => {
                    self.apply_rename_pair(&mut rename_stack);
                    // The counterpart's log was fully handled by the pair
                    // application; drop its pending entry.
                    pending.pop();
                }
            }
        }

        assert!(rename_stack.is_empty() && barrier_stack.is_empty());
    }

    /// Gather operations from `log` up to `max_tsc` and process the first
    /// `count` of them (all when -1). `count == 1` processes only a
    /// leading create: the dependency a link needs before it can apply.
    fn process_ops_from_oplog(
        &self,
        log: &MfsLogicalLog,
        max_tsc: u64,
        count: i32,
        pending: &mut Vec<PendingMetadata>,
        rename_stack: &mut Vec<RenameMetadata>,
        barrier_stack: &mut Vec<RenameBarrierMetadata>,
    ) -> OplogOutcome {
        let mut ops = log.synchronize_upto_tsc(max_tsc);
        if ops.is_empty() {
            return OplogOutcome::Done;
        }

        let process_create = count == 1;
        let mut remaining = if count < 0 { ops.len() as i64 } else { count as i64 };

        while !ops.is_empty() && remaining > 0 {
            remaining -= 1;

            if process_create {
                if matches!(ops[0], Operation::Create { .. }) {
                    let op = ops.remove(0);
                    self.add_op_to_journal(op);
                }
                return OplogOutcome::Done;
            }

            match &ops[0] {
                Operation::Link {
                    mnum,
                    parent,
                    timestamp,
                    ..
                } if self.inum_lookup(*mnum).is_none()
                    || self.inum_lookup(*parent).is_none() =>
                {
                    // Either side of the link has no inode yet; its
                    // create must be applied first.
                    let missing = if self.inum_lookup(*mnum).is_none() {
                        *mnum
                    } else {
                        *parent
                    };
                    pending.push(PendingMetadata {
                        mnum: missing,
                        max_tsc: *timestamp,
                        count: 1,
                    });
                    return OplogOutcome::Link;
                }

                Operation::RenameBarrier {
                    mnum,
                    parent,
                    timestamp,
                } => {
                    if *mnum == ROOT_MNUM {
                        ops.remove(0);
                        continue;
                    }
                    if let Some(top) = barrier_stack.last() {
                        if top.mnum == *mnum && top.timestamp == *timestamp {
                            // Came back around: the parent's rename is
                            // applied, the barrier is spent.
                            barrier_stack.pop();
                            ops.remove(0);
                            continue;
                        }
                    }
                    barrier_stack.push(RenameBarrierMetadata {
                        mnum: *mnum,
                        timestamp: *timestamp,
                    });
                    pending.push(PendingMetadata {
                        mnum: *parent,
                        max_tsc: *timestamp,
                        count: -1,
                    });
                    return OplogOutcome::RenameBarrier;
                }

                Operation::RenameLink {
                    mnum, timestamp, ..
                } if self.inum_lookup(*mnum).is_none() => {
                    // The moved object was never synced; apply its create
                    // before the rename half can be written.
                    pending.push(PendingMetadata {
                        mnum: *mnum,
                        max_tsc: *timestamp,
                        count: 1,
                    });
                    return OplogOutcome::Link;
                }

                Operation::RenameLink {
                    src_parent,
                    dst_parent,
                    timestamp,
                    ..
                } => {
                    let prev_ts = rename_stack.last().map_or(0, |r| r.timestamp);
                    rename_stack.push(RenameMetadata {
                        src_parent: *src_parent,
                        dst_parent: *dst_parent,
                        timestamp: *timestamp,
                    });
                    // We have the link half; the unlink half lives in the
                    // source parent's log.
                    pending.push(PendingMetadata {
                        mnum: *src_parent,
                        max_tsc: *timestamp,
                        count: -1,
                    });
                    return if prev_ts == *timestamp {
                        OplogOutcome::RenamePair
                    } else {
                        OplogOutcome::RenameSubop
                    };
                }

                Operation::RenameUnlink {
                    src_parent,
                    dst_parent,
                    timestamp,
                    ..
                } => {
                    let prev_ts = rename_stack.last().map_or(0, |r| r.timestamp);
                    rename_stack.push(RenameMetadata {
                        src_parent: *src_parent,
                        dst_parent: *dst_parent,
                        timestamp: *timestamp,
                    });
                    // We have the unlink half; the link half lives in the
                    // destination parent's log.
                    pending.push(PendingMetadata {
                        mnum: *dst_parent,
                        max_tsc: *timestamp,
                        count: -1,
                    });
                    return if prev_ts == *timestamp {
                        OplogOutcome::RenamePair
                    } else {
                        OplogOutcome::RenameSubop
                    };
                }

                _ => {
                    let op = ops.remove(0);
                    self.add_op_to_journal(op);
                }
            }
        }

        OplogOutcome::Done
    }

    /// The top two rename-stack entries form a pair. Lock both parents'
    /// oplogs (mnum order; once when they coincide), re-verify that the
    /// two sub-operations are still at the front of their logs, and apply
    /// them in a single transaction.
    fn apply_rename_pair(&self, rename_stack: &mut Vec<RenameMetadata>) {
        let rm1 = rename_stack.pop().expect("rename pair underflow");
        let rm2 = rename_stack.pop().expect("rename pair underflow");
        // Globally unique timestamps make this sufficient to pair them.
        assert_eq!(rm1.timestamp, rm2.timestamp, "mismatched rename pair");
        let ts = rm1.timestamp;
        let src = rm1.src_parent;
        let dst = rm1.dst_parent;

        let src_log = self.oplog(src);

        if src == dst {
            let _serial = src_log.lock.lock();
            let mut ops = src_log.synchronize_upto_tsc(ts);

            // Both halves sit at the front of the same log.
            let has_pair = ops.len() >= 2
                && matches!(&ops[0], Operation::RenameLink { timestamp, .. } if *timestamp == ts)
                && matches!(&ops[1], Operation::RenameUnlink { timestamp, .. } if *timestamp == ts);
            if !has_pair {
                // A concurrent fsync already flushed the pair.
                debug!("rename pair at ts {} already applied", ts);
                return;
            }
            let link = ops.remove(0);
            let unlink = ops.remove(0);
            drop(ops);
            self.apply_rename_ops(link, unlink, ts);
            return;
        }

        let dst_log = self.oplog(dst);
        let (first, second) = if src < dst {
            (&src_log, &dst_log)
        } else {
            (&dst_log, &src_log)
        };
        let _serial1 = first.lock.lock();
        let _serial2 = second.lock.lock();

        let mut src_ops = src_log.synchronize_upto_tsc(ts);
        let mut dst_ops = dst_log.synchronize_upto_tsc(ts);

        let link_ready = matches!(
            dst_ops.first(),
            Some(Operation::RenameLink { timestamp, .. }) if *timestamp == ts
        );
        let unlink_ready = matches!(
            src_ops.first(),
            Some(Operation::RenameUnlink { timestamp, .. }) if *timestamp == ts
        );
        if !link_ready || !unlink_ready {
            debug!("rename pair at ts {} already applied", ts);
            return;
        }

        let link = dst_ops.remove(0);
        let unlink = src_ops.remove(0);
        drop(src_ops);
        drop(dst_ops);
        self.apply_rename_ops(link, unlink, ts);
    }

    /// Both halves of a rename in one transaction, or neither.
    fn apply_rename_ops(&self, link: Operation, unlink: Operation, ts: u64) {
        let mut tr = Transaction::new(ts);
        self.apply_op(&link, &mut tr);
        self.apply_op(&unlink, &mut tr);
        let mut jr = self.fs.journal.prepare_for_commit();
        self.fs.add_to_journal_locked(&mut jr, tr);
    }

    /// Apply one operation into a fresh transaction and queue it.
    fn add_op_to_journal(&self, op: Operation) {
        let mut tr = Transaction::new(op.timestamp());
        self.apply_op(&op, &mut tr);
        let mut jr = self.fs.journal.prepare_for_commit();
        self.fs.add_to_journal_locked(&mut jr, tr);
    }

    fn apply_op(&self, op: &Operation, tr: &mut Transaction) {
        match op {
            Operation::Create {
                mnum, parent, typ, ..
            } => {
                self.create_file_dir_if_new(*mnum, *parent, *typ, tr);
            }
            Operation::Link {
                mnum,
                parent,
                name,
                typ,
                ..
            } => {
                self.create_directory_entry(*parent, name, *mnum, *typ, tr);
            }
            Operation::Unlink { parent, name, .. } => {
                self.unlink_old_inode(*parent, name, tr);
            }
            Operation::RenameLink {
                src_parent,
                dst_parent,
                mnum,
                newname,
                typ,
                ..
            } => {
                self.create_directory_entry(*dst_parent, newname, *mnum, *typ, tr);
                if *typ == MnodeType::Dir && src_parent != dst_parent {
                    self.fix_dotdot(*mnum, *src_parent, *dst_parent, tr);
                }
            }
            Operation::RenameUnlink {
                src_parent, name, ..
            } => {
                self.unlink_old_inode(*src_parent, name, tr);
            }
            Operation::Delete { mnum, .. } => {
                if let Some(inum) = self.inum_lookup(*mnum) {
                    self.delete_old_inode(inum, *mnum, tr);
                }
            }
            Operation::RenameBarrier { .. } => {
                panic!("rename barrier reached the apply path");
            }
        }
    }

    // Operation application: the bridge from logical operations to the
    // physical file system, each within the caller's transaction.

    /// Panics when the binding is missing: by the time an operation that
    /// needs the inode applies, the binding must exist.
    fn get_inode(&self, mnum: u64, caller: &str) -> Arc<Inode> {
        let inum = self
            .inum_lookup(mnum)
            .unwrap_or_else(|| panic!("{}: no inode mapping for mnode {}", caller, mnum));
        self.fs.iget(inum)
    }

    /// Allocate an inode for `mnum`, or return the existing one. The
    /// per-mnode lock serializes racing allocators for the same mnode.
    fn alloc_inode_for_mnode(&self, mnum: u64, typ: MnodeType) -> Arc<Inode> {
        let mlock = self.mnode_lock(mnum);
        let _guard = mlock.lock();

        if let Some(inum) = self.inum_lookup(mnum) {
            return self.fs.iget(inum);
        }
        let ip = self
            .fs
            .ialloc(typ.to_disk())
            .expect("out of inodes while applying metadata");
        self.bind(mnum, ip.inum);
        ip
    }

    /// Create the on-disk object for an mnode if it has no inode mapping
    /// yet. Returns the i-number.
    fn create_file_dir_if_new(
        &self,
        mnum: u64,
        parent_mnum: u64,
        typ: MnodeType,
        tr: &mut Transaction,
    ) -> u32 {
        // A new directory needs its ".." entry, and that needs the
        // parent's i-number; allocate the parent first if it has none.
        let parent_inum = if typ == MnodeType::Dir {
            let pip = self.alloc_inode_for_mnode(parent_mnum, MnodeType::Dir);
            pip.inum
        } else {
            0
        };

        let ip = self.alloc_inode_for_mnode(mnum, typ);
        let mut inner = ip.inner.write();
        match typ {
            MnodeType::File | MnodeType::Dev => {
                self.fs.iupdate(ip.inum, &inner, tr);
            }
            MnodeType::Dir => {
                if self
                    .fs
                    .dirlookup(&ip, &inner, "..")
                    .is_none()
                {
                    self.fs
                        .dirlink(&ip, &mut inner, "..", parent_inum, tr)
                        .expect("create: dirlink ..");
                    drop(inner);
                    // The child's ".." holds a link on the parent.
                    let pip = self.get_inode(parent_mnum, "create_file_dir_if_new");
                    let mut pinner = pip.inner.write();
                    pinner.nlink += 1;
                    self.fs.iupdate(pip.inum, &pinner, tr);
                } else {
                    self.fs.iupdate(ip.inum, &inner, tr);
                }
            }
        }
        ip.inum
    }

    /// Write the directory entry `name -> mnum` in `mdir_mnum`, replacing
    /// a stale entry for a different inode if one is in the way.
    /// Idempotent: an entry already mapping to the same inode is left
    /// alone.
    fn create_directory_entry(
        &self,
        mdir_mnum: u64,
        name: &str,
        dirent_mnum: u64,
        _typ: MnodeType,
        tr: &mut Transaction,
    ) {
        let dp = self.get_inode(mdir_mnum, "create_directory_entry");
        let dirent_inum = self
            .inum_lookup(dirent_mnum)
            .unwrap_or_else(|| panic!("create_directory_entry: no inode for mnode {}", dirent_mnum));

        let mut dinner = dp.inner.write();
        if let Some(existing) = self.fs.dirlookup(&dp, &dinner, name) {
            if existing.inum == dirent_inum {
                return;
            }
            drop(dinner);
            self.unlink_old_inode(mdir_mnum, name, tr);
            dinner = dp.inner.write();
        }

        self.fs
            .dirlink(&dp, &mut dinner, name, dirent_inum, tr)
            .expect("create_directory_entry: dirlink");
        drop(dinner);

        // The new entry holds a link on its target.
        let ip = self.fs.iget(dirent_inum);
        let mut inner = ip.inner.write();
        inner.nlink += 1;
        self.fs.iupdate(ip.inum, &inner, tr);
    }

    /// Remove the directory entry `name` from `mdir_mnum` on disk, and
    /// delete or defer the target when its last link goes away.
    fn unlink_old_inode(&self, mdir_mnum: u64, name: &str, tr: &mut Transaction) {
        let dp = self.get_inode(mdir_mnum, "unlink_old_inode");
        let mut dinner = dp.inner.write();

        let Some(info) = self.fs.dirlookup(&dp, &dinner, name) else {
            // Already unlinked by an earlier drain.
            return;
        };
        self.fs
            .dirunlink(&dp, &mut dinner, name, tr)
            .expect("unlink_old_inode: dirunlink");

        let target = self.fs.iget(info.inum);
        let mut tinner = target.inner.write();
        tinner.nlink -= 1;
        self.fs.iupdate(target.inum, &tinner, tr);

        if tinner.nlink == 0 {
            // The dying directory's ".." drops its link on the parent.
            if tinner.typ == T_DIR {
                dinner.nlink -= 1;
                self.fs.iupdate(dp.inum, &dinner, tr);
            }
            drop(tinner);
            drop(dinner);

            match self.mnum_lookup(info.inum) {
                Some(mnum) if self.mnode_open_count(mnum) > 0 => {
                    // Open file descriptors keep the inode alive; delete
                    // it on the next mount instead.
                    self.fs.defer_inode_reclaim(info.inum);
                }
                mnum => {
                    self.delete_old_inode(info.inum, mnum.unwrap_or(0), tr);
                }
            }
        }
    }

    /// Remove the inode and its contents from the disk, and drop every
    /// in-memory structure still keyed to it.
    fn delete_old_inode(&self, inum: u32, mnum: u64, tr: &mut Transaction) {
        let ip = self.fs.iget(inum);
        {
            let mut inner = ip.inner.write();
            self.fs.itrunc(&mut inner, 0, tr);
            self.fs.free_inode(inum, &mut inner, tr);
        }
        self.fs.dir_detach(&ip);
        if mnum != 0 {
            self.unbind(mnum, inum);
            self.free_metadata_log(mnum);
            self.free_mnode_lock(mnum);
        }
    }

    /// Rewrite a moved directory's ".." to point at its new parent.
    fn fix_dotdot(&self, mnum: u64, src_parent: u64, dst_parent: u64, tr: &mut Transaction) {
        let ip = self.get_inode(mnum, "fix_dotdot");
        let src_ip = self.get_inode(src_parent, "fix_dotdot");
        let dst_ip = self.get_inode(dst_parent, "fix_dotdot");

        {
            let mut inner = ip.inner.write();
            self.fs
                .dirunlink(&ip, &mut inner, "..", tr)
                .expect("fix_dotdot: dirunlink");
            self.fs
                .dirlink(&ip, &mut inner, "..", dst_ip.inum, tr)
                .expect("fix_dotdot: dirlink");
        }

        // The ".." link migrates from the old parent to the new one.
        {
            let mut sinner = src_ip.inner.write();
            sinner.nlink -= 1;
            self.fs.iupdate(src_ip.inum, &sinner, tr);
        }
        {
            let mut dinner = dst_ip.inner.write();
            dinner.nlink += 1;
            self.fs.iupdate(dst_ip.inum, &dinner, tr);
        }
    }
}
