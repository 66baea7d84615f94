//! File system implementation. Five layers:
//!   + Blocks: two-representation allocator for raw disk blocks.
//!   + Journal: write-ahead logging of transactions for crash recovery.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /sv6journal for convenient naming.
//!
//! `DiskFs` is the physical file system: everything that reads or writes
//! the disk image. The in-memory namespace, oplogs, and the dependency
//! resolver that drains them live above it, in `mfs`.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use array_macro::array;
use arrayvec::ArrayVec;
use log::{info, warn};
use parking_lot::Mutex;
use spin::Once;

use crate::bio::BufCache;
use crate::device::BlockDevice;
use crate::param::{NCPU, NRECLAIM_INODES};

pub mod alloc;
pub mod dir;
pub mod inode;
pub mod journal;
pub mod mkfs;
pub mod path;
pub mod superblock;

use self::alloc::BlockAlloc;
use self::inode::{Inode, Itable};
use self::journal::{Journal, Transaction};
use self::superblock::{Superblock, BPB, IPB, SBBLOCK};

pub struct DiskFs {
    pub(crate) bcache: BufCache,

    /// Geometry, read once from the superblock.
    pub size: u32,
    pub nblocks: u32,
    pub ninodes: u32,

    /// Inodes to delete on the next mount; mirrored into the on-disk
    /// superblock whenever it changes.
    reclaim: Mutex<ArrayVec<u32, NRECLAIM_INODES>>,

    /// In-memory free-bit state; built after journal recovery.
    balloc: Once<BlockAlloc>,

    itable: Itable,

    pub journal: Journal,
    journal_inode: Once<Arc<Inode>>,

    /// Last inode number each core allocated; the scan hint.
    last_inode: [AtomicU32; NCPU],

    /// Monotonic timestamp source. Globally unique, strictly increasing.
    tsc: AtomicU64,
}

impl DiskFs {
    /// Attach to a device carrying a file system image. No recovery or
    /// allocator state yet; `init` does that.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let bcache = BufCache::new(dev);
        let sb = bcache.get(SBBLOCK, false).read(Superblock::from_block);

        let mut reclaim = ArrayVec::new();
        for inum in &sb.reclaim_inodes[..sb.num_reclaim_inodes as usize] {
            reclaim.push(*inum);
        }

        Self {
            bcache,
            size: sb.size,
            nblocks: sb.nblocks,
            ninodes: sb.ninodes,
            reclaim: Mutex::new(reclaim),
            balloc: Once::new(),
            itable: Itable::new(),
            journal: Journal::new(),
            journal_inode: Once::new(),
            last_inode: array![_ => AtomicU32::new(0); NCPU],
            tsc: AtomicU64::new(1),
        }
    }

    /// Bring the file system to a usable state: replay the journal,
    /// build the free-bit state from the (recovered) bitmap, then delete
    /// inodes left behind by unlink-while-open.
    pub fn init(&self) {
        self.process_journal();
        self.init_free_bits();
        self.reclaim_deferred_inodes();
    }

    pub fn dev(&self) -> &Arc<dyn BlockDevice> {
        self.bcache.device()
    }

    pub fn bcache(&self) -> &BufCache {
        &self.bcache
    }

    pub(crate) fn journal_inode(&self) -> &Arc<Inode> {
        self.journal_inode.get().expect("journal inode not resolved")
    }

    /// A fresh, globally unique timestamp.
    pub fn get_tsc(&self) -> u64 {
        self.tsc.fetch_add(1, Ordering::Relaxed)
    }

    fn ninode_blocks(&self) -> u32 {
        self.ninodes.div_ceil(IPB as u32)
    }

    /// Block containing inode `i`.
    pub fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + SBBLOCK + 1
    }

    /// Block of the free bitmap containing the bit for block `b`.
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB + SBBLOCK + 1 + self.ninode_blocks()
    }

    /// Record `inum` for deletion at the next mount. Called when an
    /// unlinked inode cannot be deleted yet because the file is still
    /// open; dropped with a warning when the list is full.
    pub(crate) fn defer_inode_reclaim(&self, inum: u32) {
        {
            let mut reclaim = self.reclaim.lock();
            if reclaim.is_full() {
                warn!("no space left to mark inodes for deferred deletion, dropping inode {}", inum);
                return;
            }
            reclaim.push(inum);
        }
        self.write_superblock();
    }

    /// Delete every inode on the deferred-reclaim list, then clear the
    /// list on disk.
    fn reclaim_deferred_inodes(&self) {
        let list: Vec<u32> = {
            let mut reclaim = self.reclaim.lock();
            if reclaim.is_empty() {
                return;
            }
            reclaim.drain(..).filter(|inum| *inum != 0).collect()
        };

        let mut jr = self.journal.prepare_for_commit();
        for inum in list {
            let mut tr = Transaction::new(self.get_tsc());
            let ip = self.iget(inum);
            {
                let mut inner = ip.inner.write();
                self.itrunc(&mut inner, 0, &mut tr);
                self.free_inode(inum, &mut inner, &mut tr);
            }
            self.add_to_journal_locked(&mut jr, tr);
            info!("reclaimed deferred inode {}", inum);
        }
        self.flush_journal_locked(&mut jr);
        drop(jr);

        self.write_superblock();
        self.dev().flush();
    }

    /// Write the superblock, reclaim list included, straight to disk.
    /// Not journaled; the reclaim list is advisory state whose loss only
    /// delays reclamation.
    fn write_superblock(&self) {
        let reclaim = self.reclaim.lock();
        let mut sb = Superblock {
            magic: superblock::FSMAGIC,
            size: self.size,
            nblocks: self.nblocks,
            ninodes: self.ninodes,
            num_reclaim_inodes: reclaim.len() as u32,
            reclaim_inodes: [0; NRECLAIM_INODES],
        };
        sb.reclaim_inodes[..reclaim.len()].copy_from_slice(&reclaim);

        let bp = self.bcache.get(SBBLOCK, false);
        bp.write(|data| sb.write_to_block(data));
        bp.writeback();
    }

    /// Drop clean cached blocks; memory-pressure and crash-simulation
    /// hook.
    pub fn evict_bufcache(&self) {
        info!("evict_caches: dropping buffer-cache blocks");
        self.bcache.evict_clean();
    }
}
