//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk `Dinode` holds
//! the type, link count, size, generation number, and the block map:
//! `NDIRECT` direct addresses, one singly-indirect block, one
//! doubly-indirect block.
//!
//! In-memory inodes live in a cache keyed by i-number so every core
//! sharing a file synchronizes on the same object. An inode's mutable
//! state sits behind a read/write sleeping lock (`busy`/`readbusy`
//! semantics) because it is held across disk I/O. The first-level
//! indirect block is cached in `iaddrs` once read, and written back
//! wholesale by `iupdate`.
//!
//! Inode contents never reach the disk directly on the write path:
//! `writei` stages the affected blocks into the caller's transaction and
//! the journal gets them to their home locations.

use core::mem;
use core::sync::atomic::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::cpu;
use crate::error::{FsError, Result};
use crate::fs::dir::DirCache;
use crate::fs::journal::Transaction;
use crate::fs::superblock::IPB;
use crate::lock::RwSleepLock;
use crate::param::{BSIZE, MAXFILE, NDIRECT, NINDIRECT};

use super::DiskFs;

pub const T_FREE: i16 = 0;
pub const T_DIR: i16 = 1;
pub const T_FILE: i16 = 2;
pub const T_DEV: i16 = 3;

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();

/// On-disk inode structure.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct Dinode {
    /// File type; `T_FREE` means the slot is unallocated.
    pub typ: i16,

    /// Major device number (`T_DEV` only).
    pub major: i16,

    /// Minor device number (`T_DEV` only).
    pub minor: i16,

    /// Number of directory entries referring to this inode.
    pub nlink: i16,

    /// Size of file in bytes.
    pub size: u32,

    /// Bumped every time the slot is reused.
    pub gen: u32,

    /// Direct, singly-indirect, doubly-indirect block addresses.
    pub addrs: [u32; NDIRECT + 2],
}

const_assert_eq!(DINODE_SIZE, 64);

/// In-memory copy of a `Dinode` plus cache bookkeeping. Guarded by the
/// owning `Inode`'s read/write sleeping lock.
pub struct InodeInner {
    /// Has this been read from disk?
    pub valid: bool,
    pub typ: i16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub gen: u32,
    pub addrs: [u32; NDIRECT + 2],

    /// Cached copy of the first-level indirect block, populated lazily by
    /// `bmap` and flushed by `iupdate`.
    pub iaddrs: Option<Box<[u32; NINDIRECT]>>,
}

pub struct Inode {
    pub inum: u32,
    pub inner: RwSleepLock<InodeInner>,

    /// In-memory directory map; `None` until `dir_init` scans the
    /// directory contents.
    pub(super) dir: Mutex<Option<DirCache>>,
}

impl Inode {
    fn new(inum: u32) -> Self {
        Self {
            inum,
            inner: RwSleepLock::new(InodeInner {
                valid: false,
                typ: T_FREE,
                major: 0,
                minor: 0,
                nlink: 0,
                size: 0,
                gen: 0,
                addrs: [0; NDIRECT + 2],
                iaddrs: None,
            }),
            dir: Mutex::new(None),
        }
    }
}

impl InodeInner {
    fn load(&mut self, dip: &Dinode) {
        self.typ = dip.typ;
        self.major = dip.major;
        self.minor = dip.minor;
        self.nlink = dip.nlink;
        self.size = dip.size;
        self.gen = dip.gen;
        self.addrs = dip.addrs;
    }

    fn to_dinode(&self) -> Dinode {
        Dinode {
            typ: self.typ,
            major: self.major,
            minor: self.minor,
            nlink: self.nlink,
            size: self.size,
            gen: self.gen,
            addrs: self.addrs,
        }
    }
}

/// Cache of in-memory inodes, keyed by i-number.
pub(super) struct Itable {
    map: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl Itable {
    pub(super) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_insert(&self, inum: u32) -> Arc<Inode> {
        let mut map = self.map.lock();
        Arc::clone(map.entry(inum).or_insert_with(|| Arc::new(Inode::new(inum))))
    }

    fn remove(&self, inum: u32) {
        self.map.lock().remove(&inum);
    }
}

fn get_u32(data: &[u8; BSIZE], idx: usize) -> u32 {
    let off = idx * 4;
    u32::from_ne_bytes(data[off..off + 4].try_into().unwrap())
}

fn put_u32(data: &mut [u8; BSIZE], idx: usize, val: u32) {
    let off = idx * 4;
    data[off..off + 4].copy_from_slice(&val.to_ne_bytes());
}

/// Number of blocks needed to hold `off` bytes.
fn block_roundup(off: u32) -> usize {
    (off as usize).div_ceil(BSIZE)
}

impl DiskFs {
    /// Find the inode with number `inum` and return the in-memory copy,
    /// reading it from disk on first use. Every caller holding the result
    /// sees the same object.
    pub fn iget(&self, inum: u32) -> Arc<Inode> {
        assert!(
            inum >= 1 && inum < self.ninodes,
            "iget: inum {} out of range",
            inum
        );
        let ip = self.itable.get_or_insert(inum);
        if !ip.inner.read().valid {
            let mut inner = ip.inner.write();
            if !inner.valid {
                let bp = self.bcache.get(self.iblock(inum), false);
                bp.read(|data| {
                    let off = (inum as usize % IPB) * DINODE_SIZE;
                    let dip = Dinode::read_from(&data[off..off + DINODE_SIZE]).unwrap();
                    inner.load(&dip);
                });
                inner.valid = true;
            }
        }
        ip
    }

    /// Claim `inum` if its cached type is still free. The in-memory cache
    /// is the arbiter; the on-disk slot follows via `iupdate` inside the
    /// claiming transaction.
    fn try_ialloc(&self, inum: u32, typ: i16) -> Option<Arc<Inode>> {
        let ip = self.iget(inum);
        {
            let mut inner = ip.inner.write();
            if inner.typ != T_FREE {
                return None;
            }
            inner.typ = typ;
            inner.gen = inner.gen.wrapping_add(1);
            // mkfs zeroes the inode table, and free_inode rewrites freed
            // slots, so a free slot is a zeroed slot.
            debug_assert!(
                inner.nlink == 0 && inner.size == 0 && inner.addrs.iter().all(|a| *a == 0),
                "try_ialloc: inode {} not zeroed",
                inum
            );
        }
        Some(ip)
    }

    /// Allocate an inode of the given type, scanning from this core's
    /// last successful allocation and wrapping around once.
    pub fn ialloc(&self, typ: i16) -> Result<Arc<Inode>> {
        let hint = &self.last_inode[cpu::id()];
        let ninodes = self.ninodes;
        let mut inum = (hint.load(Ordering::Relaxed) + 1) % ninodes;
        for _ in 0..ninodes {
            if inum != 0 {
                if let Some(ip) = self.try_ialloc(inum, typ) {
                    hint.store(inum, Ordering::Relaxed);
                    return Ok(ip);
                }
            }
            inum = (inum + 1) % ninodes;
        }
        warn!("ialloc: 0/{} inodes", ninodes);
        Err(FsError::OutOfInodes)
    }

    /// Copy a modified in-memory inode to its slot in the inode table and
    /// stage the slot's block (and the cached indirect block, if any) into
    /// `tr`.
    pub fn iupdate(&self, inum: u32, inner: &InodeInner, tr: &mut Transaction) {
        let bp = self.bcache.get(self.iblock(inum), false);
        bp.write_and_log(tr, |data| {
            let off = (inum as usize % IPB) * DINODE_SIZE;
            data[off..off + DINODE_SIZE].copy_from_slice(inner.to_dinode().as_bytes());
        });

        if inner.addrs[NDIRECT] != 0 {
            if let Some(ia) = &inner.iaddrs {
                let bp = self.bcache.get(inner.addrs[NDIRECT], false);
                bp.write_and_log(tr, |data| {
                    data.copy_from_slice(ia.as_bytes());
                });
            }
        }
    }

    /// Release the inode's on-disk slot. The caller holds the write lock
    /// and has already truncated the contents.
    pub fn free_inode(&self, inum: u32, inner: &mut InodeInner, tr: &mut Transaction) {
        assert_eq!(inner.nlink, 0, "free_inode: inum {} still linked", inum);
        inner.typ = T_FREE;
        inner.major = 0;
        inner.minor = 0;
        inner.size = 0;
        debug_assert!(inner.addrs.iter().all(|a| *a == 0), "free_inode: not truncated");
        self.iupdate(inum, inner, tr);
        self.itable.remove(inum);
    }

    /// Return the disk block of the `bn`th block of the file, allocating
    /// it (and any intermediate map blocks) if absent.
    pub fn bmap(
        &self,
        inner: &mut InodeInner,
        bn: usize,
        mut tr: Option<&mut Transaction>,
        zero_on_alloc: bool,
    ) -> Result<u32> {
        if bn < NDIRECT {
            let mut addr = inner.addrs[bn];
            if addr == 0 {
                addr = self.balloc(tr.as_deref_mut(), zero_on_alloc)?;
                inner.addrs[bn] = addr;
            }
            return Ok(addr);
        }
        let bn = bn - NDIRECT;

        if bn < NINDIRECT {
            if inner.addrs[NDIRECT] == 0 {
                inner.addrs[NDIRECT] = self.balloc(tr.as_deref_mut(), true)?;
            }
            let ibno = inner.addrs[NDIRECT];

            if inner.iaddrs.is_none() {
                let bp = self.bcache.get(ibno, false);
                let mut ia = Box::new([0u32; NINDIRECT]);
                bp.read(|data| {
                    for (i, slot) in ia.iter_mut().enumerate() {
                        *slot = get_u32(data, i);
                    }
                });
                inner.iaddrs = Some(ia);
            }

            let mut addr = inner.iaddrs.as_ref().unwrap()[bn];
            if addr == 0 {
                addr = self.balloc(tr.as_deref_mut(), zero_on_alloc)?;
                let ia = inner.iaddrs.as_mut().unwrap();
                ia[bn] = addr;
                if let Some(tr) = tr.as_deref_mut() {
                    tr.add_block(ibno, ia.as_bytes());
                }
            }
            return Ok(addr);
        }
        let bn = bn - NINDIRECT;
        assert!(bn < NINDIRECT * NINDIRECT, "bmap: out of range");

        if inner.addrs[NDIRECT + 1] == 0 {
            inner.addrs[NDIRECT + 1] = self.balloc(tr.as_deref_mut(), true)?;
        }

        let bp1 = self.bcache.get(inner.addrs[NDIRECT + 1], false);
        let idx1 = bn / NINDIRECT;
        let mut l2bno = bp1.read(|data| get_u32(data, idx1));
        if l2bno == 0 {
            l2bno = self.balloc(tr.as_deref_mut(), true)?;
            match tr.as_deref_mut() {
                Some(tr) => bp1.write_and_log(tr, |data| put_u32(data, idx1, l2bno)),
                None => bp1.write(|data| put_u32(data, idx1, l2bno)),
            }
        }

        let bp2 = self.bcache.get(l2bno, false);
        let idx2 = bn % NINDIRECT;
        let mut addr = bp2.read(|data| get_u32(data, idx2));
        if addr == 0 {
            addr = self.balloc(tr.as_deref_mut(), zero_on_alloc)?;
            match tr.as_deref_mut() {
                Some(tr) => bp2.write_and_log(tr, |data| put_u32(data, idx2, addr)),
                None => bp2.write(|data| put_u32(data, idx2, addr)),
            }
        }
        Ok(addr)
    }

    /// Non-allocating block lookup; `None` for a hole.
    fn bmap_read(&self, inner: &InodeInner, bn: usize) -> Option<u32> {
        if bn < NDIRECT {
            let a = inner.addrs[bn];
            return (a != 0).then_some(a);
        }
        let bn = bn - NDIRECT;

        if bn < NINDIRECT {
            if let Some(ia) = &inner.iaddrs {
                let a = ia[bn];
                return (a != 0).then_some(a);
            }
            let ibno = inner.addrs[NDIRECT];
            if ibno == 0 {
                return None;
            }
            let a = self.bcache.get(ibno, false).read(|data| get_u32(data, bn));
            return (a != 0).then_some(a);
        }
        let bn = bn - NINDIRECT;

        let l1bno = inner.addrs[NDIRECT + 1];
        if l1bno == 0 {
            return None;
        }
        let l2bno = self
            .bcache
            .get(l1bno, false)
            .read(|data| get_u32(data, bn / NINDIRECT));
        if l2bno == 0 {
            return None;
        }
        let a = self
            .bcache
            .get(l2bno, false)
            .read(|data| get_u32(data, bn % NINDIRECT));
        (a != 0).then_some(a)
    }

    /// Read up to `dst.len()` bytes from the file at byte offset `off`.
    /// Holes read as zeros.
    pub fn readi(&self, inner: &InodeInner, dst: &mut [u8], off: u32) -> Result<usize> {
        if inner.typ == T_DEV {
            return Err(FsError::BadFd);
        }
        if off > inner.size {
            return Err(FsError::InvalidPath);
        }
        let n = dst.len().min((inner.size - off) as usize);

        let mut tot = 0;
        let mut off = off as usize;
        while tot < n {
            let m = (n - tot).min(BSIZE - off % BSIZE);
            match self.bmap_read(inner, off / BSIZE) {
                Some(bno) => {
                    let bp = self.bcache.get(bno, false);
                    bp.read(|data| {
                        dst[tot..tot + m].copy_from_slice(&data[off % BSIZE..off % BSIZE + m])
                    });
                }
                None => dst[tot..tot + m].fill(0),
            }
            tot += m;
            off += m;
        }
        Ok(n)
    }

    /// Write `src` at byte offset `off`, staging touched blocks into `tr`
    /// (or writing them straight home when `writeback` is set, bypassing
    /// the journal). Does not update the inode's size; callers do that
    /// once, with `update_size`.
    ///
    /// Writes past the largest representable file are truncated; running
    /// out of blocks mid-write returns the bytes written so far, or the
    /// error if nothing was.
    pub fn writei(
        &self,
        inner: &mut InodeInner,
        src: &[u8],
        off: u32,
        mut tr: Option<&mut Transaction>,
        writeback: bool,
    ) -> Result<usize> {
        if inner.typ == T_DEV {
            return Err(FsError::BadFd);
        }
        let max = (MAXFILE * BSIZE) as u64;
        let n = if off as u64 + src.len() as u64 > max {
            (max - off as u64) as usize
        } else {
            src.len()
        };

        let mut tot = 0;
        let mut off = off as usize;
        while tot < n {
            let m = (n - tot).min(BSIZE - off % BSIZE);
            // No need to read a block we are about to overwrite whole.
            let skip_read = off % BSIZE == 0 && m == BSIZE;
            let bno = match self.bmap(inner, off / BSIZE, tr.as_deref_mut(), !skip_read) {
                Ok(bno) => bno,
                Err(FsError::OutOfBlocks) => {
                    warn!("writei: out of blocks");
                    if tot == 0 {
                        return Err(FsError::OutOfBlocks);
                    }
                    break;
                }
                Err(e) => return Err(e),
            };
            let bp = self.bcache.get(bno, skip_read);
            let range = off % BSIZE..off % BSIZE + m;
            match (writeback, tr.as_deref_mut()) {
                (false, Some(tr)) => {
                    // Snapshot under the same write-lock hold so exactly
                    // this version of the block commits.
                    bp.write_and_log(tr, |data| data[range].copy_from_slice(&src[tot..tot + m]));
                }
                _ => {
                    bp.write(|data| data[range].copy_from_slice(&src[tot..tot + m]));
                    if writeback {
                        bp.writeback();
                    }
                }
            }
            tot += m;
            off += m;
        }
        Ok(tot)
    }

    /// Set the file size and write the inode through to `tr`.
    pub fn update_size(&self, inum: u32, inner: &mut InodeInner, size: u32, tr: &mut Transaction) {
        inner.size = size;
        self.iupdate(inum, inner, tr);
    }

    /// Truncate the file to `offset` bytes, freeing every block past it.
    /// Freed blocks stay unavailable to the allocator until `tr` commits.
    pub fn itrunc(&self, inner: &mut InodeInner, offset: u32, tr: &mut Transaction) {
        if inner.size <= offset {
            return;
        }
        let keep = block_roundup(offset);

        for i in keep.min(NDIRECT)..NDIRECT {
            if inner.addrs[i] != 0 {
                self.bfree(inner.addrs[i], Some(&mut *tr), true);
                inner.addrs[i] = 0;
            }
        }

        if inner.addrs[NDIRECT] != 0 {
            let start = keep.saturating_sub(NDIRECT).min(NINDIRECT);
            let ibno = inner.addrs[NDIRECT];
            let bp = self.bcache.get(ibno, false);
            let mut freed = Vec::new();
            bp.write(|data| {
                // The cached indirect copy is the current truth; write it
                // through before zeroing entries.
                if let Some(ia) = &inner.iaddrs {
                    data.copy_from_slice(ia.as_bytes());
                }
                for i in start..NINDIRECT {
                    let a = get_u32(data, i);
                    if a != 0 {
                        freed.push(a);
                        put_u32(data, i, 0);
                    }
                }
            });
            for a in freed {
                self.bfree(a, Some(&mut *tr), true);
            }
            if start != 0 {
                bp.add_to_transaction(tr);
            } else {
                self.bfree(ibno, Some(&mut *tr), true);
                inner.addrs[NDIRECT] = 0;
            }
            inner.iaddrs = None;
        }

        if inner.addrs[NDIRECT + 1] != 0 {
            let start = keep.saturating_sub(NDIRECT + NINDIRECT).min(NINDIRECT * NINDIRECT);
            let first_l1 = start / NINDIRECT;
            let l1bno = inner.addrs[NDIRECT + 1];
            let bp1 = self.bcache.get(l1bno, false);

            let mut l1 = vec![0u32; NINDIRECT];
            bp1.read(|data| {
                for (i, slot) in l1.iter_mut().enumerate() {
                    *slot = get_u32(data, i);
                }
            });

            for (i, l2bno) in l1.iter_mut().enumerate().skip(first_l1) {
                if *l2bno == 0 {
                    continue;
                }
                let l2start = if i == first_l1 { start % NINDIRECT } else { 0 };
                let bp2 = self.bcache.get(*l2bno, false);
                let mut freed = Vec::new();
                bp2.write(|data| {
                    for j in l2start..NINDIRECT {
                        let a = get_u32(data, j);
                        if a != 0 {
                            freed.push(a);
                            put_u32(data, j, 0);
                        }
                    }
                });
                for a in freed {
                    self.bfree(a, Some(&mut *tr), true);
                }
                if l2start != 0 {
                    bp2.add_to_transaction(tr);
                } else {
                    self.bfree(*l2bno, Some(&mut *tr), true);
                    *l2bno = 0;
                }
            }

            bp1.write(|data| {
                for (i, slot) in l1.iter().enumerate() {
                    put_u32(data, i, *slot);
                }
            });
            if start != 0 {
                bp1.add_to_transaction(tr);
            } else {
                self.bfree(l1bno, Some(&mut *tr), true);
                inner.addrs[NDIRECT + 1] = 0;
            }
        }

        inner.size = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dinode_fills_inode_blocks_exactly() {
        assert_eq!(BSIZE % DINODE_SIZE, 0);
        assert_eq!(IPB, 64);
    }

    #[test]
    fn block_roundup_boundaries() {
        assert_eq!(block_roundup(0), 0);
        assert_eq!(block_roundup(1), 1);
        assert_eq!(block_roundup(BSIZE as u32), 1);
        assert_eq!(block_roundup(BSIZE as u32 + 1), 2);
    }
}
