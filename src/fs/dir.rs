//! Directories.
//!
//! A directory is a file containing a sequence of `Dirent` slots. Each
//! directory inode lazily materializes an in-memory map from name to
//! `(inum, slot offset)`; lookups and mutations go through the map, and
//! `dir_flush_entry` writes the single affected slot back through the
//! caller's transaction.
//!
//! Deleted entries keep their slot: the slot is first rewritten on disk
//! with `inum == 0`, and only then is the name dropped from the map.
//! Crash recovery therefore sees either the old entry or a tombstone,
//! never a half-removed name.

use core::mem;
use std::collections::HashMap;
use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{FsError, Result};
use crate::fs::inode::{Inode, InodeInner, T_DIR};
use crate::fs::journal::Transaction;
use crate::param::DIRSIZ;

use super::DiskFs;

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

#[repr(C)]
#[derive(Clone, Copy, Default, FromZeroes, FromBytes, AsBytes)]
pub struct Dirent {
    pub inum: u32,
    name: [u8; DIRSIZ],
}

impl Dirent {
    pub(super) fn new(inum: u32, name: &str) -> Self {
        let mut de = Self {
            inum,
            name: [0; DIRSIZ],
        };
        de.set_name(name);
        de
    }

    /// Fill in the name; NUL-terminated when shorter than `DIRSIZ`.
    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= DIRSIZ, "dirent name too long");
        self.name[..bytes.len()].copy_from_slice(bytes);
        if bytes.len() < DIRSIZ {
            self.name[bytes.len()] = 0;
        }
    }

    fn name(&self) -> &str {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(DIRSIZ);
        core::str::from_utf8(&self.name[..len]).expect("dirent name not utf-8")
    }
}

#[derive(Clone, Copy)]
pub struct DirEntInfo {
    pub inum: u32,
    pub off: u32,
}

/// In-memory image of a directory's live entries.
pub struct DirCache {
    map: HashMap<String, DirEntInfo>,

    /// Append offset for new slots. Deleted entries keep their slot, so
    /// this only ever grows.
    next_off: u32,
}

impl DiskFs {
    /// Populate the directory map by scanning the directory file. The
    /// caller holds (at least) the inode read lock.
    pub fn dir_init(&self, ip: &Inode, inner: &InodeInner) {
        if ip.dir.lock().is_some() {
            return;
        }
        assert_eq!(inner.typ, T_DIR, "dir_init: not a directory");

        let mut map = HashMap::new();
        let mut de_buf = [0u8; DIRENT_SIZE];
        let mut off = 0;
        while off + DIRENT_SIZE as u32 <= inner.size {
            let n = self.readi(inner, &mut de_buf, off).expect("dir_init: readi");
            assert_eq!(n, DIRENT_SIZE, "dir_init: short directory read");
            let de = Dirent::read_from(&de_buf[..]).unwrap();
            if de.inum != 0 {
                map.insert(de.name().to_owned(), DirEntInfo { inum: de.inum, off });
            }
            off += DIRENT_SIZE as u32;
        }

        let mut dir = ip.dir.lock();
        if dir.is_none() {
            *dir = Some(DirCache {
                map,
                next_off: inner.size,
            });
        }
    }

    /// Look up `name`; returns the entry's i-number and slot offset.
    pub fn dirlookup(&self, ip: &Inode, inner: &InodeInner, name: &str) -> Option<DirEntInfo> {
        self.dir_init(ip, inner);
        ip.dir.lock().as_ref().unwrap().map.get(name).copied()
    }

    /// All live entries, for loading a directory into the namespace.
    pub fn dir_entries(&self, ip: &Inode, inner: &InodeInner) -> Vec<(String, u32)> {
        self.dir_init(ip, inner);
        ip.dir
            .lock()
            .as_ref()
            .unwrap()
            .map
            .iter()
            .map(|(name, info)| (name.clone(), info.inum))
            .collect()
    }

    /// Write a new entry `name -> inum` into the directory. The caller
    /// holds the directory inode's write lock and adjusts link counts.
    pub fn dirlink(
        &self,
        ip: &Inode,
        inner: &mut InodeInner,
        name: &str,
        inum: u32,
        tr: &mut Transaction,
    ) -> Result<()> {
        self.dir_init(ip, inner);

        let off = {
            let mut dir = ip.dir.lock();
            let dir = dir.as_mut().unwrap();
            if dir.map.contains_key(name) {
                return Err(FsError::Exists);
            }
            let off = dir.next_off;
            dir.map.insert(name.to_owned(), DirEntInfo { inum, off });
            dir.next_off = off + DIRENT_SIZE as u32;
            off
        };

        self.dir_flush_entry(ip.inum, inner, &Dirent::new(inum, name), off, tr);
        Ok(())
    }

    /// Remove `name` from the directory: tombstone the slot on disk, then
    /// drop the name from the map. Returns the unlinked entry's i-number.
    pub fn dirunlink(
        &self,
        ip: &Inode,
        inner: &mut InodeInner,
        name: &str,
        tr: &mut Transaction,
    ) -> Result<u32> {
        self.dir_init(ip, inner);

        let info = ip
            .dir
            .lock()
            .as_ref()
            .unwrap()
            .map
            .get(name)
            .copied()
            .ok_or(FsError::NotFound)?;

        self.dir_flush_entry(ip.inum, inner, &Dirent::new(0, name), info.off, tr);

        ip.dir.lock().as_mut().unwrap().map.remove(name);
        Ok(info.inum)
    }

    /// Write one directory slot back to the directory file within `tr`,
    /// growing the recorded size when the slot is a fresh append.
    fn dir_flush_entry(
        &self,
        inum: u32,
        inner: &mut InodeInner,
        de: &Dirent,
        off: u32,
        tr: &mut Transaction,
    ) {
        let n = self
            .writei(inner, de.as_bytes(), off, Some(&mut *tr), false)
            .expect("dir_flush_entry: writei");
        assert_eq!(n, DIRENT_SIZE, "dir_flush_entry: short write");

        if inner.size < off + DIRENT_SIZE as u32 {
            inner.size = off + DIRENT_SIZE as u32;
        }
        self.iupdate(inum, inner, tr);
    }

    /// Detach the in-memory directory map, if any. Used when the inode
    /// goes away.
    pub(crate) fn dir_detach(&self, ip: &Arc<Inode>) {
        *ip.dir.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_is_sixteen_bytes() {
        assert_eq!(DIRENT_SIZE, 16);
    }

    #[test]
    fn dirent_name_roundtrip() {
        let de = Dirent::new(7, "sv6journal");
        assert_eq!(de.name(), "sv6journal");
        assert_eq!(de.inum, 7);

        let full = Dirent::new(9, "exactly12chr");
        assert_eq!(full.name(), "exactly12chr");
    }
}
