//! In-memory file system layer.
//!
//! Mnodes are the namespace the rest of the system manipulates:
//! directories hold a name-to-mnum child map, files hold their page
//! cache. Metadata mutations update the mnodes and append a logical
//! operation to the per-object oplog of each object touched; nothing
//! reaches the disk until `fsync`, when the dependency resolver drains
//! the oplogs into journaled transactions.
//!
//! Mnode numbers are never reused. The inum/mnum bindings, the per-mnode
//! inode-allocation locks, and the oplogs are keyed maps owned here; a
//! missing binding where one must exist is a fatal error, not a
//! recoverable one.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::cpu;
use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::fs::inode::{T_DEV, T_DIR, T_FILE};
use crate::fs::journal::Transaction;
use crate::fs::path::skipelem;
use crate::fs::DiskFs;
use crate::oplog::MfsLogicalLog;
use crate::param::{BSIZE, DIRSIZ, MAXFILE, MAXOPBLOCKS, ROOTINO, ROOT_MNUM};

pub mod op;
mod resolver;

use self::op::Operation;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MnodeType {
    File,
    Dir,
    Dev,
}

impl MnodeType {
    pub(crate) fn to_disk(self) -> i16 {
        match self {
            MnodeType::File => T_FILE,
            MnodeType::Dir => T_DIR,
            MnodeType::Dev => T_DEV,
        }
    }

    fn from_disk(typ: i16) -> Option<Self> {
        match typ {
            T_FILE => Some(MnodeType::File),
            T_DIR => Some(MnodeType::Dir),
            T_DEV => Some(MnodeType::Dev),
            _ => None,
        }
    }
}

struct FilePages {
    data: Vec<u8>,
    dirty: bool,

    /// Whether `data` reflects the on-disk contents yet; populated from
    /// the inode on first access.
    initialized: bool,
}

struct DirChildren {
    children: HashMap<String, u64>,

    /// Whether the on-disk directory has been folded in yet.
    loaded: bool,
}

enum MnodeData {
    File(Mutex<FilePages>),
    Dir(Mutex<DirChildren>),
    Dev,
}

pub struct Mnode {
    pub mnum: u64,
    pub typ: MnodeType,
    data: MnodeData,

    /// Open handles; a nonzero count blocks on-disk deletion of an
    /// unlinked inode (it is deferred to the next mount instead).
    open_count: AtomicU32,

    /// In-memory link count.
    nlink_mem: AtomicU32,

    /// Parent mnum as a plain identifier; re-looked-up when needed, never
    /// a strong reference.
    parent: AtomicU64,
}

impl Mnode {
    fn new(mnum: u64, typ: MnodeType, fresh: bool) -> Self {
        let data = match typ {
            MnodeType::File => MnodeData::File(Mutex::new(FilePages {
                data: Vec::new(),
                dirty: false,
                initialized: fresh,
            })),
            MnodeType::Dir => MnodeData::Dir(Mutex::new(DirChildren {
                children: HashMap::new(),
                loaded: fresh,
            })),
            MnodeType::Dev => MnodeData::Dev,
        };
        Self {
            mnum,
            typ,
            data,
            open_count: AtomicU32::new(0),
            nlink_mem: AtomicU32::new(0),
            parent: AtomicU64::new(0),
        }
    }
}

pub struct ScaleFs {
    pub fs: DiskFs,

    mnodes: Mutex<HashMap<u64, Arc<Mnode>>>,
    inum_to_mnum: Mutex<HashMap<u32, u64>>,
    mnum_to_inum: Mutex<HashMap<u64, u32>>,

    /// Per-mnode sleeping lock serializing inode-slot allocation.
    mnum_to_lock: Mutex<HashMap<u64, Arc<Mutex<()>>>>,

    /// Per-mnode logical logs.
    oplogs: Mutex<HashMap<u64, Arc<MfsLogicalLog>>>,

    next_mnum: AtomicU64,

    fds: Mutex<HashMap<u64, u64>>,
    next_fd: AtomicU64,
}

impl ScaleFs {
    /// Build a fresh file system image on the device.
    pub fn mkfs(dev: &Arc<dyn BlockDevice>, size: u32, ninodes: u32) {
        crate::fs::mkfs::mkfs(dev, size, ninodes);
    }

    /// Mount: replay the journal, rebuild allocator state, reclaim
    /// deferred inodes, and bind the root directory.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Self {
        let sfs = Self {
            fs: DiskFs::new(dev),
            mnodes: Mutex::new(HashMap::new()),
            inum_to_mnum: Mutex::new(HashMap::new()),
            mnum_to_inum: Mutex::new(HashMap::new()),
            mnum_to_lock: Mutex::new(HashMap::new()),
            oplogs: Mutex::new(HashMap::new()),
            next_mnum: AtomicU64::new(ROOT_MNUM + 1),
            fds: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(3),
        };
        sfs.fs.init();
        sfs.load_root();
        sfs
    }

    fn load_root(&self) {
        let root = Arc::new(Mnode::new(ROOT_MNUM, MnodeType::Dir, false));
        root.parent.store(ROOT_MNUM, Ordering::Relaxed);
        root.nlink_mem.store(1, Ordering::Relaxed);
        self.register_mnode(&root);
        self.bind(ROOT_MNUM, ROOTINO);
        info!("mounted; root is mnode {}", ROOT_MNUM);
    }

    // Bindings and registries.

    fn register_mnode(&self, m: &Arc<Mnode>) {
        self.mnodes.lock().insert(m.mnum, Arc::clone(m));
        self.mnum_to_lock
            .lock()
            .insert(m.mnum, Arc::new(Mutex::new(())));
        self.oplogs
            .lock()
            .insert(m.mnum, Arc::new(MfsLogicalLog::new()));
    }

    pub(crate) fn bind(&self, mnum: u64, inum: u32) {
        if self.inum_to_mnum.lock().insert(inum, mnum).is_some() {
            panic!("bind: inum {} already bound", inum);
        }
        if self.mnum_to_inum.lock().insert(mnum, inum).is_some() {
            panic!("bind: mnum {} already bound", mnum);
        }
    }

    pub(crate) fn unbind(&self, mnum: u64, inum: u32) {
        self.inum_to_mnum.lock().remove(&inum);
        self.mnum_to_inum.lock().remove(&mnum);
    }

    pub(crate) fn inum_lookup(&self, mnum: u64) -> Option<u32> {
        self.mnum_to_inum.lock().get(&mnum).copied()
    }

    pub(crate) fn mnum_lookup(&self, inum: u32) -> Option<u64> {
        self.inum_to_mnum.lock().get(&inum).copied()
    }

    fn mnode(&self, mnum: u64) -> Result<Arc<Mnode>> {
        self.mnodes
            .lock()
            .get(&mnum)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    pub(crate) fn oplog(&self, mnum: u64) -> Arc<MfsLogicalLog> {
        self.oplogs
            .lock()
            .get(&mnum)
            .cloned()
            .unwrap_or_else(|| panic!("no oplog for mnode {}", mnum))
    }

    pub(crate) fn mnode_lock(&self, mnum: u64) -> Arc<Mutex<()>> {
        self.mnum_to_lock
            .lock()
            .get(&mnum)
            .cloned()
            .unwrap_or_else(|| panic!("no lock for mnode {}", mnum))
    }

    pub(crate) fn free_metadata_log(&self, mnum: u64) {
        self.oplogs.lock().remove(&mnum);
    }

    pub(crate) fn free_mnode_lock(&self, mnum: u64) {
        self.mnum_to_lock.lock().remove(&mnum);
    }

    pub(crate) fn mnode_open_count(&self, mnum: u64) -> u32 {
        self.mnodes
            .lock()
            .get(&mnum)
            .map_or(0, |m| m.open_count.load(Ordering::Relaxed))
    }

    // Namespace walking.

    fn dir_of(m: &Mnode) -> Result<&Mutex<DirChildren>> {
        match &m.data {
            MnodeData::Dir(d) => Ok(d),
            _ => Err(FsError::NotDir),
        }
    }

    /// Fold the on-disk directory into the child map, creating mnodes
    /// for entries seen for the first time.
    fn ensure_dir_loaded(&self, m: &Arc<Mnode>) -> Result<()> {
        let dir = Self::dir_of(m)?;
        let mut dc = dir.lock();
        if dc.loaded {
            return Ok(());
        }
        if let Some(inum) = self.inum_lookup(m.mnum) {
            let ip = self.fs.iget(inum);
            let entries = {
                let inner = ip.inner.read();
                self.fs.dir_entries(&ip, &inner)
            };
            for (name, child_inum) in entries {
                if name == ".." {
                    continue;
                }
                let child_mnum = self.load_dir_entry(child_inum, m.mnum);
                let Some(child_mnum) = child_mnum else { continue };
                dc.children.insert(name, child_mnum);
                if let Ok(child) = self.mnode(child_mnum) {
                    child.nlink_mem.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        dc.loaded = true;
        Ok(())
    }

    /// Find or create the mnode for an on-disk directory entry.
    fn load_dir_entry(&self, inum: u32, parent_mnum: u64) -> Option<u64> {
        if let Some(mnum) = self.mnum_lookup(inum) {
            return Some(mnum);
        }
        let ip = self.fs.iget(inum);
        let typ = MnodeType::from_disk(ip.inner.read().typ)?;

        let mnum = self.next_mnum.fetch_add(1, Ordering::Relaxed);
        let m = Arc::new(Mnode::new(mnum, typ, false));
        m.parent.store(parent_mnum, Ordering::Relaxed);
        self.register_mnode(&m);
        self.bind(mnum, inum);
        Some(mnum)
    }

    fn lookup_child(&self, dir_mnum: u64, name: &str) -> Result<u64> {
        let m = self.mnode(dir_mnum)?;
        self.ensure_dir_loaded(&m)?;
        let dir = Self::dir_of(&m)?;
        let dc = dir.lock();
        dc.children.get(name).copied().ok_or(FsError::NotFound)
    }

    fn resolve(&self, path: &str) -> Result<u64> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let mut cur = ROOT_MNUM;
        let mut remaining = path;
        while let Some((rest, name)) = skipelem(remaining) {
            if name.len() > DIRSIZ {
                return Err(FsError::NameTooLong);
            }
            cur = self.lookup_child(cur, name)?;
            remaining = rest;
        }
        Ok(cur)
    }

    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(u64, &'p str)> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let mut cur = ROOT_MNUM;
        let mut remaining = path;
        loop {
            let (rest, name) = skipelem(remaining).ok_or(FsError::InvalidPath)?;
            if name.len() > DIRSIZ {
                return Err(FsError::NameTooLong);
            }
            if skipelem(rest).is_none() {
                return Ok((cur, name));
            }
            cur = self.lookup_child(cur, name)?;
            remaining = rest;
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    // Metadata operations. Each mutates the namespace, then appends to
    // the oplogs of the objects touched inside begin/end brackets.

    pub fn create(&self, path: &str, typ: MnodeType) -> Result<u64> {
        let (parent_mnum, name) = self.resolve_parent(path)?;
        let parent = self.mnode(parent_mnum)?;
        self.ensure_dir_loaded(&parent)?;

        let mnum = self.next_mnum.fetch_add(1, Ordering::Relaxed);
        let child = Arc::new(Mnode::new(mnum, typ, true));
        child.parent.store(parent_mnum, Ordering::Relaxed);
        child.nlink_mem.store(1, Ordering::Relaxed);
        self.register_mnode(&child);

        {
            let dir = Self::dir_of(&parent)?;
            let mut dc = dir.lock();
            if dc.children.contains_key(name) {
                drop(dc);
                self.mnodes.lock().remove(&mnum);
                self.free_metadata_log(mnum);
                self.free_mnode_lock(mnum);
                return Err(FsError::Exists);
            }
            dc.children.insert(name.to_owned(), mnum);
        }

        let cpu = cpu::id();
        let child_log = self.oplog(mnum);
        let ts = self.fs.get_tsc();
        child_log.op_start(cpu, ts);
        child_log.append(
            cpu,
            Operation::Create {
                mnum,
                parent: parent_mnum,
                typ,
                timestamp: ts,
            },
        );
        child_log.op_end(cpu);

        // The new name is logged against both objects: draining either
        // the child (fsync of the file) or the parent (fsync of the
        // directory) makes the entry durable. Applying a link is
        // idempotent, so draining both is harmless.
        self.append_link(cpu, mnum, parent_mnum, name, typ);

        Ok(mnum)
    }

    fn append_link(&self, cpu: usize, mnum: u64, parent_mnum: u64, name: &str, typ: MnodeType) {
        for log_mnum in [mnum, parent_mnum] {
            let log = self.oplog(log_mnum);
            let ts = self.fs.get_tsc();
            log.op_start(cpu, ts);
            log.append(
                cpu,
                Operation::Link {
                    mnum,
                    parent: parent_mnum,
                    name: name.to_owned(),
                    typ,
                    timestamp: ts,
                },
            );
            log.op_end(cpu);
        }
    }

    pub fn mkdir(&self, path: &str) -> Result<u64> {
        self.create(path, MnodeType::Dir)
    }

    pub fn link(&self, oldpath: &str, newpath: &str) -> Result<()> {
        let mnum = self.resolve(oldpath)?;
        let m = self.mnode(mnum)?;
        if m.typ == MnodeType::Dir {
            return Err(FsError::IsDir);
        }

        let (parent_mnum, name) = self.resolve_parent(newpath)?;
        let parent = self.mnode(parent_mnum)?;
        self.ensure_dir_loaded(&parent)?;
        {
            let dir = Self::dir_of(&parent)?;
            let mut dc = dir.lock();
            if dc.children.contains_key(name) {
                return Err(FsError::Exists);
            }
            dc.children.insert(name.to_owned(), mnum);
        }
        m.nlink_mem.fetch_add(1, Ordering::Relaxed);

        self.append_link(cpu::id(), mnum, parent_mnum, name, m.typ);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent_mnum, name) = self.resolve_parent(path)?;
        let parent = self.mnode(parent_mnum)?;
        self.ensure_dir_loaded(&parent)?;

        let mnum = {
            let dir = Self::dir_of(&parent)?;
            let dc = dir.lock();
            *dc.children.get(name).ok_or(FsError::NotFound)?
        };
        let m = self.mnode(mnum)?;
        if m.typ == MnodeType::Dir {
            self.ensure_dir_loaded(&m)?;
            let dir = Self::dir_of(&m)?;
            if !dir.lock().children.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }

        {
            let dir = Self::dir_of(&parent)?;
            dir.lock().children.remove(name);
        }
        let was_last = m.nlink_mem.fetch_sub(1, Ordering::Relaxed) == 1;

        let cpu = cpu::id();
        let parent_log = self.oplog(parent_mnum);
        let ts = self.fs.get_tsc();
        parent_log.op_start(cpu, ts);
        parent_log.append(
            cpu,
            Operation::Unlink {
                parent: parent_mnum,
                name: name.to_owned(),
                mnum,
                timestamp: ts,
            },
        );
        parent_log.op_end(cpu);

        if was_last && m.open_count.load(Ordering::Relaxed) == 0 {
            self.mnodes.lock().remove(&mnum);
        }
        Ok(())
    }

    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let (src_parent, src_name) = self.resolve_parent(src)?;
        let (dst_parent, dst_name) = self.resolve_parent(dst)?;
        let sparent = self.mnode(src_parent)?;
        let dparent = self.mnode(dst_parent)?;
        self.ensure_dir_loaded(&sparent)?;
        self.ensure_dir_loaded(&dparent)?;

        let sdir = Self::dir_of(&sparent)?;
        let ddir = Self::dir_of(&dparent)?;

        // Move the name. Child-map locks nest in mnum order so two
        // opposite-direction renames cannot deadlock.
        let (mnum, displaced) = if src_parent == dst_parent {
            let mut dc = sdir.lock();
            let mnum = *dc.children.get(src_name).ok_or(FsError::NotFound)?;
            dc.children.remove(src_name);
            let displaced = dc.children.insert(dst_name.to_owned(), mnum);
            (mnum, displaced)
        } else {
            let (first, second) = if src_parent < dst_parent {
                (sdir, ddir)
            } else {
                (ddir, sdir)
            };
            let mut g1 = first.lock();
            let mut g2 = second.lock();
            let (sdc, ddc) = if src_parent < dst_parent {
                (&mut *g1, &mut *g2)
            } else {
                (&mut *g2, &mut *g1)
            };
            let mnum = *sdc.children.get(src_name).ok_or(FsError::NotFound)?;
            sdc.children.remove(src_name);
            let displaced = ddc.children.insert(dst_name.to_owned(), mnum);
            (mnum, displaced)
        };

        let m = self.mnode(mnum)?;
        m.parent.store(dst_parent, Ordering::Relaxed);
        if let Some(old) = displaced {
            if old != mnum {
                if let Ok(old_m) = self.mnode(old) {
                    let was_last = old_m.nlink_mem.fetch_sub(1, Ordering::Relaxed) == 1;
                    if was_last && old_m.open_count.load(Ordering::Relaxed) == 0 {
                        self.mnodes.lock().remove(&old);
                    }
                }
            }
        }

        let cpu = cpu::id();
        let ts = self.fs.get_tsc();

        let dst_log = self.oplog(dst_parent);
        dst_log.op_start(cpu, ts);
        dst_log.append(
            cpu,
            Operation::RenameLink {
                src_parent,
                dst_parent,
                mnum,
                newname: dst_name.to_owned(),
                typ: m.typ,
                timestamp: ts,
            },
        );
        dst_log.op_end(cpu);

        let src_log = self.oplog(src_parent);
        src_log.op_start(cpu, ts);
        src_log.append(
            cpu,
            Operation::RenameUnlink {
                src_parent,
                dst_parent,
                mnum,
                name: src_name.to_owned(),
                timestamp: ts,
            },
        );
        src_log.op_end(cpu);

        // A moved directory gets a barrier in its own log: content ops
        // logged after the move depend on the rename reaching the disk.
        if m.typ == MnodeType::Dir && src_parent != dst_parent {
            let tsb = self.fs.get_tsc();
            let own_log = self.oplog(mnum);
            own_log.op_start(cpu, tsb);
            own_log.append(
                cpu,
                Operation::RenameBarrier {
                    mnum,
                    parent: dst_parent,
                    timestamp: tsb,
                },
            );
            own_log.op_end(cpu);
        }
        Ok(())
    }

    // File handles and pages.

    pub fn open(&self, path: &str) -> Result<u64> {
        let mnum = self.resolve(path)?;
        let m = self.mnode(mnum)?;
        if m.typ == MnodeType::Dir {
            return Err(FsError::IsDir);
        }
        m.open_count.fetch_add(1, Ordering::Relaxed);
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.fds.lock().insert(fd, mnum);
        Ok(fd)
    }

    pub fn close(&self, fd: u64) -> Result<()> {
        let mnum = self.fds.lock().remove(&fd).ok_or(FsError::BadFd)?;
        let m = self.mnode(mnum)?;
        let last_handle = m.open_count.fetch_sub(1, Ordering::Relaxed) == 1;
        if last_handle && m.nlink_mem.load(Ordering::Relaxed) == 0 {
            // The orphan finally lost its last handle; its inode can go
            // the next time anything drains this log.
            let cpu = cpu::id();
            let log = self.oplog(mnum);
            let ts = self.fs.get_tsc();
            log.op_start(cpu, ts);
            log.append(cpu, Operation::Delete { mnum, timestamp: ts });
            log.op_end(cpu);
            self.mnodes.lock().remove(&mnum);
        }
        Ok(())
    }

    fn fd_mnode(&self, fd: u64) -> Result<Arc<Mnode>> {
        let mnum = *self.fds.lock().get(&fd).ok_or(FsError::BadFd)?;
        self.mnode(mnum)
    }

    fn file_pages<'m>(&self, m: &'m Mnode) -> Result<&'m Mutex<FilePages>> {
        match &m.data {
            MnodeData::File(p) => Ok(p),
            _ => Err(FsError::BadFd),
        }
    }

    /// Populate the page cache from the on-disk contents on first touch.
    fn initialize_file(&self, m: &Mnode, pages: &mut FilePages) -> Result<()> {
        if pages.initialized {
            return Ok(());
        }
        if let Some(inum) = self.inum_lookup(m.mnum) {
            let ip = self.fs.iget(inum);
            let inner = ip.inner.read();
            let mut buf = vec![0u8; inner.size as usize];
            let n = self.fs.readi(&inner, &mut buf, 0)?;
            buf.truncate(n);
            pages.data = buf;
        }
        pages.initialized = true;
        Ok(())
    }

    pub fn write(&self, fd: u64, off: usize, src: &[u8]) -> Result<usize> {
        let m = self.fd_mnode(fd)?;
        let pages = self.file_pages(&m)?;
        let mut pages = pages.lock();
        self.initialize_file(&m, &mut pages)?;

        let max = MAXFILE * BSIZE;
        if off >= max {
            return Ok(0);
        }
        let n = src.len().min(max - off);
        if pages.data.len() < off + n {
            pages.data.resize(off + n, 0);
        }
        pages.data[off..off + n].copy_from_slice(&src[..n]);
        pages.dirty = true;
        Ok(n)
    }

    pub fn read(&self, fd: u64, off: usize, dst: &mut [u8]) -> Result<usize> {
        let m = self.fd_mnode(fd)?;
        let pages = self.file_pages(&m)?;
        let mut pages = pages.lock();
        self.initialize_file(&m, &mut pages)?;

        if off >= pages.data.len() {
            return Ok(0);
        }
        let n = dst.len().min(pages.data.len() - off);
        dst[..n].copy_from_slice(&pages.data[off..off + n]);
        Ok(n)
    }

    /// Whole-file read by path, for tools and tests.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mnum = self.resolve(path)?;
        let m = self.mnode(mnum)?;
        let pages = self.file_pages(&m)?;
        let mut pages = pages.lock();
        self.initialize_file(&m, &mut pages)?;
        Ok(pages.data.clone())
    }

    pub fn file_size(&self, path: &str) -> Result<usize> {
        Ok(self.read_file(path)?.len())
    }

    // Durability.

    pub fn fsync(&self, path: &str) -> Result<()> {
        let mnum = self.resolve(path)?;
        self.fsync_mnum(mnum)
    }

    pub fn fsync_fd(&self, fd: u64) -> Result<()> {
        let mnum = *self.fds.lock().get(&fd).ok_or(FsError::BadFd)?;
        self.fsync_mnum(mnum)
    }

    /// Drain every metadata operation reachable from `mnum` with
    /// timestamp at or below now, flush this file's dirty pages, and
    /// push everything through the journal.
    fn fsync_mnum(&self, mnum: u64) -> Result<()> {
        let max_tsc = self.fs.get_tsc();
        self.process_metadata_log(max_tsc, mnum);

        if let Ok(m) = self.mnode(mnum) {
            if m.typ == MnodeType::File {
                self.sync_file(&m)?;
            }
        }

        let mut jr = self.fs.journal.prepare_for_commit();
        self.fs.flush_journal_locked(&mut jr);
        Ok(())
    }

    /// Write the file's dirty pages through `writei` in journal-sized
    /// chunks, then record the final size once.
    fn sync_file(&self, m: &Mnode) -> Result<()> {
        let Some(inum) = self.inum_lookup(m.mnum) else {
            return Ok(());
        };
        let pages = self.file_pages(m)?;
        let mut pages = pages.lock();
        if !pages.dirty {
            return Ok(());
        }

        let ip = self.fs.iget(inum);
        let mut inner = ip.inner.write();
        let data = &pages.data;
        let mut jr = self.fs.journal.prepare_for_commit();

        let mut off = 0usize;
        loop {
            let n = (data.len() - off).min(MAXOPBLOCKS * BSIZE);
            let mut tr = Transaction::new(self.fs.get_tsc());
            if n > 0 {
                let written = self.fs.writei(&mut inner, &data[off..off + n], off as u32, Some(&mut tr), false)?;
                if written < n {
                    self.fs.add_to_journal_locked(&mut jr, tr);
                    return Err(FsError::OutOfBlocks);
                }
                off += n;
            }
            if off >= data.len() {
                self.fs.update_size(inum, &mut inner, data.len() as u32, &mut tr);
                self.fs.add_to_journal_locked(&mut jr, tr);
                break;
            }
            self.fs.add_to_journal_locked(&mut jr, tr);
        }

        pages.dirty = false;
        Ok(())
    }

    // Cache pressure hooks.

    /// Drop clean blocks from the buffer cache.
    pub fn evict_bufcache(&self) {
        self.fs.evict_bufcache();
    }

    /// Drop clean page-cache contents of every file.
    pub fn evict_pagecache(&self) {
        info!("evict_caches: dropping page-cache pages");
        let mnodes: Vec<Arc<Mnode>> = self.mnodes.lock().values().cloned().collect();
        for m in mnodes {
            if let MnodeData::File(p) = &m.data {
                let mut pages = p.lock();
                if pages.initialized && !pages.dirty {
                    pages.data = Vec::new();
                    pages.initialized = false;
                }
            }
        }
    }

    /// Free blocks as counted by the in-memory allocator.
    pub fn free_block_count(&self) -> u32 {
        self.fs.free_block_count()
    }
}
