//! Buffer cache.
//!
//! Caches disk blocks in memory and provides the synchronization point
//! for blocks shared between cores. Each `Buf` carries its own
//! read/write sleeping lock so it can be held across disk I/O.
//!
//! Interface:
//! * `BufCache::get` returns the cached block, reading it from the device
//!   unless the caller is about to overwrite it whole (`skip_read`).
//! * `Buf::read`/`Buf::write` run a closure against the block contents
//!   under the appropriate side of the lock; `write` marks the block dirty.
//! * `Buf::writeback` writes a dirty block to its home location.
//! * `Buf::add_to_transaction` snapshots the current contents into a
//!   transaction and marks the block clean: from that point the
//!   transaction, not the cache, owns getting the bytes to disk.
//!
//! Buffers are never written back on drop. A dropped cache loses exactly
//! the blocks that were not journaled or written back, which is the crash
//! model the journal is built for.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::BlockDevice;
use crate::fs::journal::Transaction;
use crate::lock::RwSleepLock;
use crate::param::BSIZE;

pub struct Buf {
    bno: u32,
    dev: Arc<dyn BlockDevice>,
    inner: RwSleepLock<BufInner>,
}

struct BufInner {
    data: Box<[u8; BSIZE]>,
    dirty: bool,
}

impl Buf {
    fn new(bno: u32, dev: Arc<dyn BlockDevice>, skip_read: bool) -> Self {
        let mut data = Box::new([0u8; BSIZE]);
        if !skip_read {
            dev.read_block(bno, &mut data[..]);
        }
        Self {
            bno,
            dev,
            inner: RwSleepLock::new(BufInner {
                data,
                // A skipped read leaves garbage-free zeros that are not
                // on disk yet; the block must not be silently dropped as
                // clean.
                dirty: skip_read,
            }),
        }
    }

    pub fn bno(&self) -> u32 {
        self.bno
    }

    /// Run `f` against the block contents under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&[u8; BSIZE]) -> R) -> R {
        let inner = self.inner.read();
        f(&inner.data)
    }

    /// Run `f` against the block contents under the write lock and mark
    /// the block dirty.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8; BSIZE]) -> R) -> R {
        let mut inner = self.inner.write();
        inner.dirty = true;
        f(&mut inner.data)
    }

    /// Write the block to its home location and mark it clean.
    pub fn writeback(&self) {
        let mut inner = self.inner.write();
        if inner.dirty {
            self.dev.write_block(self.bno, &inner.data[..]);
            inner.dirty = false;
        }
    }

    /// Snapshot the current contents into `tr` and mark the block clean.
    /// The snapshot is taken under the write lock so exactly this version
    /// of the block is what commits.
    pub fn add_to_transaction(&self, tr: &mut Transaction) {
        let mut inner = self.inner.write();
        tr.add_unique_block(self.bno, &inner.data[..]);
        inner.dirty = false;
    }

    /// Mutate the block and snapshot the result into `tr` under a single
    /// write-lock hold, so no other writer can slip in between the change
    /// and the version that commits.
    pub fn write_and_log<R>(&self, tr: &mut Transaction, f: impl FnOnce(&mut [u8; BSIZE]) -> R) -> R {
        let mut inner = self.inner.write();
        let r = f(&mut inner.data);
        tr.add_unique_block(self.bno, &inner.data[..]);
        inner.dirty = false;
        r
    }

    /// Pin the write side without a guard; the journal holds block locks
    /// from `prepare_for_commit` until the batch is applied.
    pub(crate) fn pin_write(&self) {
        self.inner.acquire_write();
    }

    pub(crate) fn unpin_write(&self) {
        self.inner.release_write();
    }

}

pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
    map: Mutex<HashMap<u32, Arc<Buf>>>,
}

impl BufCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Return the cached block `bno`, loading it from the device if absent.
    /// `skip_read` elides the device read when the caller will overwrite
    /// the whole block.
    pub fn get(&self, bno: u32, skip_read: bool) -> Arc<Buf> {
        if let Some(b) = self.map.lock().get(&bno) {
            return Arc::clone(b);
        }

        // Load outside the map lock; a racing loader is harmless, the
        // first insert wins and the loser's copy is dropped.
        let fresh = Arc::new(Buf::new(bno, Arc::clone(&self.dev), skip_read));
        let mut map = self.map.lock();
        Arc::clone(map.entry(bno).or_insert(fresh))
    }

    /// Drop every clean block nobody holds a reference to.
    pub fn evict_clean(&self) {
        let mut map = self.map.lock();
        map.retain(|_, b| Arc::strong_count(b) > 1 || b.inner.read().dirty);
    }

    /// Overwrite the cached copy of `bno`, if one exists, with contents
    /// that are already durable on disk.
    pub fn update_cached(&self, bno: u32, data: &[u8]) {
        let cached = self.map.lock().get(&bno).cloned();
        if let Some(b) = cached {
            let mut inner = b.inner.write();
            inner.data.copy_from_slice(data);
            inner.dirty = false;
        }
    }

    /// Number of cached blocks, for eviction diagnostics.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    #[test]
    fn get_caches_and_evict_drops_clean() {
        let disk = MemDisk::new(8);
        let cache = BufCache::new(disk);

        let b = cache.get(3, false);
        assert!(Arc::ptr_eq(&b, &cache.get(3, false)));
        assert_eq!(cache.len(), 1);

        // Dirty blocks survive eviction.
        b.write(|data| data[0] = 0xab);
        drop(b);
        cache.evict_clean();
        assert_eq!(cache.len(), 1);

        cache.get(3, false).writeback();
        cache.evict_clean();
        assert!(cache.is_empty());
    }

    #[test]
    fn writeback_reaches_device_and_reload_sees_it() {
        let disk = MemDisk::new(8);
        let cache = BufCache::new(Arc::clone(&disk) as _);

        let b = cache.get(5, false);
        b.write(|data| data[7] = 0x5a);
        b.writeback();
        drop(b);
        cache.evict_clean();

        let b = cache.get(5, false);
        assert_eq!(b.read(|data| data[7]), 0x5a);
    }
}
