//! Block device interface.
//!
//! The file system drives any device implementing `BlockDevice`; the
//! buffer cache is the only layer that calls it. `flush` is the write
//! barrier: once it returns, every completed `write_block` is durable.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::param::BSIZE;

pub trait BlockDevice: Send + Sync {
    /// Read block `bno` into `buf`, which must be `BSIZE` bytes.
    fn read_block(&self, bno: u32, buf: &mut [u8]);

    /// Write `buf`, which must be `BSIZE` bytes, to block `bno`.
    fn write_block(&self, bno: u32, buf: &[u8]);

    /// Write barrier.
    fn flush(&self);
}

/// RAM-backed disk. Contents survive as long as the `Arc` does, which is
/// what lets tests drop an entire mounted file system ("crash") and mount
/// the same disk again.
pub struct MemDisk {
    blocks: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(nblocks: u32) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(vec![0; nblocks as usize * BSIZE]),
        })
    }

    /// A point-in-time copy of the disk contents.
    pub fn snapshot(&self) -> Arc<MemDisk> {
        Arc::new(Self {
            blocks: Mutex::new(self.blocks.lock().clone()),
        })
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, bno: u32, buf: &mut [u8]) {
        let blocks = self.blocks.lock();
        let off = bno as usize * BSIZE;
        buf.copy_from_slice(&blocks[off..off + BSIZE]);
    }

    fn write_block(&self, bno: u32, buf: &[u8]) {
        let mut blocks = self.blocks.lock();
        let off = bno as usize * BSIZE;
        blocks[off..off + BSIZE].copy_from_slice(buf);
    }

    fn flush(&self) {}
}

/// A disk backed by a host file, one block per `BSIZE` byte range.
pub struct FileDisk(Mutex<File>);

impl FileDisk {
    pub fn new(file: File) -> Arc<Self> {
        Arc::new(Self(Mutex::new(file)))
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, bno: u32, buf: &mut [u8]) {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start(bno as u64 * BSIZE as u64))
            .expect("FileDisk: seek");
        file.read_exact(buf).expect("FileDisk: short read");
    }

    fn write_block(&self, bno: u32, buf: &[u8]) {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start(bno as u64 * BSIZE as u64))
            .expect("FileDisk: seek");
        file.write_all(buf).expect("FileDisk: short write");
    }

    fn flush(&self) {
        self.0.lock().sync_data().expect("FileDisk: sync");
    }
}
