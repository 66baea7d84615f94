//! End-to-end crash and recovery scenarios.
//!
//! A "crash" drops the mounted file system without closing anything; the
//! device keeps only what reached it. Remounting runs journal recovery,
//! rebuilds allocator state, and reclaims deferred inodes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use scalefs::param::{BSIZE, JHDR_SIZE, JOURNAL_PATH};
use scalefs::{BlockDevice, MemDisk, MnodeType, ScaleFs};

const DISK_BLOCKS: u32 = 2048;
const NINODES: u32 = 512;

fn fresh_disk() -> Arc<MemDisk> {
    let disk = MemDisk::new(DISK_BLOCKS);
    ScaleFs::mkfs(&(Arc::clone(&disk) as Arc<dyn BlockDevice>), DISK_BLOCKS, NINODES);
    disk
}

fn mount(disk: &Arc<MemDisk>) -> ScaleFs {
    ScaleFs::mount(Arc::clone(disk) as Arc<dyn BlockDevice>)
}

#[test]
fn create_write_fsync_survives_crash() {
    let disk = fresh_disk();
    {
        let sfs = mount(&disk);
        sfs.create("/a", MnodeType::File).unwrap();
        let fd = sfs.open("/a").unwrap();
        sfs.write(fd, 0, b"hello").unwrap();
        sfs.fsync("/a").unwrap();
        // Crash: buffer cache and namespace vanish, the disk stays.
    }
    let sfs = mount(&disk);
    assert_eq!(sfs.read_file("/a").unwrap(), b"hello");
}

#[test]
fn unsynced_data_is_lost_but_disk_stays_consistent() {
    let disk = fresh_disk();
    {
        let sfs = mount(&disk);
        sfs.create("/gone", MnodeType::File).unwrap();
        let fd = sfs.open("/gone").unwrap();
        sfs.write(fd, 0, b"bytes").unwrap();
        // No fsync.
    }
    let sfs = mount(&disk);
    assert!(!sfs.exists("/gone"));
}

#[test]
fn journal_is_reset_after_fsync() {
    let disk = fresh_disk();
    let sfs = mount(&disk);
    sfs.create("/f", MnodeType::File).unwrap();
    sfs.fsync("/f").unwrap();

    // The journal file must start with a zeroed header once the flush is
    // done.
    let ji = sfs.fs.namei(JOURNAL_PATH).unwrap();
    let inner = ji.inner.read();
    let mut hdr = [0u8; JHDR_SIZE];
    assert_eq!(sfs.fs.readi(&inner, &mut hdr, 0).unwrap(), JHDR_SIZE);
    assert!(hdr.iter().all(|b| *b == 0));
}

#[test]
fn link_before_create_dependency() {
    let disk = fresh_disk();
    {
        let sfs = mount(&disk);
        sfs.mkdir("/a").unwrap();
        sfs.mkdir("/b").unwrap();
        sfs.fsync("/").unwrap();

        sfs.create("/a/f", MnodeType::File).unwrap();
        let fd = sfs.open("/a/f").unwrap();
        sfs.write(fd, 0, b"payload").unwrap();
        sfs.link("/a/f", "/b/f").unwrap();
        sfs.fsync("/b/f").unwrap();
    }

    let sfs = mount(&disk);
    assert_eq!(sfs.read_file("/a/f").unwrap(), b"payload");
    assert_eq!(sfs.read_file("/b/f").unwrap(), b"payload");

    let ip = sfs.fs.namei("/a/f").unwrap();
    assert_eq!(ip.inner.read().nlink, 2);
}

#[test]
fn rename_within_directory() {
    let disk = fresh_disk();
    {
        let sfs = mount(&disk);
        sfs.create("/old", MnodeType::File).unwrap();
        let fd = sfs.open("/old").unwrap();
        sfs.write(fd, 0, b"contents").unwrap();
        sfs.fsync("/old").unwrap();

        sfs.rename("/old", "/new").unwrap();
        sfs.fsync("/new").unwrap();
    }
    let sfs = mount(&disk);
    assert!(!sfs.exists("/old"));
    assert_eq!(sfs.read_file("/new").unwrap(), b"contents");
}

/// Records every block write so a test can replay arbitrary prefixes: a
/// simulated power cut at each point of the write sequence.
struct RecordingDisk {
    inner: Arc<MemDisk>,
    recording: AtomicBool,
    log: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl RecordingDisk {
    fn new(inner: Arc<MemDisk>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            recording: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        })
    }

    fn start(&self) {
        self.recording.store(true, Ordering::SeqCst);
    }

    fn take_log(&self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut self.log.lock())
    }
}

impl BlockDevice for RecordingDisk {
    fn read_block(&self, bno: u32, buf: &mut [u8]) {
        self.inner.read_block(bno, buf);
    }

    fn write_block(&self, bno: u32, buf: &[u8]) {
        if self.recording.load(Ordering::SeqCst) {
            self.log.lock().push((bno, buf.to_vec()));
        }
        self.inner.write_block(bno, buf);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[test]
fn cross_directory_rename_is_atomic_under_torn_writes() {
    let disk = fresh_disk();
    {
        let sfs = mount(&disk);
        sfs.mkdir("/d1").unwrap();
        sfs.mkdir("/d2").unwrap();
        sfs.create("/d1/x", MnodeType::File).unwrap();
        let fd = sfs.open("/d1/x").unwrap();
        sfs.write(fd, 0, b"cargo").unwrap();
        sfs.fsync("/d1/x").unwrap();
        sfs.fsync("/d1").unwrap();
        sfs.fsync("/d2").unwrap();
    }

    let rec = RecordingDisk::new(Arc::clone(&disk));
    let pristine;
    let writes;
    {
        let sfs = ScaleFs::mount(Arc::clone(&rec) as Arc<dyn BlockDevice>);
        pristine = disk.snapshot();
        rec.start();
        sfs.rename("/d1/x", "/d2/y").unwrap();
        sfs.fsync("/d2/y").unwrap();
        writes = rec.take_log();
    }
    assert!(!writes.is_empty());

    for cut in 0..=writes.len() {
        let img = pristine.snapshot();
        for (bno, data) in &writes[..cut] {
            img.write_block(*bno, data);
        }
        let sfs = mount(&img);
        let old_there = sfs.exists("/d1/x");
        let new_there = sfs.exists("/d2/y");
        assert!(
            old_there ^ new_there,
            "rename not atomic after {} of {} writes",
            cut,
            writes.len()
        );
        if new_there {
            assert_eq!(sfs.read_file("/d2/y").unwrap(), b"cargo");
        }
    }

    // With every write applied, the rename is fully there.
    let sfs = mount(&disk);
    assert!(!sfs.exists("/d1/x"));
    assert_eq!(sfs.read_file("/d2/y").unwrap(), b"cargo");
}

#[test]
fn freed_blocks_are_durable_and_reusable() {
    let disk = fresh_disk();
    let blockful = vec![0xabu8; 500 * BSIZE];
    let before_create;
    let after_unlink;
    {
        let sfs = mount(&disk);
        before_create = sfs.free_block_count();

        sfs.create("/big", MnodeType::File).unwrap();
        let fd = sfs.open("/big").unwrap();
        sfs.write(fd, 0, &blockful).unwrap();
        sfs.fsync("/big").unwrap();
        assert!(sfs.free_block_count() < before_create);

        sfs.close(fd).unwrap();
        sfs.unlink("/big").unwrap();
        sfs.fsync("/").unwrap();
        after_unlink = sfs.free_block_count();
        assert_eq!(after_unlink, before_create);
    }

    // After a crash the on-disk bitmap must agree with what fsync left.
    let sfs = mount(&disk);
    assert_eq!(sfs.free_block_count(), after_unlink);
    assert!(!sfs.exists("/big"));

    // And the freed blocks are really allocatable again.
    sfs.create("/big2", MnodeType::File).unwrap();
    let fd = sfs.open("/big2").unwrap();
    sfs.write(fd, 0, &blockful).unwrap();
    sfs.fsync("/big2").unwrap();
    assert_eq!(sfs.file_size("/big2").unwrap(), blockful.len());
}

#[test]
fn journal_wrap_commits_in_batches() {
    let disk = fresh_disk();
    // More dirty blocks in one fsync than the journal can hold in a
    // single batch forces an internal commit-apply-reset cycle.
    let big = {
        let mut v = vec![0u8; 384 * BSIZE];
        for (i, b) in v.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        v
    };
    {
        let sfs = mount(&disk);
        sfs.create("/wrap", MnodeType::File).unwrap();
        let fd = sfs.open("/wrap").unwrap();
        sfs.write(fd, 0, &big).unwrap();
        sfs.fsync("/wrap").unwrap();
    }
    let sfs = mount(&disk);
    assert_eq!(sfs.read_file("/wrap").unwrap(), big);
}

#[test]
fn unlinked_open_inode_is_reclaimed_at_next_mount() {
    let disk = fresh_disk();
    let baseline;
    {
        let sfs = mount(&disk);
        baseline = sfs.free_block_count();

        sfs.create("/t", MnodeType::File).unwrap();
        let fd = sfs.open("/t").unwrap();
        sfs.write(fd, 0, &vec![7u8; 5 * BSIZE]).unwrap();
        sfs.fsync("/t").unwrap();

        sfs.unlink("/t").unwrap();
        // The open handle blocks deletion; fsync defers it to the next
        // mount via the superblock's reclaim list.
        sfs.fsync("/").unwrap();
        sfs.write(fd, BSIZE, b"still writing").unwrap();
        // Crash before close.
    }

    let sfs = mount(&disk);
    assert!(!sfs.exists("/t"));
    assert_eq!(sfs.free_block_count(), baseline);

    // A second mount finds a clean reclaim list and changes nothing.
    drop(sfs);
    let sfs = mount(&disk);
    assert_eq!(sfs.free_block_count(), baseline);
}

#[test]
fn recovery_is_idempotent() {
    let disk = fresh_disk();
    {
        let sfs = mount(&disk);
        sfs.mkdir("/dir").unwrap();
        sfs.create("/dir/f", MnodeType::File).unwrap();
        let fd = sfs.open("/dir/f").unwrap();
        sfs.write(fd, 0, b"twice-recovered").unwrap();
        sfs.fsync("/dir/f").unwrap();
        sfs.fsync("/dir").unwrap();
    }
    // Two mounts in a row: the second recovery must find nothing new.
    {
        let sfs = mount(&disk);
        assert_eq!(sfs.read_file("/dir/f").unwrap(), b"twice-recovered");
    }
    let sfs = mount(&disk);
    assert_eq!(sfs.read_file("/dir/f").unwrap(), b"twice-recovered");
}

#[test]
fn namespace_errors() {
    let disk = fresh_disk();
    let sfs = mount(&disk);

    sfs.mkdir("/d").unwrap();
    sfs.create("/d/f", MnodeType::File).unwrap();

    assert_eq!(sfs.create("/d/f", MnodeType::File), Err(scalefs::FsError::Exists));
    assert_eq!(sfs.unlink("/d"), Err(scalefs::FsError::NotEmpty));
    assert_eq!(sfs.open("/nope"), Err(scalefs::FsError::NotFound));
    assert_eq!(
        sfs.create("/d/this-name-is-way-too-long", MnodeType::File),
        Err(scalefs::FsError::NameTooLong)
    );
    assert_eq!(sfs.link("/d", "/d2"), Err(scalefs::FsError::IsDir));

    sfs.unlink("/d/f").unwrap();
    sfs.unlink("/d").unwrap();
    assert!(!sfs.exists("/d"));
}

#[test]
fn cache_eviction_hooks() {
    let disk = fresh_disk();
    let sfs = mount(&disk);
    sfs.create("/e", MnodeType::File).unwrap();
    let fd = sfs.open("/e").unwrap();
    sfs.write(fd, 0, b"evictable").unwrap();
    sfs.fsync("/e").unwrap();

    sfs.evict_bufcache();
    sfs.evict_pagecache();
    assert_eq!(sfs.read_file("/e").unwrap(), b"evictable");
}
