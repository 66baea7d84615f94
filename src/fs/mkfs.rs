//! Build an initial file system image on a block device.
//!
//! Layout: boot block, superblock, inode table, free bitmap, data blocks.
//! The image starts with two objects: the root directory and the journal
//! file, pre-sized to `PHYS_JOURNAL_SIZE` so journal writes never
//! allocate.
//!
//! Every block, the inode table included, is written as zeros first;
//! the allocator's claim check relies on "type is free implies the whole
//! slot is zero" holding from day one.

use std::sync::Arc;

use zerocopy::AsBytes;

use crate::device::BlockDevice;
use crate::param::{BSIZE, NDIRECT, PHYS_JOURNAL_SIZE, ROOTINO};

use super::dir::{Dirent, DIRENT_SIZE};
use super::inode::{Dinode, DINODE_SIZE, T_DIR, T_FILE};
use super::superblock::{Superblock, FSMAGIC, IPB, SBBLOCK};

/// I-number mkfs gives the journal file. Not part of the on-disk
/// contract; mounts find the journal by name.
const JOURNAL_INO: u32 = ROOTINO + 1;

fn write_with(dev: &Arc<dyn BlockDevice>, bno: u32, f: impl FnOnce(&mut [u8; BSIZE])) {
    let mut data = Box::new([0u8; BSIZE]);
    dev.read_block(bno, &mut data[..]);
    f(&mut data);
    dev.write_block(bno, &data[..]);
}

pub fn mkfs(dev: &Arc<dyn BlockDevice>, size: u32, ninodes: u32) {
    assert!(ninodes > JOURNAL_INO, "mkfs: too few inodes");
    assert_eq!(PHYS_JOURNAL_SIZE % BSIZE, 0);

    let mut sb = Superblock {
        magic: FSMAGIC,
        size,
        nblocks: 0,
        ninodes,
        num_reclaim_inodes: 0,
        reclaim_inodes: [0; crate::param::NRECLAIM_INODES],
    };
    let data_start = sb.data_start();
    sb.nblocks = size
        .checked_sub(data_start)
        .expect("mkfs: image too small for metadata");

    let zero = [0u8; BSIZE];
    for bno in 0..size {
        dev.write_block(bno, &zero);
    }

    // Lay out the root directory's block and the journal file's blocks
    // contiguously at the start of the data area.
    let mut next = data_start;
    let mut take = || {
        let b = next;
        next += 1;
        assert!(next <= size, "mkfs: image too small for the journal");
        b
    };

    let root_dir_bno = take();

    let jblocks = PHYS_JOURNAL_SIZE / BSIZE;
    let mut jaddrs = [0u32; NDIRECT + 2];
    for slot in jaddrs.iter_mut().take(NDIRECT.min(jblocks)) {
        *slot = take();
    }
    if jblocks > NDIRECT {
        let itable_bno = take();
        jaddrs[NDIRECT] = itable_bno;
        let rest: Vec<u32> = (NDIRECT..jblocks).map(|_| take()).collect();
        write_with(dev, itable_bno, |data| {
            for (i, bno) in rest.iter().enumerate() {
                data[i * 4..i * 4 + 4].copy_from_slice(&bno.to_ne_bytes());
            }
        });
    }
    let allocated_end = next;

    // Root and journal inodes share the first inode-table block.
    assert!((JOURNAL_INO as usize) < IPB);
    write_with(dev, sb.iblock(ROOTINO), |data| {
        let root = Dinode {
            typ: T_DIR,
            major: 0,
            minor: 0,
            nlink: 1,
            size: DIRENT_SIZE as u32,
            gen: 0,
            addrs: {
                let mut a = [0u32; NDIRECT + 2];
                a[0] = root_dir_bno;
                a
            },
        };
        let journal = Dinode {
            typ: T_FILE,
            major: 0,
            minor: 0,
            nlink: 1,
            size: PHYS_JOURNAL_SIZE as u32,
            gen: 0,
            addrs: jaddrs,
        };
        let off = ROOTINO as usize % IPB * DINODE_SIZE;
        data[off..off + DINODE_SIZE].copy_from_slice(root.as_bytes());
        let off = JOURNAL_INO as usize % IPB * DINODE_SIZE;
        data[off..off + DINODE_SIZE].copy_from_slice(journal.as_bytes());
    });

    // The root directory's single entry: the journal file.
    write_with(dev, root_dir_bno, |data| {
        let de = Dirent::new(JOURNAL_INO, &crate::param::JOURNAL_PATH[1..]);
        data[..DIRENT_SIZE].copy_from_slice(de.as_bytes());
    });

    // Mark everything up to the end of the journal as allocated.
    for bno in 0..allocated_end {
        write_with(dev, sb.bblock(bno), |data| {
            let bi = (bno % super::superblock::BPB) as usize;
            data[bi / 8] |= 1 << (bi % 8);
        });
    }

    write_with(dev, SBBLOCK, |data| sb.write_to_block(data));

    dev.flush();
}
