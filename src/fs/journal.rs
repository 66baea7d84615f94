//! Journal manager.
//!
//! Write-ahead journaling of transactions into the fixed-size journal
//! file. A flush writes one container transaction per batch:
//!
//!   start header | data record per block | commit header
//!
//! and only after the commit record is on stable storage do the blocks go
//! to their home locations. The journal is then reset by zeroing the
//! first header slot; a zero header is the end-of-log sentinel, and the
//! per-record timestamps keep a later, partially overwritten transaction
//! from masquerading as a committed one.
//!
//! Batches that outgrow the journal cycle internally: commit and apply
//! what fits, reset, retry the rest. Within a batch, repeated writes to
//! one block collapse to the latest contents, one data record per block.
//!
//! Recovery reads records from offset zero, accumulating data records
//! per start-header timestamp and keeping them only when the matching
//! commit appears; the committed prefix is applied even when a torn or
//! mismatched record ends the scan early.

use core::mem;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::{Buf, BufCache};
use crate::device::BlockDevice;
use crate::param::{BSIZE, JHDR_SIZE, JOURNAL_PATH, JRECORD_SIZE, PHYS_JOURNAL_SIZE};

use super::inode::InodeInner;
use super::DiskFs;

pub const JRNL_START: u8 = 1;
pub const JRNL_DATA: u8 = 2;
pub const JRNL_COMMIT: u8 = 3;

/// On-disk journal record header. A zeroed header terminates the log.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct JournalHeader {
    pub timestamp: u64,
    pub blocknum: u32,
    pub block_type: u8,
    pad: [u8; 19],
}

const_assert_eq!(mem::size_of::<JournalHeader>(), JHDR_SIZE);

impl JournalHeader {
    fn new(timestamp: u64, blocknum: u32, block_type: u8) -> Self {
        Self {
            timestamp,
            blocknum,
            block_type,
            pad: [0; 19],
        }
    }

    fn is_end(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }
}

pub struct TransactionDiskBlock {
    pub bno: u32,
    pub data: Box<[u8; BSIZE]>,
}

/// A set of block updates committed atomically, plus the allocator
/// traffic the updates imply.
pub struct Transaction {
    pub timestamp: u64,
    blocks: Vec<TransactionDiskBlock>,

    /// Blocks allocated under this transaction; their bitmap bits are set
    /// on disk during pre-processing.
    allocated: Vec<u32>,

    /// Blocks freed under this transaction; bitmap bits cleared during
    /// pre-processing, freelist return deferred to post-processing.
    freed: Vec<u32>,
}

impl Transaction {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            blocks: Vec::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
        }
    }

    /// Append a block update. May duplicate an earlier block number;
    /// deduplication collapses those at commit time.
    pub fn add_block(&mut self, bno: u32, data: &[u8]) {
        assert_eq!(data.len(), BSIZE);
        let mut copy = Box::new([0u8; BSIZE]);
        copy.copy_from_slice(data);
        self.blocks.push(TransactionDiskBlock { bno, data: copy });
    }

    /// Append a block update, replacing the contents of an existing entry
    /// for the same block. Later writes win.
    pub fn add_unique_block(&mut self, bno: u32, data: &[u8]) {
        assert_eq!(data.len(), BSIZE);
        if let Some(b) = self.blocks.iter_mut().find(|b| b.bno == bno) {
            b.data.copy_from_slice(data);
        } else {
            self.add_block(bno, data);
        }
    }

    pub fn add_allocated_block(&mut self, bno: u32) {
        self.allocated.push(bno);
    }

    pub fn add_free_block(&mut self, bno: u32) {
        self.freed.push(bno);
    }

    pub fn blocks(&self) -> &[TransactionDiskBlock] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub(super) fn allocated_mut(&mut self) -> &mut Vec<u32> {
        &mut self.allocated
    }

    pub(super) fn freed_mut(&mut self) -> &mut Vec<u32> {
        &mut self.freed
    }

    pub(super) fn freed(&self) -> &[u32] {
        &self.freed
    }

    fn take_blocks(&mut self) -> Vec<TransactionDiskBlock> {
        mem::take(&mut self.blocks)
    }

    pub fn add_blocks(&mut self, blocks: Vec<TransactionDiskBlock>) {
        self.blocks.extend(blocks);
    }

    /// Collapse repeated block numbers to a single entry holding the
    /// latest contents, keeping first-appearance order.
    pub fn deduplicate_blocks(&mut self) {
        let mut i = 0;
        while i < self.blocks.len() {
            let bno = self.blocks[i].bno;
            let mut j = i + 1;
            while j < self.blocks.len() {
                if self.blocks[j].bno == bno {
                    let later = self.blocks.remove(j);
                    self.blocks[i].data = later.data;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    /// Take write locks on the underlying buffers of every block in this
    /// transaction. The locks live in `lockset`, which the flush releases
    /// once the batch is applied; a block shared with an earlier
    /// transaction in the same batch is locked once.
    pub(super) fn prepare_for_commit(&self, bcache: &BufCache, lockset: &mut BufLockSet) {
        for b in &self.blocks {
            lockset.pin(bcache.get(b.bno, false));
        }
    }

    /// Write every staged block to its home location.
    pub(super) fn write_to_disk(&self, dev: &Arc<dyn BlockDevice>) {
        for b in &self.blocks {
            dev.write_block(b.bno, &b.data[..]);
        }
    }

    /// Recovery-side apply: home locations plus any cached copies.
    fn write_to_disk_update_bufcache(&self, bcache: &BufCache) {
        for b in &self.blocks {
            bcache.device().write_block(b.bno, &b.data[..]);
            bcache.update_cached(b.bno, &b.data[..]);
        }
    }
}

/// Write locks pinned for the duration of a flush batch.
pub(super) struct BufLockSet {
    pinned: Vec<Arc<Buf>>,
}

impl BufLockSet {
    pub(super) fn new() -> Self {
        Self { pinned: Vec::new() }
    }

    fn pin(&mut self, buf: Arc<Buf>) {
        if self.pinned.iter().any(|p| p.bno() == buf.bno()) {
            return;
        }
        buf.pin_write();
        self.pinned.push(buf);
    }

    fn release_all(&mut self) {
        for buf in self.pinned.drain(..) {
            buf.unpin_write();
        }
    }
}

impl Drop for BufLockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

pub struct JournalInner {
    /// Transactions accepted since the last flush, in arrival order.
    pub transaction_log: Vec<Transaction>,

    /// Byte offset of the next record slot in the journal file.
    offset: usize,
}

/// The physical journal. Single writer: everything that appends to or
/// flushes the journal runs under `prepare_for_commit`.
pub struct Journal {
    inner: Mutex<JournalInner>,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JournalInner {
                transaction_log: Vec::new(),
                offset: 0,
            }),
        }
    }

    pub fn prepare_for_commit(&self) -> MutexGuard<'_, JournalInner> {
        self.inner.lock()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskFs {
    /// Queue a transaction for the next flush. Caller holds the journal
    /// lock.
    pub fn add_to_journal_locked(&self, jr: &mut JournalInner, tr: Transaction) {
        jr.transaction_log.push(tr);
    }

    /// Update the on-disk free bitmap for the allocator traffic of `tr`.
    fn pre_process_transaction(&self, tr: &mut Transaction) {
        let mut allocated = mem::take(tr.allocated_mut());
        if !allocated.is_empty() {
            self.balloc_free_on_disk(&mut allocated, tr, true);
        }
        let mut freed = mem::take(tr.freed_mut());
        if !freed.is_empty() {
            self.balloc_free_on_disk(&mut freed, tr, false);
        }
        *tr.freed_mut() = freed;
    }

    /// Now that `tr` is durable, its freed blocks become reusable.
    fn post_process_transaction(&self, tr: &Transaction) {
        for bno in tr.freed() {
            self.balloc_table().free_block(*bno);
        }
    }

    /// Would `nblocks` data records plus a commit record still fit?
    fn fits_in_journal(&self, jr: &JournalInner, nblocks: usize) -> bool {
        jr.offset + (nblocks + 1) * JRECORD_SIZE <= PHYS_JOURNAL_SIZE
    }

    /// Write one `header | payload` record pair into the journal file,
    /// staging the file's blocks into `jtrans`.
    fn write_journal_hdrblock(
        &self,
        jin: &mut InodeInner,
        jr: &mut JournalInner,
        hdr: &JournalHeader,
        payload: &[u8],
        jtrans: &mut Transaction,
    ) {
        let off = jr.offset;
        let n = self
            .writei(jin, hdr.as_bytes(), off as u32, Some(&mut *jtrans), false)
            .expect("journal write (header) failed");
        assert_eq!(n, JHDR_SIZE, "journal write (header) failed");

        let n = self
            .writei(jin, payload, (off + JHDR_SIZE) as u32, Some(&mut *jtrans), false)
            .expect("journal write (data block) failed");
        assert_eq!(n, BSIZE, "journal write (data block) failed");

        jr.offset = off + JRECORD_SIZE;
    }

    fn write_journal_header(
        &self,
        jin: &mut InodeInner,
        jr: &mut JournalInner,
        jtrans: &mut Transaction,
        block_type: u8,
        timestamp: u64,
    ) {
        let hdr = JournalHeader::new(timestamp, 0, block_type);
        self.write_journal_hdrblock(jin, jr, &hdr, &[0u8; BSIZE], jtrans);
    }

    /// Write a transaction's disk blocks into the journal file, one data
    /// record each.
    fn write_journal_transaction_blocks(
        &self,
        jin: &mut InodeInner,
        jr: &mut JournalInner,
        jtrans: &mut Transaction,
        blocks: &[TransactionDiskBlock],
        timestamp: u64,
    ) {
        for b in blocks {
            let hdr = JournalHeader::new(timestamp, b.bno, JRNL_DATA);
            self.write_journal_hdrblock(jin, jr, &hdr, &b.data[..], jtrans);
        }
    }

    /// Make the journal records durable, then commit. After this returns
    /// the container transaction is on stable storage.
    fn write_journal_trans_epilog(
        &self,
        jin: &mut InodeInner,
        jr: &mut JournalInner,
        jtrans: Transaction,
        timestamp: u64,
    ) {
        // Start and data records first.
        jtrans.write_to_disk(self.dev());

        // The commit record is the real commit point.
        let mut commit = Transaction::new(0);
        self.write_journal_header(jin, jr, &mut commit, JRNL_COMMIT, timestamp);
        commit.write_to_disk(self.dev());
        self.dev().flush();
    }

    /// Zero the first header slot and rewind. A zeroed header keeps a
    /// reboot from replaying anything that follows; stale records behind
    /// it are fenced off by their timestamps once the slot is overwritten
    /// by a later transaction.
    pub(super) fn reset_journal(&self, jin: &mut InodeInner, jr: &mut JournalInner) {
        let mut tr = Transaction::new(0);
        let n = self
            .writei(jin, &[0u8; JHDR_SIZE], 0, Some(&mut tr), false)
            .expect("reset_journal failed");
        assert_eq!(n, JHDR_SIZE, "reset_journal failed");
        tr.write_to_disk(self.dev());
        self.dev().flush();
        jr.offset = 0;
    }

    /// Write the queued transactions out as one (or more) container
    /// transactions and apply them to their home locations. Caller holds
    /// the journal lock.
    pub fn flush_journal_locked(&self, jr: &mut JournalInner) {
        if jr.transaction_log.is_empty() {
            return;
        }
        let mut log = mem::take(&mut jr.transaction_log);

        // Bitmap updates first: a batch may pin a bitmap buffer, and the
        // pin is not reentrant, so no transaction may touch buffers after
        // any pinning has begun.
        for tr in &mut log {
            self.pre_process_transaction(tr);
        }

        let ji = Arc::clone(self.journal_inode());
        let mut jin = ji.inner.write();
        let mut lockset = BufLockSet::new();

        let mut prolog_ts = log[0].timestamp;
        let mut jtrans = Transaction::new(0);
        self.write_journal_header(&mut jin, jr, &mut jtrans, JRNL_START, prolog_ts);

        let mut prune = Transaction::new(0);
        let mut processed: Vec<Transaction> = Vec::new();

        for mut t in log {
            t.prepare_for_commit(&self.bcache, &mut lockset);

            while !self.fits_in_journal(jr, prune.block_count() + t.block_count()) {
                assert!(
                    !processed.is_empty() || prune.block_count() > 0,
                    "transaction too big for the journal"
                );
                debug!("journal: batch full, cycling (offset {})", jr.offset);

                // Commit and apply everything staged so far, then retry
                // this transaction against an empty journal. Every record
                // of a container carries the container's timestamp, or
                // recovery would reject the batch as torn.
                prune.deduplicate_blocks();
                self.write_journal_transaction_blocks(
                    &mut jin,
                    jr,
                    &mut jtrans,
                    prune.blocks(),
                    prolog_ts,
                );
                self.write_journal_trans_epilog(&mut jin, jr, jtrans, prolog_ts);

                for p in processed.drain(..) {
                    self.post_process_transaction(&p);
                }
                prune.write_to_disk(self.dev());
                self.dev().flush();
                lockset.release_all();
                self.reset_journal(&mut jin, jr);

                prune = Transaction::new(0);
                jtrans = Transaction::new(0);
                prolog_ts = t.timestamp;
                self.write_journal_header(&mut jin, jr, &mut jtrans, JRNL_START, prolog_ts);
                t.prepare_for_commit(&self.bcache, &mut lockset);
            }

            prune.add_blocks(t.take_blocks());
            processed.push(t);
        }

        prune.deduplicate_blocks();
        self.write_journal_transaction_blocks(&mut jin, jr, &mut jtrans, prune.blocks(), prolog_ts);
        self.write_journal_trans_epilog(&mut jin, jr, jtrans, prolog_ts);

        for p in processed.drain(..) {
            self.post_process_transaction(&p);
        }
        prune.write_to_disk(self.dev());
        self.dev().flush();
        lockset.release_all();
        self.reset_journal(&mut jin, jr);
    }

    /// Replay the journal after a reboot, applying every committed
    /// transaction found before the end sentinel or the first bad record.
    pub(super) fn process_journal(&self) {
        let ji = self
            .namei(JOURNAL_PATH)
            .expect("process_journal: journal file missing");
        self.journal_inode.call_once(|| Arc::clone(&ji));

        let mut jin = ji.inner.write();
        let mut offset = 0u32;
        let mut current_ts = 0u64;
        let mut block_vec: Vec<TransactionDiskBlock> = Vec::new();
        let mut apply = Transaction::new(0);
        let mut hdr_buf = [0u8; JHDR_SIZE];
        let mut data_buf = vec![0u8; BSIZE];

        info!("journal: checking for committed transactions");
        loop {
            match self.readi(&jin, &mut hdr_buf, offset) {
                Ok(n) if n == JHDR_SIZE => {}
                _ => break,
            }
            let hdr = JournalHeader::read_from(&hdr_buf[..]).unwrap();
            if hdr.is_end() {
                break;
            }
            offset += JHDR_SIZE as u32;

            match self.readi(&jin, &mut data_buf, offset) {
                Ok(n) if n == BSIZE => {}
                _ => break,
            }
            offset += BSIZE as u32;

            match hdr.block_type {
                JRNL_START => {
                    current_ts = hdr.timestamp;
                    block_vec.clear();
                }
                JRNL_DATA => {
                    if hdr.timestamp != current_ts {
                        warn!("journal: data record timestamp mismatch, stopping recovery");
                        break;
                    }
                    let mut data = Box::new([0u8; BSIZE]);
                    data.copy_from_slice(&data_buf);
                    block_vec.push(TransactionDiskBlock {
                        bno: hdr.blocknum,
                        data,
                    });
                }
                JRNL_COMMIT => {
                    if hdr.timestamp != current_ts {
                        warn!("journal: commit record timestamp mismatch, stopping recovery");
                        break;
                    }
                    apply.add_blocks(mem::take(&mut block_vec));
                }
                _ => {
                    warn!("journal: unknown record type {}, stopping recovery", hdr.block_type);
                    break;
                }
            }
        }

        let mut jguard = self.journal.prepare_for_commit();
        self.reset_journal(&mut jin, &mut jguard);
        drop(jguard);

        if apply.block_count() > 0 {
            info!("journal: recovering {} committed blocks", apply.block_count());
            apply.write_to_disk_update_bufcache(&self.bcache);
            self.dev().flush();
        } else {
            info!("journal: nothing to recover");
        }
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeroes;

    use super::*;

    #[test]
    fn dedup_keeps_latest_content_in_first_position() {
        let mut tr = Transaction::new(1);
        tr.add_block(3, &[1u8; BSIZE]);
        tr.add_block(5, &[2u8; BSIZE]);
        tr.add_block(3, &[9u8; BSIZE]);
        tr.deduplicate_blocks();

        assert_eq!(tr.block_count(), 2);
        assert_eq!(tr.blocks()[0].bno, 3);
        assert_eq!(tr.blocks()[0].data[0], 9);
        assert_eq!(tr.blocks()[1].bno, 5);
    }

    #[test]
    fn unique_block_replaces_in_place() {
        let mut tr = Transaction::new(1);
        tr.add_unique_block(4, &[1u8; BSIZE]);
        tr.add_unique_block(4, &[7u8; BSIZE]);
        assert_eq!(tr.block_count(), 1);
        assert_eq!(tr.blocks()[0].data[0], 7);
    }

    #[test]
    fn zero_header_is_end_sentinel() {
        let zero = JournalHeader::new_zeroed();
        assert!(zero.is_end());
        assert!(!JournalHeader::new(1, 0, JRNL_START).is_end());
    }
}
