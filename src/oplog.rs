//! Per-object logical operation log.
//!
//! Each mnode owns one of these. Appends go to the caller's per-core
//! buffer with nothing but that buffer's spinlock, so metadata mutations
//! on different cores never contend. The ordering glue is the timestamp:
//! every operation carries a globally unique monotonic timestamp taken
//! inside a `begin`/`end` bracket.
//!
//! `synchronize_upto_tsc(T)` merges everything with timestamp <= T out of
//! the per-core buffers into the single ordered vector, first waiting out
//! any bracketed operation that reserved a timestamp <= T but has not
//! appended yet. The returned guard holds the merged vector locked until
//! released; appends with later timestamps proceed underneath it.

use std::thread;

use array_macro::array;
use parking_lot::{Mutex, MutexGuard};
use spin::Mutex as SpinMutex;

use crate::mfs::op::Operation;
use crate::param::NCPU;

struct CoreBuffer {
    ops: Vec<Operation>,

    /// Timestamp reserved by a `begin` bracket that has not ended yet.
    start_tsc: Option<u64>,
}

pub struct MfsLogicalLog {
    /// Serializes resolvers draining this log. Held around
    /// `process_ops_from_oplog`, and pairwise (in mnum order) while a
    /// rename pair is applied.
    pub lock: Mutex<()>,

    percore: [SpinMutex<CoreBuffer>; NCPU],

    /// Operations already merged in timestamp order, not yet consumed by
    /// the resolver. Doubles as the synchronization lock.
    merged: Mutex<Vec<Operation>>,
}

impl MfsLogicalLog {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            percore: array![_ => SpinMutex::new(CoreBuffer { ops: Vec::new(), start_tsc: None }); NCPU],
            merged: Mutex::new(Vec::new()),
        }
    }

    /// Open a bracket: the caller has reserved timestamp `tsc` and will
    /// append an operation carrying it (or a later one) on this core.
    pub fn op_start(&self, cpu: usize, tsc: u64) {
        let mut buf = self.percore[cpu].lock();
        debug_assert!(buf.start_tsc.is_none(), "op_start: bracket already open");
        buf.start_tsc = Some(tsc);
    }

    /// Close the bracket opened by `op_start`.
    pub fn op_end(&self, cpu: usize) {
        let mut buf = self.percore[cpu].lock();
        debug_assert!(buf.start_tsc.is_some(), "op_end: no bracket open");
        buf.start_tsc = None;
    }

    /// Append an operation to this core's buffer.
    pub fn append(&self, cpu: usize, op: Operation) {
        let mut buf = self.percore[cpu].lock();
        if let Some(last) = buf.ops.last() {
            debug_assert!(last.timestamp() <= op.timestamp(), "append: timestamp went backwards");
        }
        buf.ops.push(op);
    }

    /// Merge every operation with timestamp <= `tsc` into the ordered
    /// vector and return it, locked. Waits for open brackets at or below
    /// `tsc` so no straggler can append behind the merge point.
    pub fn synchronize_upto_tsc(&self, tsc: u64) -> MutexGuard<'_, Vec<Operation>> {
        let mut merged = self.merged.lock();

        let mut gathered: Vec<Operation> = Vec::new();
        for core in &self.percore {
            loop {
                let mut buf = core.lock();
                match buf.start_tsc {
                    Some(start) if start <= tsc => {
                        // An operation at or below the merge point is
                        // mid-append on this core; let it finish.
                        drop(buf);
                        thread::yield_now();
                    }
                    _ => {
                        let split = buf.ops.partition_point(|op| op.timestamp() <= tsc);
                        gathered.extend(buf.ops.drain(..split));
                        break;
                    }
                }
            }
        }

        gathered.sort_by_key(Operation::timestamp);
        debug_assert!(merged.last().map_or(true, |last| {
            gathered.first().map_or(true, |first| last.timestamp() <= first.timestamp())
        }));
        merged.extend(gathered);
        merged
    }
}

impl Default for MfsLogicalLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mfs::op::Operation;
    use crate::mfs::MnodeType;

    fn op(ts: u64) -> Operation {
        Operation::Create {
            mnum: ts,
            parent: 1,
            typ: MnodeType::File,
            timestamp: ts,
        }
    }

    #[test]
    fn synchronize_merges_across_cores_in_timestamp_order() {
        let log = MfsLogicalLog::new();
        log.append(0, op(2));
        log.append(1, op(1));
        log.append(0, op(5));
        log.append(2, op(3));

        let ops = log.synchronize_upto_tsc(3);
        let ts: Vec<u64> = ops.iter().map(Operation::timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3]);
        drop(ops);

        // The later op is still there for a later merge point.
        let ops = log.synchronize_upto_tsc(10);
        let ts: Vec<u64> = ops.iter().map(Operation::timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3, 5]);
    }

    #[test]
    fn synchronize_waits_for_open_bracket() {
        use std::sync::Arc;
        use std::time::Duration;

        let log = Arc::new(MfsLogicalLog::new());
        log.op_start(0, 4);

        let l2 = Arc::clone(&log);
        let t = std::thread::spawn(move || {
            let ops = l2.synchronize_upto_tsc(6);
            ops.iter().map(Operation::timestamp).collect::<Vec<_>>()
        });

        // The merge must not complete while the bracket is open.
        std::thread::sleep(Duration::from_millis(30));
        log.append(0, op(4));
        log.op_end(0);

        assert_eq!(t.join().unwrap(), vec![4]);
    }
}
