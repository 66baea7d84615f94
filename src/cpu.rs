//! Core-slot identifiers.
//!
//! Threads stand in for cores: each thread is assigned a slot in
//! `0..NCPU` the first time it asks, round-robin. Slot ids index the
//! per-core oplog buffers and the inode-allocation hints; two threads
//! sharing a slot is correct, merely less scalable.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::param::NCPU;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed) % NCPU;
}

/// The calling thread's core slot.
pub fn id() -> usize {
    SLOT.with(|s| *s)
}
