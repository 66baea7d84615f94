//! Sleeping locks.
//!
//! `RwSleepLock` is a condvar-backed read/write lock that is meant to be
//! held across disk I/O: writers wait for `!busy && readbusy == 0`,
//! readers wait for `!busy`, and every release wakes all sleepers.
//! Inodes and buffers use it so a lock holder can sleep in the device
//! driver without spinning out every other core.
//!
//! The raw `acquire_write`/`release_write` pair exists for the journal,
//! which pins buffer write locks inside a transaction until the commit is
//! durable; guards cannot express a lock whose lifetime is decided by
//! on-disk state.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

pub struct RwSleepLock<T> {
    state: Mutex<LockState>,
    cv: Condvar,
    data: UnsafeCell<T>,
}

struct LockState {
    /// A writer holds the lock.
    busy: bool,
    /// Number of readers holding the lock.
    readbusy: u32,
}

unsafe impl<T: Send> Sync for RwSleepLock<T> {}
unsafe impl<T: Send> Send for RwSleepLock<T> {}

pub struct RwSleepReadGuard<'s, T> {
    lock: &'s RwSleepLock<T>,
}

pub struct RwSleepWriteGuard<'s, T> {
    lock: &'s RwSleepLock<T>,
}

impl<T> RwSleepLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState {
                busy: false,
                readbusy: 0,
            }),
            cv: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> RwSleepReadGuard<'_, T> {
        let mut state = self.state.lock();
        while state.busy {
            self.cv.wait(&mut state);
        }
        state.readbusy += 1;
        RwSleepReadGuard { lock: self }
    }

    pub fn write(&self) -> RwSleepWriteGuard<'_, T> {
        self.acquire_write();
        RwSleepWriteGuard { lock: self }
    }

    /// Acquire the write side without a guard. The caller owns the lock
    /// until `release_write`.
    pub fn acquire_write(&self) {
        let mut state = self.state.lock();
        while state.busy || state.readbusy > 0 {
            self.cv.wait(&mut state);
        }
        state.busy = true;
    }

    /// Release a write acquisition made with `acquire_write`.
    pub fn release_write(&self) {
        let mut state = self.state.lock();
        assert!(state.busy, "release_write: not write-held");
        state.busy = false;
        drop(state);
        self.cv.notify_all();
    }

    /// Access the data through exclusive ownership, skipping the lock.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Drop for RwSleepReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.readbusy -= 1;
        drop(state);
        self.lock.cv.notify_all();
    }
}

impl<T> Drop for RwSleepWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

impl<T> Deref for RwSleepReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for RwSleepWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwSleepWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_share_writers_exclude() {
        let lock = Arc::new(RwSleepLock::new(0u32));

        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1, *r2);
        drop((r1, r2));

        let mut w = lock.write();
        *w = 7;
        drop(w);
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn raw_write_blocks_guarded_readers() {
        let lock = Arc::new(RwSleepLock::new(0u32));
        lock.acquire_write();

        let l2 = Arc::clone(&lock);
        let t = thread::spawn(move || *l2.read());
        thread::sleep(std::time::Duration::from_millis(20));
        unsafe { *lock.data.get() = 3 };
        lock.release_write();
        assert_eq!(t.join().unwrap(), 3);
    }
}
