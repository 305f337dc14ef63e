use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

const WRITER_LOCK: u32 = u32::MAX;
const UNLOCKED: u32 = 0;
const SPINS_BEFORE_YIELD: u32 = 1024;

/// A spin lock supporting multiple readers and a single writer.
///
/// Optimized for infrequent writes and frequent reads: the process-wide
/// type and block registries take the write path only at registration time
/// and the read path on every runtime lookup.
#[derive(Debug)]
pub struct SpinLockRW<T> {
    state: AtomicU32,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLockRW<T> {}
unsafe impl<T: Send + Sync> Sync for SpinLockRW<T> {}

impl<T> SpinLockRW<T> {
    pub const fn new(value: T) -> SpinLockRW<T> {
        SpinLockRW {
            state: AtomicU32::new(UNLOCKED),
            value: UnsafeCell::new(value),
        }
    }

    fn try_lock_shared(&self) -> bool {
        let expected = self.state.load(Ordering::Acquire);
        expected != WRITER_LOCK
            && self
                .state
                .compare_exchange_weak(
                    expected,
                    expected + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    pub fn read(&self) -> SharedGuard<'_, T> {
        let mut count = 0u32;
        while !self.try_lock_shared() {
            count += 1;
            if count > SPINS_BEFORE_YIELD {
                thread::yield_now();
            }
        }
        SharedGuard { lock: self }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange_weak(UNLOCKED, WRITER_LOCK, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut count = 0u32;
        while !self.try_lock_exclusive() {
            count += 1;
            if count > SPINS_BEFORE_YIELD {
                thread::yield_now();
            }
        }
        WriteGuard { lock: self }
    }
}

/// Shared (reader) access to a [`SpinLockRW`].
#[derive(Debug)]
pub struct SharedGuard<'a, T> {
    lock: &'a SpinLockRW<T>,
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive (writer) access to a [`SpinLockRW`].
#[derive(Debug)]
pub struct WriteGuard<'a, T> {
    lock: &'a SpinLockRW<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}
