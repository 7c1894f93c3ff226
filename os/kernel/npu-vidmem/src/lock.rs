//! FIFO ticket lock guarding heap and backend bookkeeping.
//!
//! Allocation paths run on whatever thread submits NPU work, so the lock
//! hands out tickets to keep a burst of small allocations from starving a
//! large one. Waiters spin; critical sections here are short list walks and
//! never call back into the OS.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub struct TicketLock<T> {
    next: AtomicUsize,
    owner: AtomicUsize,
    /// Number of acquisitions that had to wait for another holder.
    contended: AtomicU64,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for TicketLock<T> {}
unsafe impl<T: Send> Send for TicketLock<T> {}

impl<T: Default> Default for TicketLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> TicketLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            next: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            contended: AtomicU64::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Take a ticket and spin until it is served.
    #[inline]
    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        if self.owner.load(Ordering::Acquire) != ticket {
            self.contended.fetch_add(1, Ordering::Relaxed);
            while self.owner.load(Ordering::Acquire) != ticket {
                spin_loop();
            }
        }
        TicketLockGuard { lock: self }
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        let owner = self.owner.load(Ordering::Relaxed);
        let next = self.next.load(Ordering::Relaxed);
        if next != owner {
            return None;
        }
        let taken = next.wrapping_add(1);
        self.next
            .compare_exchange(next, taken, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TicketLockGuard { lock: self })
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// How many acquisitions found the lock held.
    #[inline]
    #[must_use]
    pub fn contentions(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    #[inline]
    fn unlock(&self) {
        let served = self.owner.load(Ordering::Relaxed);
        self.owner.store(served.wrapping_add(1), Ordering::Release);
    }
}

pub struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> Deref for TicketLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::{panic, thread};

    #[test]
    fn guard_releases_on_drop() {
        let l = TicketLock::new(0_u32);
        {
            let mut g = l.lock();
            *g = 41;
        }
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let l = TicketLock::new(1_u8);
        let g1 = l.try_lock();
        assert!(g1.is_some());
        assert!(l.try_lock().is_none());
        drop(g1);
        assert!(l.try_lock().is_some());
    }

    #[test]
    fn get_mut_bypasses_the_lock() {
        let mut l = TicketLock::new(vec![1, 2, 3]);
        l.get_mut().push(4);
        assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
        assert_eq!(l.contentions(), 0);
    }

    #[test]
    fn contended_increments_are_exact() {
        let threads = 8;
        let iters = 2_000;

        let lock = Arc::new(TicketLock::new(0_usize));
        let in_cs = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let in_cs = Arc::clone(&in_cs);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..iters {
                        lock.with_lock(|v| {
                            let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(prev, 0, "mutual exclusion violated");
                            *v += 1;
                            in_cs.fetch_sub(1, Ordering::SeqCst);
                        });
                        thread::yield_now();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(lock.with_lock(|v| *v), threads * iters);
    }

    #[test]
    fn lock_is_released_on_panic() {
        let l = TicketLock::new(0_u32);
        let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            l.with_lock(|v| {
                *v = 123;
                panic!("boom");
            });
        }));
        assert!(res.is_err());
        assert_eq!(l.with_lock(|v| *v), 123);
    }
}
