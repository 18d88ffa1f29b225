// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Spinlocks sized for in-chunk embedding.
//!
//! Both locks occupy exactly 8 bytes, are valid in the all-zero (unlocked)
//! state, and spin with `spin_loop` hints only. There is no parking, no
//! yielding, and no poisoning: these locks sit on the packet-processing
//! hot path and their critical sections are a handful of cache lines.

use std::{
    cell::UnsafeCell,
    hint,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

/// Non-recursive test-and-test-and-set spinlock.
///
/// Re-locking from the holding thread deadlocks; chunk code that may
/// re-enter uses [`ReentrantSpinlock`] instead.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Spinlock {
    state: AtomicU32,
    _pad: u32,
}

impl Spinlock {
    pub fn lock(&self) {
        loop {
            if self
                .state
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            while self.state.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
        }
    }

    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}

/// Recursive spinlock keyed by a per-thread token.
///
/// A thread that already holds the lock may lock it again; each `lock`
/// must be paired with an `unlock`. This is what lets an iteration
/// callback invoke another operation against the chunk it is visiting.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ReentrantSpinlock {
    owner: AtomicU32,
    // written only while `owner` equals the current thread's token
    depth: UnsafeCell<u32>,
}

impl ReentrantSpinlock {
    pub fn lock(&self) {
        let token = thread_token();

        if self.owner.load(Ordering::Relaxed) == token {
            unsafe { *self.depth.get() += 1 };
            return;
        }

        loop {
            if self
                .owner
                .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            while self.owner.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
        }
    }

    pub fn unlock(&self) {
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), thread_token());

        let depth = unsafe { &mut *self.depth.get() };

        if *depth > 0 {
            *depth -= 1;
        } else {
            self.owner.store(0, Ordering::Release);
        }
    }
}

unsafe impl Send for ReentrantSpinlock {}
unsafe impl Sync for ReentrantSpinlock {}

fn thread_token() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);

    thread_local! {
        static TOKEN: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }

    TOKEN.with(|t| *t)
}

/// Implemented by both spinlock flavors so a single guard type serves the
/// locked table variants. Not intended for use outside of guards.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
}

impl RawLock for Spinlock {
    fn acquire(&self) {
        self.lock();
    }

    fn release(&self) {
        self.unlock();
    }
}

impl RawLock for ReentrantSpinlock {
    fn acquire(&self) {
        self.lock();
    }

    fn release(&self) {
        self.unlock();
    }
}

/// Scoped lock release for internal critical sections. Keeps chunk locks
/// balanced even when a visitor callback panics.
pub(crate) struct LockGuard<'a, L: RawLock> {
    lock: &'a L,
}

impl<'a, L: RawLock> LockGuard<'a, L> {
    pub(crate) fn acquire(lock: &'a L) -> Self {
        lock.acquire();

        Self { lock }
    }
}

impl<L: RawLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A value reference bundled with the chunk lock that protects it.
///
/// Returned by `lookup` on the locked table variants. The value is only
/// reachable through the guard, and the lock is released when the guard is
/// dropped, on every exit path. The guard is neither `Send` nor `Sync`:
/// the value pointer is valid only on the thread that took the lock.
pub struct ValueGuard<'a, V, L: RawLock> {
    value: NonNull<V>,
    lock: &'a L,
    _not_send: PhantomData<*mut V>,
}

impl<'a, V, L: RawLock> ValueGuard<'a, V, L> {
    /// The lock must be held by the current thread and `value` must point
    /// into the chunk that lock protects.
    pub(crate) fn new(value: NonNull<V>, lock: &'a L) -> Self {
        Self {
            value,
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<V, L: RawLock> Deref for ValueGuard<'_, V, L> {
    type Target = V;

    fn deref(&self) -> &V {
        unsafe { self.value.as_ref() }
    }
}

impl<V, L: RawLock> DerefMut for ValueGuard<'_, V, L> {
    fn deref_mut(&mut self) -> &mut V {
        unsafe { self.value.as_mut() }
    }
}

impl<V, L: RawLock> Drop for ValueGuard<'_, V, L> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{mem, sync::Arc, thread};

    #[test]
    fn locks_are_eight_bytes_and_zero_is_unlocked() {
        assert_eq!(mem::size_of::<Spinlock>(), 8);
        assert_eq!(mem::size_of::<ReentrantSpinlock>(), 8);

        let lock: Spinlock = unsafe { mem::zeroed() };
        lock.lock();
        lock.unlock();

        let lock: ReentrantSpinlock = unsafe { mem::zeroed() };
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn reentrant_lock_nests() {
        let lock = ReentrantSpinlock::default();

        lock.lock();
        lock.lock();
        lock.unlock();

        // still held; another thread must not get in
        let lock = Arc::new(lock);
        let contender = {
            let lock = lock.clone();

            thread::spawn(move || {
                lock.lock();
                lock.unlock();
            })
        };

        lock.unlock();
        contender.join().unwrap();
    }

    #[test]
    fn spinlock_excludes() {
        const NUM_THREADS: usize = 8;
        const ITERS: usize = 10_000;

        struct Shared {
            lock: Spinlock,
            counter: UnsafeCell<usize>,
        }

        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: Spinlock::default(),
            counter: UnsafeCell::new(0),
        });

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let shared = shared.clone();

                thread::spawn(move || {
                    for _ in 0..ITERS {
                        shared.lock.lock();
                        unsafe { *shared.counter.get() += 1 };
                        shared.lock.unlock();
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, NUM_THREADS * ITERS);
    }
}
