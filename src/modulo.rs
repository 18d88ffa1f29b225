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

//! Modulo-addressed hash table with per-chunk locking and no chaining.
//!
//! A key hashes to exactly one chunk and probes only within it; when the
//! chunk's slots are exhausted the insert fails with `Full`. Each chunk
//! is one or a few cache lines guarded by a non-recursive spinlock, so
//! unrelated keys contend only when they share a chunk.
//!
//! Inserting an existing key replaces its value; strict duplicate
//! detection is the chained tables' job; this table is the
//! general-purpose flow-state store where last-writer-wins is the wanted
//! behavior.
//!
//! The statically provisioned flavor lives here; [`dynamic`] hosts the
//! flavor that runs over caller-owned memory (shared or huge-page
//! regions) behind an [`Updater`](dynamic::Updater).

pub mod dynamic;

use crate::{
    common::{
        boxed_zeroed_slice,
        hash::{default_hash_builder, hash_u32, DefaultHashBuilder},
        lock::{LockGuard, Spinlock, ValueGuard},
        stats::{Counters, Stats},
    },
    error::InsertError,
    Visit,
};

use std::{
    cell::UnsafeCell,
    hash::{BuildHasher, Hash},
    mem::MaybeUninit,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use log::debug;

#[repr(C)]
#[derive(Clone, Copy)]
struct Pair<K, V> {
    key: K,
    value: V,
}

/// One bucket of the modulo tables: a spinlock, the validity mask, a
/// generation word (bumped on every mutation, read by incremental stats
/// sweeps), and the pair slots. Cache-line aligned; all-zero is empty.
#[repr(C, align(64))]
pub(crate) struct Chunk<K, V, const P: usize> {
    lock: Spinlock,
    valid_mask: AtomicU32,
    generation: AtomicU32,
    pairs: UnsafeCell<[MaybeUninit<Pair<K, V>>; P]>,
}

impl<K: Copy + Eq, V: Copy, const P: usize> Chunk<K, V, P> {
    fn bump_generation(&self) {
        let generation = self.generation.load(Ordering::Relaxed);
        self.generation
            .store(generation.wrapping_add(1), Ordering::Release);
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    fn occupancy(&self) -> u32 {
        self.valid_mask.load(Ordering::Relaxed).count_ones()
    }

    /// # Safety
    ///
    /// The chunk lock must be held.
    unsafe fn find(&self, key: &K) -> Option<usize> {
        let mut mask = self.valid_mask.load(Ordering::Acquire);

        while mask != 0 {
            let slot = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            if (*self.pairs.get())[slot].assume_init().key == *key {
                return Some(slot);
            }
        }

        None
    }

    /// # Safety
    ///
    /// The chunk lock must be held; the pointer is valid while it is.
    unsafe fn value_ptr(&self, slot: usize) -> *mut V {
        let pair = (self.pairs.get() as *mut MaybeUninit<Pair<K, V>>).add(slot);

        std::ptr::addr_of_mut!((*(pair as *mut Pair<K, V>)).value)
    }

    /// # Safety
    ///
    /// The chunk lock must be held.
    unsafe fn key(&self, slot: usize) -> K {
        (*self.pairs.get())[slot].assume_init().key
    }

    /// Replace-or-occupy insert. Takes the chunk lock.
    fn insert(&self, key: K, value: V, counters: &Counters) -> Result<(), InsertError> {
        let _guard = LockGuard::acquire(&self.lock);

        if let Some(slot) = unsafe { self.find(&key) } {
            unsafe { *self.value_ptr(slot) = value };
            self.bump_generation();

            return Ok(());
        }

        let mask = self.valid_mask.load(Ordering::Relaxed);
        let slot = (!mask).trailing_zeros() as usize;

        if slot >= P {
            counters.note_insert_failed();

            return Err(InsertError::Full);
        }

        unsafe {
            (*self.pairs.get())[slot] = MaybeUninit::new(Pair { key, value });
        }

        self.valid_mask.store(mask | (1 << slot), Ordering::Release);
        self.bump_generation();

        counters.pair_added();
        counters.note_chain_len(u64::from(mask.count_ones()) + 1);

        Ok(())
    }

    /// Locking lookup: on a hit the lock stays held and the caller must
    /// wrap the pointer in a guard; on a miss the lock is released here.
    fn lookup(&self, key: &K) -> Option<NonNull<V>> {
        self.lock.lock();

        match unsafe { self.find(key) } {
            Some(slot) => Some(unsafe { NonNull::new_unchecked(self.value_ptr(slot)) }),
            None => {
                self.lock.unlock();

                None
            }
        }
    }

    fn remove(&self, key: &K, counters: &Counters) -> bool {
        let _guard = LockGuard::acquire(&self.lock);

        if let Some(slot) = unsafe { self.find(key) } {
            let mask = self.valid_mask.load(Ordering::Relaxed);

            self.valid_mask.store(mask & !(1 << slot), Ordering::Release);
            self.bump_generation();
            counters.pair_removed();

            true
        } else {
            false
        }
    }

    fn clear(&self) {
        let _guard = LockGuard::acquire(&self.lock);

        self.valid_mask.store(0, Ordering::Release);
        // bumped, not zeroed: stats sweeps must notice the wipe
        self.bump_generation();
    }

    fn visit<F: FnMut(&K, &mut V) -> Visit>(&self, f: &mut F, counters: &Counters) {
        let _guard = LockGuard::acquire(&self.lock);

        let mut mask = self.valid_mask.load(Ordering::Acquire);
        let mut removed = false;

        while mask != 0 {
            let slot = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            let key = unsafe { self.key(slot) };
            let value = unsafe { &mut *self.value_ptr(slot) };

            if f(&key, value) == Visit::Remove {
                let current = self.valid_mask.load(Ordering::Relaxed);

                self.valid_mask
                    .store(current & !(1 << slot), Ordering::Release);
                counters.pair_removed();
                removed = true;
            }
        }

        if removed {
            self.bump_generation();
        }
    }

    /// Occupancy recount for incremental stats. Takes the lock so the
    /// returned `(generation, occupancy)` pair is consistent.
    pub(crate) fn recount(&self) -> (u32, u32) {
        let _guard = LockGuard::acquire(&self.lock);

        (self.generation(), self.occupancy())
    }
}

/// Fixed-capacity, chunk-locked hash table without chaining.
///
/// `P` pairs per chunk, at most 32. All operations take `&self` and the
/// table is freely shared across threads. The chunk locks are not
/// recursive: callers must not re-enter the table while holding a
/// [`ValueGuard`] or from inside an [`iterate`](Self::iterate) visitor.
pub struct HashTable<K, V, S = DefaultHashBuilder, const P: usize = 8> {
    chunks: Box<[Chunk<K, V, P>]>,
    counters: Counters,
    build_hasher: S,
}

impl<K: Copy + Eq + Hash, V: Copy, const P: usize> HashTable<K, V, DefaultHashBuilder, P> {
    /// Creates a table of `num_chunks` chunks with the default fixed-seed
    /// hasher.
    pub fn new(num_chunks: usize) -> Self {
        Self::with_hasher(num_chunks, default_hash_builder())
    }
}

impl<K: Copy + Eq + Hash, V: Copy, S: BuildHasher, const P: usize> HashTable<K, V, S, P> {
    /// Creates a table that hashes keys with `build_hasher`.
    pub fn with_hasher(num_chunks: usize, build_hasher: S) -> Self {
        assert!(num_chunks > 0);
        assert!(P >= 1 && P <= 32);

        let chunks = unsafe { boxed_zeroed_slice(num_chunks) };

        debug!("modulo table: {} chunks of {} pairs", num_chunks, P);

        Self {
            chunks,
            counters: Counters::default(),
            build_hasher,
        }
    }

    /// Number of live entries. Approximate while writers are active.
    pub fn len(&self) -> usize {
        self.counters.snapshot().pairs as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.chunks.len() * P
    }

    /// Samples the health counters; `extended_chunks_used` is always 0
    /// and `longest_chain` reports the fullest chunk occupancy observed.
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// The table hash of `key`. Callers that look up before inserting
    /// pass this straight to [`insert`](Self::insert).
    pub fn hash(&self, key: &K) -> u32 {
        hash_u32(&self.build_hasher, key)
    }

    fn chunk_at(&self, hash: u32) -> &Chunk<K, V, P> {
        &self.chunks[hash as usize % self.chunks.len()]
    }

    /// Inserts with a caller-precomputed hash. An existing key has its
    /// value replaced; a full chunk fails with [`InsertError::Full`].
    pub fn insert(&self, hash: u32, key: K, value: V) -> Result<(), InsertError> {
        debug_assert_eq!(hash, self.hash(&key));

        self.chunk_at(hash).insert(key, value, &self.counters)
    }

    /// Hash-and-insert convenience; fails only when the chunk is full of
    /// distinct foreign keys.
    pub fn insert_or_update(&self, key: K, value: V) -> Result<(), InsertError> {
        self.insert(self.hash(&key), key, value)
    }

    /// Looks up `key`, returning the value bundled with the held chunk
    /// lock. Do not call back into this table while the guard lives.
    pub fn lookup(&self, key: &K) -> Option<ValueGuard<'_, V, Spinlock>> {
        let chunk = self.chunk_at(self.hash(key));

        chunk
            .lookup(key)
            .map(|value| ValueGuard::new(value, &chunk.lock))
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.chunk_at(self.hash(key)).remove(key, &self.counters)
    }

    /// Empties the table chunk by chunk. Concurrent writers make the
    /// result approximate; quiesce them first for an exact reset.
    pub fn clear(&self) {
        for chunk in self.chunks.iter() {
            chunk.clear();
        }

        self.counters.reset();
    }

    /// Visits every live entry, chunk by chunk under the chunk lock.
    /// Entries for which the visitor returns [`Visit::Remove`] are
    /// cleared. The visitor must not call back into the table, since the
    /// chunk locks are not recursive.
    pub fn iterate<F: FnMut(&K, &mut V) -> Visit>(&self, mut f: F) {
        for chunk in self.chunks.iter() {
            chunk.visit(&mut f, &self.counters);
        }
    }
}

unsafe impl<K: Send, V: Send, S: Send, const P: usize> Send for HashTable<K, V, S, P> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync, const P: usize> Sync
    for HashTable<K, V, S, P>
{
}
