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

//! Chained hash table with per-chunk locking for multi-writer,
//! multi-reader use.
//!
//! Every primary chunk carries a recursive spinlock; an operation on a
//! key holds that lock for the entire walk of the chunk's chain, so
//! extended chunks need no locks of their own. Extended-chunk allocation
//! is guarded by a single pool spinlock that is only ever acquired while
//! a chunk lock is held; that one nesting is the only nesting in the
//! table and keeps it deadlock-free.
//!
//! `lookup` hands back a [`ValueGuard`]: the value reference and the held
//! chunk lock travel together, and the lock is released when the guard
//! drops. The chunk locks are recursive, so a [`sweep`] callback may call
//! operations that target the chunk being visited; operations against
//! *other* chunks from inside a callback are subject to the caller's own
//! lock ordering.
//!
//! [`sweep`]: HashTable::sweep

use crate::{
    common::{
        boxed_zeroed_slice,
        hash::{default_hash_builder, hash_u32, DefaultHashBuilder},
        lock::{LockGuard, ReentrantSpinlock, Spinlock, ValueGuard},
        stats::{Counters, Stats},
    },
    error::InsertError,
    Visit,
};

use super::chunk::{ChunkCore, Pool, NO_CHUNK, PAIRS_PER_EXTENDED_CHUNK};

use std::{
    hash::{BuildHasher, Hash},
    ptr::NonNull,
};

use log::debug;

#[repr(C, align(64))]
struct Chunk<K, V, const P: usize> {
    lock: ReentrantSpinlock,
    core: ChunkCore<K, V, P>,
}

/// Fixed-capacity chained hash table with a recursive spinlock per
/// primary chunk.
///
/// All operations take `&self`; the table is meant to be shared across
/// threads (typically via `Arc` or shared memory). See the module
/// documentation for the locking discipline.
pub struct HashTable<K, V, S = DefaultHashBuilder, const P: usize = 4> {
    chunks: Box<[Chunk<K, V, P>]>,
    pool: Pool<K, V>,
    pool_lock: Spinlock,
    counters: Counters,
    build_hasher: S,
}

enum FreeSlot {
    Primary(usize),
    Extended(u32, usize),
}

impl<K: Copy + Eq + Hash, V: Copy, const P: usize> HashTable<K, V, DefaultHashBuilder, P> {
    /// Creates a table with `num_chunks` primary chunks and a pool of
    /// `num_extended` extended chunks, using the default fixed-seed
    /// hasher.
    pub fn new(num_chunks: usize, num_extended: usize) -> Self {
        Self::with_hasher(num_chunks, num_extended, default_hash_builder())
    }
}

impl<K: Copy + Eq + Hash, V: Copy, S: BuildHasher, const P: usize> HashTable<K, V, S, P> {
    /// Creates a table that hashes keys with `build_hasher`.
    pub fn with_hasher(num_chunks: usize, num_extended: usize, build_hasher: S) -> Self {
        assert!(num_chunks > 0);
        assert!(P >= 1 && P <= 32);

        let chunks = unsafe { boxed_zeroed_slice(num_chunks) };
        let pool = Pool::new(num_extended);

        debug!(
            "locked chain table: {} chunks of {} pairs, {} extended chunks of {} pairs",
            num_chunks, P, num_extended, PAIRS_PER_EXTENDED_CHUNK
        );

        Self {
            chunks,
            pool,
            pool_lock: Spinlock::default(),
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

    /// Total slots across primary chunks and the extended pool.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * P + self.pool.capacity() * PAIRS_PER_EXTENDED_CHUNK
    }

    /// Samples the health counters. This is an approximate point-in-time
    /// view; see [`Stats`].
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    fn chunk_for(&self, key: &K) -> &Chunk<K, V, P> {
        let hash = hash_u32(&self.build_hasher, key);

        &self.chunks[hash as usize % self.chunks.len()]
    }

    /// Inserts `key`, failing with [`InsertError::Duplicate`] if it is
    /// already present anywhere in its chain and [`InsertError::Full`]
    /// when neither the chain nor the pool has room.
    pub fn insert(&self, key: K, value: V) -> Result<(), InsertError> {
        let chunk = self.chunk_for(&key);
        let _guard = LockGuard::acquire(&chunk.lock);
        let core = &chunk.core;

        // the duplicate check spans the whole chain before any slot is
        // taken; holes in the primary chunk say nothing about the tail
        let mut free = None;

        if unsafe { core.find(&key) }.is_some() {
            return Err(InsertError::Duplicate);
        }

        if let Some(slot) = core.first_free() {
            free = Some(FreeSlot::Primary(slot));
        }

        let mut chain_len = 1u64;
        let mut last = NO_CHUNK;
        let mut id = core.link();

        while id != NO_CHUNK {
            chain_len += 1;

            let extended = self.pool.get(id);

            if unsafe { extended.find(&key) }.is_some() {
                return Err(InsertError::Duplicate);
            }

            if free.is_none() {
                if let Some(slot) = extended.first_free() {
                    free = Some(FreeSlot::Extended(id, slot));
                }
            }

            last = id;
            id = extended.next();
        }

        match free {
            Some(FreeSlot::Primary(slot)) => unsafe {
                core.write_pair(slot, key, value);
                core.set_valid(slot);
            },
            Some(FreeSlot::Extended(id, slot)) => {
                let extended = self.pool.get(id);

                unsafe { extended.write_pair(slot, key, value) };
                extended.set_valid(slot);
            }
            None => {
                // pool lock nests inside the chunk lock, never the other
                // way around
                let allocated = {
                    let _pool_guard = LockGuard::acquire(&self.pool_lock);

                    self.pool.allocate()
                };

                let new_id = match allocated {
                    Some(id) => id,
                    None => {
                        self.counters.note_insert_failed();

                        return Err(InsertError::Full);
                    }
                };

                let extended = self.pool.get(new_id);

                unsafe { extended.write_pair(0, key, value) };
                extended.set_valid(0);

                if last == NO_CHUNK {
                    core.set_link(new_id);
                } else {
                    self.pool.get(last).set_next(new_id);
                }

                chain_len += 1;
                self.counters.extended_added();
            }
        }

        self.counters.pair_added();
        self.counters.note_chain_len(chain_len);

        Ok(())
    }

    /// Looks up `key`, returning the value bundled with the held chunk
    /// lock. The lock is released when the guard is dropped; the value is
    /// valid exactly that long.
    pub fn lookup(&self, key: &K) -> Option<ValueGuard<'_, V, ReentrantSpinlock>> {
        let chunk = self.chunk_for(key);

        chunk.lock.lock();

        let found = unsafe {
            let core = &chunk.core;

            if let Some(slot) = core.find(key) {
                Some(core.value_ptr(slot))
            } else {
                let mut id = core.link();
                let mut found = None;

                while id != NO_CHUNK {
                    let extended = self.pool.get(id);

                    if let Some(slot) = extended.find(key) {
                        found = Some(extended.value_ptr(slot));
                        break;
                    }

                    id = extended.next();
                }

                found
            }
        };

        match found {
            Some(value) => {
                Some(ValueGuard::new(
                    unsafe { NonNull::new_unchecked(value) },
                    &chunk.lock,
                ))
            }
            None => {
                chunk.lock.unlock();

                None
            }
        }
    }

    /// Removes `key`, returning whether it was present. An extended chunk
    /// whose last slot is cleared is unlinked and returned to the pool.
    pub fn remove(&self, key: &K) -> bool {
        let chunk = self.chunk_for(key);
        let _guard = LockGuard::acquire(&chunk.lock);
        let core = &chunk.core;

        if let Some(slot) = unsafe { core.find(key) } {
            core.clear_valid(slot);
            self.counters.pair_removed();

            return true;
        }

        let mut prev = NO_CHUNK;
        let mut id = core.link();

        while id != NO_CHUNK {
            let extended = self.pool.get(id);
            let next = extended.next();

            if let Some(slot) = unsafe { extended.find(key) } {
                extended.clear_valid(slot);

                if extended.key_valids() == 0 {
                    if prev == NO_CHUNK {
                        core.set_link(next);
                    } else {
                        self.pool.get(prev).set_next(next);
                    }

                    let _pool_guard = LockGuard::acquire(&self.pool_lock);

                    self.pool.release(id);
                    self.counters.extended_removed();
                }

                self.counters.pair_removed();

                return true;
            }

            prev = id;
            id = next;
        }

        false
    }

    /// Empties the table, taking each chunk lock in turn and then the
    /// pool lock. Concurrent writers make the result approximate; quiesce
    /// them first for an exact reset.
    pub fn clear(&self) {
        for chunk in self.chunks.iter() {
            let _guard = LockGuard::acquire(&chunk.lock);

            chunk.core.reset();
        }

        let _pool_guard = LockGuard::acquire(&self.pool_lock);

        self.pool.reset();
        self.counters.reset();
    }

    /// Externally driven sweep: walks chunks in order, locking each,
    /// applying the predicate `f` to every live entry. Entries for which
    /// `f` returns [`Visit::Remove`] are cleared; emptied extended chunks
    /// return to the pool. The table never schedules sweeps on its own.
    ///
    /// The chunk locks are recursive, so `f` may call `lookup` (or mutate
    /// values through the returned guard) on the chunk it is visiting.
    /// Removal of swept entries must be expressed through the return
    /// value, not by calling `remove` from inside `f`: a structural
    /// change to the chain being walked would pull the chunks out from
    /// under the sweep.
    pub fn sweep<F: FnMut(&K, &V) -> Visit>(&self, mut f: F) {
        for chunk in self.chunks.iter() {
            let _guard = LockGuard::acquire(&chunk.lock);
            let core = &chunk.core;

            for slot in 0..P {
                if core.valid_mask() & (1 << slot) == 0 {
                    continue;
                }

                let key = unsafe { core.key(slot) };
                let value = unsafe { &*core.value_ptr(slot) };

                // re-check before clearing: the predicate may have
                // touched this chunk through the table
                if f(&key, value) == Visit::Remove
                    && core.valid_mask() & (1 << slot) != 0
                    && unsafe { core.key(slot) } == key
                {
                    core.clear_valid(slot);
                    self.counters.pair_removed();
                }
            }

            let mut prev = NO_CHUNK;
            let mut id = core.link();

            while id != NO_CHUNK {
                let extended = self.pool.get(id);
                let next = extended.next();

                for slot in 0..PAIRS_PER_EXTENDED_CHUNK {
                    if extended.key_valids() & (1 << slot) == 0 {
                        continue;
                    }

                    let key = unsafe { extended.key(slot) };
                    let value = unsafe { &*extended.value_ptr(slot) };

                    if f(&key, value) == Visit::Remove
                        && extended.key_valids() & (1 << slot) != 0
                        && unsafe { extended.key(slot) } == key
                    {
                        extended.clear_valid(slot);
                        self.counters.pair_removed();
                    }
                }

                if extended.key_valids() == 0 {
                    if prev == NO_CHUNK {
                        core.set_link(next);
                    } else {
                        self.pool.get(prev).set_next(next);
                    }

                    let _pool_guard = LockGuard::acquire(&self.pool_lock);

                    self.pool.release(id);
                    self.counters.extended_removed();
                } else {
                    prev = id;
                }

                id = next;
            }
        }
    }
}

unsafe impl<K: Send, V: Send, S: Send, const P: usize> Send for HashTable<K, V, S, P> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync, const P: usize> Sync
    for HashTable<K, V, S, P>
{
}
