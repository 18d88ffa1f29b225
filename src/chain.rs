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

//! Chain-with-overflow hash table, externally synchronized.
//!
//! The table is a contiguous array of cache-line-aligned primary chunks
//! plus a pre-sized pool of smaller extended chunks. A key hashes to one
//! primary chunk; when that chunk fills, the chain grows by linking
//! extended chunks from the pool:
//!
//! ```text
//!    primary chunk                     extended chunks (pool)
//!    ┌──────┬──────┬────┬────┬────┐    ┌───────┬────┬────┬────┬────┐
//!    │valid │chain │pair│pair│pair│    │next+  │pair│pair│pair│pair│
//!    │mask  │link  │ 0  │ 1  │ .. │───▶│valids │ 0  │ 1  │ 2  │ 3  │──▶ …
//!    └──────┴──────┴────┴────┴────┘    └───────┴────┴────┴────┴────┘
//! ```
//!
//! Chain links are 1-based 24-bit ids into the pool, never pointers, so a
//! table image can be mapped by multiple processes.
//!
//! This variant provides no internal synchronization: mutation requires
//! `&mut self`, and callers that share a table across threads wrap it in
//! their own mutual exclusion. [`locked::HashTable`] is the fine-grained
//! concurrent sibling. Validity bits are still published with release
//! stores and read with acquire loads, so an image behaves identically
//! under the locked variant's protocol.

pub(crate) mod chunk;
pub mod locked;

use crate::{
    common::{
        boxed_zeroed_slice,
        hash::{default_hash_builder, hash_u32, DefaultHashBuilder},
        stats::{LocalCounters, Stats},
    },
    error::InsertError,
    Visit,
};

use chunk::{ChunkCore, Pool, NO_CHUNK, PAIRS_PER_EXTENDED_CHUNK};

use std::hash::{BuildHasher, Hash};

use log::debug;

#[repr(C, align(64))]
struct Chunk<K, V, const P: usize> {
    core: ChunkCore<K, V, P>,
}

/// Fixed-capacity chained hash table for single-threaded or externally
/// synchronized use.
///
/// `P` is the pair count of a primary chunk (at most 32, bounded by the
/// validity mask width); extended chunks always hold four pairs. Keys and
/// values are stored by value and must be trivially copyable.
pub struct HashTable<K, V, S = DefaultHashBuilder, const P: usize = 4> {
    chunks: Box<[Chunk<K, V, P>]>,
    pool: Pool<K, V>,
    counters: LocalCounters,
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

        // all-zero is the valid empty state of every chunk
        let chunks = unsafe { boxed_zeroed_slice(num_chunks) };
        let pool = Pool::new(num_extended);

        debug!(
            "chain table: {} chunks of {} pairs, {} extended chunks of {} pairs",
            num_chunks, P, num_extended, PAIRS_PER_EXTENDED_CHUNK
        );

        Self {
            chunks,
            pool,
            counters: LocalCounters::default(),
            build_hasher,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.counters.pairs as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slots across primary chunks and the extended pool.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * P + self.pool.capacity() * PAIRS_PER_EXTENDED_CHUNK
    }

    /// Current health counters.
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    fn chunk_index(&self, hash: u32) -> usize {
        hash as usize % self.chunks.len()
    }

    /// Inserts `key`, failing with [`InsertError::Duplicate`] if it is
    /// already present anywhere in its chain and [`InsertError::Full`]
    /// when neither the chain nor the pool has room.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), InsertError> {
        let index = self.chunk_index(hash_u32(&self.build_hasher, &key));
        let core = &self.chunks[index].core;

        // the duplicate check must span the whole chain: a hole in the
        // primary chunk does not mean the key is absent further down
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
                let new_id = match self.pool.allocate() {
                    Some(id) => id,
                    None => {
                        self.counters.insert_failed += 1;

                        return Err(InsertError::Full);
                    }
                };

                let extended = self.pool.get(new_id);

                unsafe { extended.write_pair(0, key, value) };
                extended.set_valid(0);

                let core = &self.chunks[index].core;

                if last == NO_CHUNK {
                    core.set_link(new_id);
                } else {
                    self.pool.get(last).set_next(new_id);
                }

                chain_len += 1;
                self.counters.extended_chunks_used += 1;
            }
        }

        self.counters.pairs += 1;
        self.counters.note_chain_len(chain_len);

        Ok(())
    }

    /// Returns a reference to the value stored for `key`.
    pub fn lookup(&self, key: &K) -> Option<&V> {
        let index = self.chunk_index(hash_u32(&self.build_hasher, key));
        let core = &self.chunks[index].core;

        unsafe {
            if let Some(slot) = core.find(key) {
                return Some(&*core.value_ptr(slot));
            }

            let mut id = core.link();

            while id != NO_CHUNK {
                let extended = self.pool.get(id);

                if let Some(slot) = extended.find(key) {
                    return Some(&*extended.value_ptr(slot));
                }

                id = extended.next();
            }
        }

        None
    }

    /// Returns a mutable reference to the value stored for `key`.
    pub fn lookup_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.chunk_index(hash_u32(&self.build_hasher, key));
        let core = &self.chunks[index].core;

        unsafe {
            if let Some(slot) = core.find(key) {
                return Some(&mut *core.value_ptr(slot));
            }

            let mut id = core.link();

            while id != NO_CHUNK {
                let extended = self.pool.get(id);

                if let Some(slot) = extended.find(key) {
                    return Some(&mut *extended.value_ptr(slot));
                }

                id = extended.next();
            }
        }

        None
    }

    /// Removes `key`, returning whether it was present. An extended chunk
    /// whose last slot is cleared is unlinked and returned to the pool.
    pub fn remove(&mut self, key: &K) -> bool {
        let index = self.chunk_index(hash_u32(&self.build_hasher, key));
        let core = &self.chunks[index].core;

        if let Some(slot) = unsafe { core.find(key) } {
            core.clear_valid(slot);
            self.counters.pairs -= 1;

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

                    self.pool.release(id);
                    self.counters.extended_chunks_used -= 1;
                }

                self.counters.pairs -= 1;

                return true;
            }

            prev = id;
            id = next;
        }

        false
    }

    /// Empties the table: clears every validity mask, severs every chain,
    /// returns all extended chunks to the pool, and resets the counters.
    pub fn clear(&mut self) {
        for chunk in self.chunks.iter() {
            chunk.core.reset();
        }

        self.pool.reset();
        self.counters.reset();
    }

    /// Visits every live entry in chunk order. Entries for which the
    /// visitor returns [`Visit::Remove`] are removed; emptied extended
    /// chunks return to the pool.
    pub fn iterate<F: FnMut(&K, &mut V) -> Visit>(&mut self, mut f: F) {
        for index in 0..self.chunks.len() {
            let core = &self.chunks[index].core;

            let mut mask = core.valid_mask();

            while mask != 0 {
                let slot = mask.trailing_zeros() as usize;
                mask &= mask - 1;

                let key = unsafe { core.key(slot) };
                let value = unsafe { &mut *core.value_ptr(slot) };

                if f(&key, value) == Visit::Remove {
                    core.clear_valid(slot);
                    self.counters.pairs -= 1;
                }
            }

            let mut prev = NO_CHUNK;
            let mut id = core.link();

            while id != NO_CHUNK {
                let extended = self.pool.get(id);
                let next = extended.next();

                let mut valids = extended.key_valids();

                while valids != 0 {
                    let slot = valids.trailing_zeros() as usize;
                    valids &= valids - 1;

                    let key = unsafe { extended.key(slot) };
                    let value = unsafe { &mut *extended.value_ptr(slot) };

                    if f(&key, value) == Visit::Remove {
                        extended.clear_valid(slot);
                        self.counters.pairs -= 1;
                    }
                }

                if extended.key_valids() == 0 {
                    if prev == NO_CHUNK {
                        core.set_link(next);
                    } else {
                        self.pool.get(prev).set_next(next);
                    }

                    self.pool.release(id);
                    self.counters.extended_chunks_used -= 1;
                } else {
                    prev = id;
                }

                id = next;
            }
        }
    }
}

unsafe impl<K: Send, V: Send, S: Send, const P: usize> Send for HashTable<K, V, S, P> {}
unsafe impl<K: Sync, V: Sync, S: Sync, const P: usize> Sync for HashTable<K, V, S, P> {}
